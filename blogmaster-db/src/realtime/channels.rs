//! Channel bookkeeping of the realtime connection, free of any IO.
//!
//! The connection task feeds commands, received frames and connection events
//! in; every call answers with the frames that have to go out.

use crate::{
    client::ApiKey,
    realtime::{
        message::{ChangeFilter, Event, Frame, PHOENIX_TOPIC, ReplyPayload, ReplyStatus},
        subscription::{ChangeSink, Delivery, SubscriptionState},
    },
};
use blogmaster_common::model::auth::AccessToken;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

pub(crate) enum Command {
    Join {
        id: u64,
        topic: String,
        filter: ChangeFilter,
        sink: Box<dyn ChangeSink>,
        state: watch::Sender<SubscriptionState>,
    },
    Leave {
        id: u64,
    },
    AccessToken(Option<AccessToken>),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Error)]
#[error("The previous heartbeat was never answered")]
pub(crate) struct HeartbeatTimeout;

struct Channel {
    topic: String,
    filter: ChangeFilter,
    sink: Box<dyn ChangeSink>,
    state: watch::Sender<SubscriptionState>,
    /// Reference of the join in flight or in effect on the current socket.
    join_ref: Option<String>,
    /// Whether the backend ever confirmed a join of this channel.
    confirmed: bool,
}

impl Channel {
    fn set_state(&self, state: SubscriptionState) {
        self.state.send_replace(state);
    }
}

pub(crate) struct Channels {
    api_key: ApiKey,
    access_token: Option<AccessToken>,
    channels: BTreeMap<u64, Channel>,
    connected: bool,
    next_ref: u64,
    pending_heartbeat: Option<String>,
}

impl Channels {
    pub fn new(api_key: ApiKey) -> Self {
        Self {
            api_key,
            access_token: None,
            channels: BTreeMap::new(),
            connected: false,
            next_ref: 0,
            pending_heartbeat: None,
        }
    }

    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn bearer(&self) -> &str {
        self.access_token
            .as_ref()
            .map_or(self.api_key.expose(), AccessToken::expose)
    }

    fn join(&mut self, id: u64) -> Option<Frame> {
        let reference = self.make_ref();
        let payload = {
            let channel = self.channels.get(&id)?;
            channel.filter.join_payload(self.bearer())
        };
        let channel = self.channels.get_mut(&id)?;

        channel.join_ref = Some(reference.clone());
        channel.set_state(SubscriptionState::Subscribing);
        debug!(topic = %channel.topic, "Joining channel");

        Some(Frame {
            topic: channel.topic.clone(),
            event: Event::PhxJoin,
            payload,
            reference: Some(reference.clone()),
            join_ref: Some(reference),
        })
    }

    fn leave(&mut self, channel: &Channel) -> Option<Frame> {
        let join_ref = channel.join_ref.clone()?;
        if !self.connected {
            return None;
        }

        Some(Frame {
            topic: channel.topic.clone(),
            event: Event::PhxLeave,
            payload: json!({}),
            reference: Some(self.make_ref()),
            join_ref: Some(join_ref),
        })
    }

    fn remove(&mut self, id: u64) -> Option<Frame> {
        let channel = self.channels.remove(&id)?;
        channel.set_state(SubscriptionState::Unsubscribed);
        debug!(topic = %channel.topic, "Leaving channel");
        self.leave(&channel)
    }

    fn find_joined(&self, topic: &str, join_ref: Option<&str>) -> Option<u64> {
        self.channels.iter().find_map(|(id, channel)| {
            let joined = channel.join_ref.as_deref().is_some_and(|current| {
                join_ref.is_none_or(|join_ref| join_ref == current)
            });
            (channel.topic == topic && joined).then_some(*id)
        })
    }

    pub fn command(&mut self, command: Command) -> Vec<Frame> {
        let mut frames = Vec::new();

        match command {
            Command::Join {
                id,
                topic,
                filter,
                sink,
                state,
            } => {
                // A topic can only be joined once per socket.
                let previous: Vec<u64> = self
                    .channels
                    .iter()
                    .filter(|(_, channel)| channel.topic == topic)
                    .map(|(id, _)| *id)
                    .collect();
                frames.extend(previous.into_iter().filter_map(|id| self.remove(id)));

                self.channels.insert(
                    id,
                    Channel {
                        topic,
                        filter,
                        sink,
                        state,
                        join_ref: None,
                        confirmed: false,
                    },
                );
                if self.connected {
                    frames.extend(self.join(id));
                }
            }
            Command::Leave { id } => frames.extend(self.remove(id)),
            Command::AccessToken(access_token) => {
                self.access_token = access_token;
                if self.connected {
                    let bearer = self.bearer().to_owned();
                    let joined: Vec<(String, String)> = self
                        .channels
                        .values()
                        .filter_map(|channel| {
                            Some((channel.topic.clone(), channel.join_ref.clone()?))
                        })
                        .collect();

                    for (topic, join_ref) in joined {
                        frames.push(Frame {
                            topic,
                            event: Event::AccessToken,
                            payload: json!({ "access_token": bearer }),
                            reference: Some(self.make_ref()),
                            join_ref: Some(join_ref),
                        });
                    }
                }
            }
        }

        frames
    }

    /// A fresh socket is up: (re)join everything.
    pub fn connected(&mut self) -> Vec<Frame> {
        self.connected = true;
        self.pending_heartbeat = None;

        let ids: Vec<u64> = self.channels.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.join(id)).collect()
    }

    pub fn disconnected(&mut self) {
        self.connected = false;
        self.pending_heartbeat = None;

        for channel in self.channels.values_mut() {
            channel.join_ref = None;
            if *channel.state.borrow() != SubscriptionState::Unsubscribed {
                channel.set_state(SubscriptionState::Subscribing);
            }
        }
    }

    pub fn heartbeat(&mut self) -> Result<Frame, HeartbeatTimeout> {
        if self.pending_heartbeat.is_some() {
            return Err(HeartbeatTimeout);
        }

        let reference = self.make_ref();
        self.pending_heartbeat = Some(reference.clone());
        Ok(Frame {
            topic: PHOENIX_TOPIC.to_owned(),
            event: Event::Heartbeat,
            payload: json!({}),
            reference: Some(reference),
            join_ref: None,
        })
    }

    pub fn receive(&mut self, frame: Frame) -> Vec<Frame> {
        match frame.event {
            Event::PhxReply if frame.topic == PHOENIX_TOPIC => {
                if frame.reference.is_some() && frame.reference == self.pending_heartbeat {
                    self.pending_heartbeat = None;
                }
                Vec::new()
            }
            Event::PhxReply => {
                self.on_reply(&frame);
                Vec::new()
            }
            Event::PostgresChanges => self.on_change(frame),
            Event::PhxError => self.on_error(&frame),
            Event::PhxClose => {
                if let Some(id) = self.find_joined(&frame.topic, frame.join_ref.as_deref())
                    && let Some(channel) = self.channels.get_mut(&id)
                {
                    info!(topic = %frame.topic, "Channel closed by the server");
                    channel.join_ref = None;
                    channel.set_state(SubscriptionState::Unsubscribed);
                }
                Vec::new()
            }
            Event::System => {
                let status = frame.payload.get("status").and_then(Value::as_str);
                if status == Some("error") {
                    warn!(topic = %frame.topic, payload = %frame.payload, "Realtime system error");
                } else {
                    debug!(topic = %frame.topic, payload = %frame.payload, "Realtime system message");
                }
                Vec::new()
            }
            _ => {
                trace!(topic = %frame.topic, event = ?frame.event, "Ignoring frame");
                Vec::new()
            }
        }
    }

    fn on_reply(&mut self, frame: &Frame) {
        // Only replies to joins matter; their ref is the join ref.
        let Some(reference) = frame.reference.as_deref() else {
            return;
        };
        let Some(channel) = self.channels.values_mut().find(|channel| {
            channel.topic == frame.topic && channel.join_ref.as_deref() == Some(reference)
        }) else {
            return;
        };

        let reply = match serde_json::from_value::<ReplyPayload>(frame.payload.clone()) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, topic = %frame.topic, "Malformed join reply");
                return;
            }
        };

        match reply.status {
            ReplyStatus::Ok => {
                info!(topic = %frame.topic, "Subscribed to changes");
                let rejoined = channel.confirmed;
                channel.confirmed = true;
                channel.set_state(SubscriptionState::Active);

                // Whatever changed while the channel was down is lost.
                if rejoined {
                    channel.sink.lagged();
                }
            }
            ReplyStatus::Error | ReplyStatus::Other => {
                warn!(topic = %frame.topic, response = %reply.response, "Channel join refused");
                channel.join_ref = None;
                channel.set_state(SubscriptionState::Unsubscribed);
            }
        }
    }

    fn on_change(&mut self, frame: Frame) -> Vec<Frame> {
        let Some(id) = self.find_joined(&frame.topic, None) else {
            trace!(topic = %frame.topic, "Change for an unknown channel");
            return Vec::new();
        };
        let Some(channel) = self.channels.get(&id) else {
            return Vec::new();
        };

        match channel.sink.deliver(frame.payload) {
            Delivery::Delivered => Vec::new(),
            Delivery::Closed => self.remove(id).into_iter().collect(),
        }
    }

    fn on_error(&mut self, frame: &Frame) -> Vec<Frame> {
        let Some(id) = self.find_joined(&frame.topic, frame.join_ref.as_deref()) else {
            return Vec::new();
        };

        warn!(topic = %frame.topic, "Channel crashed, rejoining");
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.join_ref = None;
        }
        self.join(id).into_iter().collect()
    }
}
