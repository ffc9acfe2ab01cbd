//! Row-change notifications over the backend's realtime websocket.
//!
//! A single connection task owns the socket. Handles talk to it through a
//! command queue; each subscription gets its own bounded event queue.

mod channels;
mod connection;
mod message;
mod subscription;

use crate::{
    ChangeFeed,
    client::{BackendConfig, RemoteError, Result},
    realtime::{
        channels::{Channels, Command},
        message::ChangeFilter,
    },
};
use blogmaster_common::{
    cache::Record,
    model::{
        auth::AccessToken,
        comment::Comment,
        post::{Post, PostId},
    },
};
use serde::de::DeserializeOwned;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;
use url::Url;

pub use subscription::{Subscription, SubscriptionState};

const PROTOCOL_VERSION: &str = "1.0.0";

/// Handle to the realtime connection. Cloning shares the connection; it is
/// closed once the last handle is dropped.
#[derive(Clone, Debug)]
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    _shutdown: Arc<DropGuard>,
}

impl RealtimeClient {
    /// Spawns the connection task. Has to be called within a tokio runtime.
    pub fn connect(config: &BackendConfig) -> Result<Self> {
        let url = websocket_url(config)?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(connection::run(
            url,
            Channels::new(config.api_key.clone()),
            receiver,
            shutdown.clone(),
        ));

        Ok(Self {
            commands,
            next_id: Arc::new(AtomicU64::new(0)),
            _shutdown: Arc::new(shutdown.drop_guard()),
        })
    }

    fn subscribe<T>(&self, topic: String, filter: ChangeFilter) -> Subscription<T>
    where
        T: Record + DeserializeOwned + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let commands = self.commands.clone();
        let (sink, state, subscription) = Subscription::attached(
            topic.clone(),
            Box::new(move || {
                let _ = commands.send(Command::Leave { id });
            }),
        );

        debug!(%topic, "Subscribing");
        // If the connection task is gone, the subscription simply never turns
        // active and ends on the first receive.
        let _ = self.commands.send(Command::Join {
            id,
            topic,
            filter,
            sink: Box::new(sink),
            state,
        });

        subscription
    }
}

impl ChangeFeed for RealtimeClient {
    fn subscribe_posts(&self) -> Subscription<Post> {
        self.subscribe(
            "realtime:posts-changes".to_owned(),
            ChangeFilter {
                table: "posts",
                rows: None,
            },
        )
    }

    fn subscribe_comments(&self, post_id: PostId) -> Subscription<Comment> {
        self.subscribe(
            format!("realtime:comments-{post_id}"),
            ChangeFilter {
                table: "comments",
                rows: Some(format!("post_id=eq.{post_id}")),
            },
        )
    }

    fn set_access_token(&self, access_token: Option<AccessToken>) {
        let _ = self.commands.send(Command::AccessToken(access_token));
    }
}

pub(crate) fn websocket_url(config: &BackendConfig) -> Result<Url> {
    let mut url = config.base_url()?.join("realtime/v1/websocket")?;

    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| RemoteError::UnsupportedScheme(url.scheme().to_owned()))?;
    url.query_pairs_mut()
        .append_pair("apikey", config.api_key.expose())
        .append_pair("vsn", PROTOCOL_VERSION);

    Ok(url)
}
