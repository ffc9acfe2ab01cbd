use crate::realtime::message::decode_change;
use blogmaster_common::cache::{FeedEvent, Record};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::warn;

/// Events buffered per subscription before it is marked as lagged.
pub(crate) const SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub(crate) enum Delivery {
    Delivered,
    /// The [`Subscription`] is gone.
    Closed,
}

/// Type-erased receiving end of a channel, owned by the connection task.
pub(crate) trait ChangeSink: Send {
    fn deliver(&self, payload: Value) -> Delivery;

    fn lagged(&self) -> Delivery;
}

pub(crate) struct TypedSink<T: Record> {
    sender: mpsc::Sender<FeedEvent<T>>,
    lagged: Arc<AtomicBool>,
}

impl<T: Record> TypedSink<T> {
    fn push(&self, event: FeedEvent<T>) -> Delivery {
        match self.sender.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                self.lagged.store(true, Ordering::Release);
                Delivery::Delivered
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

impl<T> ChangeSink for TypedSink<T>
where
    T: Record + DeserializeOwned + Send,
{
    fn deliver(&self, payload: Value) -> Delivery {
        if self.sender.is_closed() {
            return Delivery::Closed;
        }

        match decode_change::<T>(payload) {
            Ok(Some(change)) => self.push(FeedEvent::Change(change)),
            Ok(None) => Delivery::Delivered,
            Err(err) => {
                warn!(%err, "Undecodable change event, forcing a reload");
                self.lagged()
            }
        }
    }

    fn lagged(&self) -> Delivery {
        self.push(FeedEvent::Lagged)
    }
}

/// Receiving end of a change subscription for one scope.
///
/// Events arrive in the order the backend sent them. When the buffer
/// overflows or the connection had to be re-established, the pending events
/// are discarded and a single [`FeedEvent::Lagged`] is handed out instead.
pub struct Subscription<T: Record> {
    topic: String,
    events: mpsc::Receiver<FeedEvent<T>>,
    lagged: Arc<AtomicBool>,
    state: watch::Receiver<SubscriptionState>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl<T: Record> Subscription<T> {
    pub(crate) fn attached(
        topic: String,
        on_drop: Box<dyn FnOnce() + Send>,
    ) -> (TypedSink<T>, watch::Sender<SubscriptionState>, Self) {
        let (sender, events) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let (state_sender, state) = watch::channel(SubscriptionState::Subscribing);
        let lagged = Arc::new(AtomicBool::new(false));

        let sink = TypedSink {
            sender,
            lagged: Arc::clone(&lagged),
        };
        let subscription = Self {
            topic,
            events,
            lagged,
            state,
            on_drop: Some(on_drop),
        };

        (sink, state_sender, subscription)
    }

    /// A subscription fed by hand instead of by a backend connection.
    ///
    /// It reports itself as active and ends once the sender is dropped. Meant
    /// for test doubles of [`ChangeFeed`](crate::ChangeFeed).
    #[cfg(any(test, feature = "test-util"))]
    #[must_use]
    pub fn detached(topic: impl Into<String>) -> (mpsc::Sender<FeedEvent<T>>, Self) {
        let (sender, events) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let (_, state) = watch::channel(SubscriptionState::Active);

        let subscription = Self {
            topic: topic.into(),
            events,
            lagged: Arc::new(AtomicBool::new(false)),
            state,
            on_drop: None,
        };

        (sender, subscription)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Waits for the next event. Returns `None` once the feed has shut down.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<FeedEvent<T>> {
        if let Some(lagged) = self.take_lagged() {
            return Some(lagged);
        }

        let event = self.events.recv().await?;
        Some(self.take_lagged().unwrap_or(event))
    }

    fn take_lagged(&mut self) -> Option<FeedEvent<T>> {
        if !self.lagged.swap(false, Ordering::AcqRel) {
            return None;
        }

        while self.events.try_recv().is_ok() {}
        Some(FeedEvent::Lagged)
    }
}

impl<T: Record> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl<T: Record> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
