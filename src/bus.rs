//! Filtered event subscriptions keyed by call id and event type

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{
    error::EslResult,
    event::EslEventType,
    protocol::EslMessage,
    stream::{MessageFeed, MessageStream, NextMessage},
};

/// Which events a wait or subscription wants.
///
/// All given criteria must hold. An empty event type set matches any event
/// type, as does [`EslEventType::All`]. Non-event messages never match.
///
/// ```
/// use freeswitch_esl_inbound::{EslEventType, EventFilter};
///
/// let filter = EventFilter::call("7f4de4bc")
///     .with_event_type(EslEventType::ChannelAnswer)
///     .with_event_type(EslEventType::ChannelHangup);
/// assert_eq!(filter.call_id(), Some("7f4de4bc"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    call_id: Option<String>,
    event_types: Vec<EslEventType>,
}

impl EventFilter {
    /// Matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches every event of one call.
    pub fn call(call_id: impl Into<String>) -> Self {
        Self::any().with_call_id(call_id)
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_event_type(mut self, event_type: EslEventType) -> Self {
        if !self
            .event_types
            .contains(&event_type)
        {
            self.event_types
                .push(event_type);
        }
        self
    }

    pub fn with_event_types(self, event_types: impl IntoIterator<Item = EslEventType>) -> Self {
        event_types
            .into_iter()
            .fold(self, Self::with_event_type)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id
            .as_deref()
    }

    pub fn event_types(&self) -> &[EslEventType] {
        &self.event_types
    }

    pub fn matches(&self, message: &EslMessage) -> bool {
        if !message.is_event() {
            return false;
        }
        if let Some(call_id) = &self.call_id {
            if message.call_id() != Some(call_id.as_str()) {
                return false;
            }
        }
        if self
            .event_types
            .is_empty()
            || self
                .event_types
                .contains(&EslEventType::All)
        {
            return true;
        }
        message
            .event_type()
            .is_some_and(|t| {
                self.event_types
                    .contains(&t)
            })
    }
}

/// One-shot and continuous event subscriptions over a [`MessageStream`].
#[derive(Debug, Clone)]
pub struct EventBus {
    stream: MessageStream,
}

impl EventBus {
    pub fn new(stream: MessageStream) -> Self {
        Self { stream }
    }

    /// Register a wait for the next event matching `filter`.
    pub fn next_matching(&self, filter: EventFilter) -> NextMessage {
        self.stream
            .next_matching(move |message| filter.matches(message))
    }

    /// Wait up to `limit` for the next event matching `filter`.
    pub async fn first_matching(
        &self,
        filter: EventFilter,
        limit: Duration,
    ) -> EslResult<Arc<EslMessage>> {
        self.next_matching(filter)
            .wait(limit)
            .await
    }

    /// Pull-based view of matching events.
    pub fn stream(&self, filter: EventFilter) -> EslEventStream {
        EslEventStream {
            feed: self
                .stream
                .every_matching(move |message| filter.matches(message)),
        }
    }

    /// Run `handler` for every event matching `filter`, on its own task,
    /// until the returned handle is disposed or the connection ends.
    ///
    /// Dropping the handle does not dispose the subscription. A handler that
    /// panics disposes its own subscription. Must be called inside a tokio
    /// runtime.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionHandle
    where
        F: FnMut(Arc<EslMessage>) + Send + 'static,
    {
        let shared = Arc::new(SubscriptionShared {
            active: AtomicBool::new(true),
            cancelled: Notify::new(),
            filter: filter.clone(),
        });
        let feed = self
            .stream
            .every_matching(move |message| filter.matches(message));
        tokio::spawn(run_subscription(shared.clone(), feed, handler));
        SubscriptionHandle { shared }
    }
}

async fn run_subscription<F>(shared: Arc<SubscriptionShared>, mut feed: MessageFeed, mut handler: F)
where
    F: FnMut(Arc<EslMessage>) + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = shared.cancelled.notified() => break,
            item = feed.recv() => match item {
                Some(Ok(message)) => {
                    if !shared.is_active() {
                        break;
                    }
                    let call = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message)));
                    if call.is_err() {
                        warn!("Event handler panicked, disposing subscription");
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("Subscription ended: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    shared
        .active
        .store(false, Ordering::Release);
}

struct SubscriptionShared {
    active: AtomicBool,
    cancelled: Notify,
    filter: EventFilter,
}

impl SubscriptionShared {
    fn is_active(&self) -> bool {
        self.active
            .load(Ordering::Acquire)
    }
}

/// Cancellation handle for a subscription created by [`EventBus::subscribe`].
///
/// Clones refer to the same subscription, so a handler may hold one and
/// dispose itself.
#[derive(Clone)]
pub struct SubscriptionHandle {
    shared: Arc<SubscriptionShared>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("filter", &self.shared.filter)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SubscriptionHandle {
    /// Stop the subscription. The handler is not called again once this
    /// returns, apart from a call already in progress on another thread.
    ///
    /// Returns `true` for the call that actually disposed it.
    pub fn dispose(&self) -> bool {
        if self
            .shared
            .active
            .swap(false, Ordering::AcqRel)
        {
            self.shared
                .cancelled
                .notify_one();
            true
        } else {
            false
        }
    }

    /// `false` after disposal, a handler panic, or connection teardown.
    pub fn is_active(&self) -> bool {
        self.shared
            .is_active()
    }

    pub fn filter(&self) -> &EventFilter {
        &self.shared.filter
    }
}

/// Stream of events matching a filter.
///
/// Yields events in arrival order, then a single
/// [`StreamClosed`](crate::EslError::StreamClosed) error when the connection
/// ends, then `None`. Also usable as a [`futures_util::Stream`].
#[derive(Debug)]
pub struct EslEventStream {
    feed: MessageFeed,
}

impl EslEventStream {
    pub async fn recv(&mut self) -> Option<EslResult<Arc<EslMessage>>> {
        self.feed
            .recv()
            .await
    }
}

impl futures_util::Stream for EslEventStream {
    type Item = EslResult<Arc<EslMessage>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.feed
            .poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EslError;
    use crate::protocol::ContentType;
    use crate::stream::DisconnectReason;
    use futures_util::StreamExt;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn event(name: &str, call_id: &str) -> EslMessage {
        EslMessage::event([("Event-Name", name), ("Unique-ID", call_id)], None)
    }

    async fn settle_tasks() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_filter_matching() {
        let answer = event("CHANNEL_ANSWER", "a");
        let other_call = event("CHANNEL_ANSWER", "b");
        let hangup = event("CHANNEL_HANGUP", "a");
        let reply = EslMessage::new(ContentType::CommandReply, HashMap::new(), None);

        let filter = EventFilter::call("a").with_event_type(EslEventType::ChannelAnswer);
        assert!(filter.matches(&answer));
        assert!(!filter.matches(&other_call));
        assert!(!filter.matches(&hangup));

        let any_event_of_a = EventFilter::call("a");
        assert!(any_event_of_a.matches(&hangup));

        assert!(EventFilter::any().matches(&other_call));
        assert!(!EventFilter::any().matches(&reply));
        assert!(EventFilter::any()
            .with_event_type(EslEventType::All)
            .matches(&hangup));
    }

    #[test]
    fn test_filter_deduplicates_event_types() {
        let filter = EventFilter::any().with_event_types([
            EslEventType::ChannelAnswer,
            EslEventType::ChannelAnswer,
            EslEventType::ChannelHangup,
        ]);
        assert_eq!(
            filter.event_types(),
            &[EslEventType::ChannelAnswer, EslEventType::ChannelHangup]
        );
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_in_order() {
        let stream = MessageStream::new();
        let bus = EventBus::new(stream.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = bus.subscribe(EventFilter::call("a"), move |message| {
            let _ = tx.send(
                message
                    .event_type()
                    .map(|t| t.to_string()),
            );
        });

        stream.publish(event("CHANNEL_PROGRESS", "a"));
        stream.publish(event("CHANNEL_ANSWER", "b"));
        stream.publish(event("CHANNEL_ANSWER", "a"));

        assert_eq!(
            rx.recv()
                .await
                .flatten()
                .as_deref(),
            Some("CHANNEL_PROGRESS")
        );
        assert_eq!(
            rx.recv()
                .await
                .flatten()
                .as_deref(),
            Some("CHANNEL_ANSWER")
        );
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_stops_delivery() {
        let stream = MessageStream::new();
        let bus = EventBus::new(stream.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = bus.subscribe(EventFilter::any(), move |message| {
            let _ = tx.send(message);
        });
        assert!(handle.dispose());
        assert!(!handle.dispose());
        assert!(!handle.is_active());

        stream.publish(event("CHANNEL_ANSWER", "a"));
        settle_tasks().await;

        assert!(rx
            .try_recv()
            .is_err());
        assert_eq!(stream.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_from_inside_handler() {
        let stream = MessageStream::new();
        let bus = EventBus::new(stream.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot: Arc<std::sync::Mutex<Option<SubscriptionHandle>>> = Arc::default();

        let own = slot.clone();
        let handle = bus.subscribe(EventFilter::any(), move |message| {
            let _ = tx.send(message);
            if let Some(handle) = own
                .lock()
                .unwrap()
                .as_ref()
            {
                handle.dispose();
            }
        });
        *slot
            .lock()
            .unwrap() = Some(handle.clone());

        stream.publish(event("CHANNEL_ANSWER", "1"));
        stream.publish(event("CHANNEL_ANSWER", "2"));
        settle_tasks().await;

        let first = rx
            .recv()
            .await
            .unwrap();
        assert_eq!(first.call_id(), Some("1"));
        assert!(rx
            .try_recv()
            .is_err());
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_disposed() {
        let stream = MessageStream::new();
        let bus = EventBus::new(stream.clone());

        let handle = bus.subscribe(EventFilter::any(), |_| panic!("handler bug"));
        stream.publish(event("CHANNEL_ANSWER", "a"));
        settle_tasks().await;

        assert!(!handle.is_active());
        assert_eq!(stream.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_ends_on_stream_close() {
        let stream = MessageStream::new();
        let bus = EventBus::new(stream.clone());
        let handle = bus.subscribe(EventFilter::any(), |_| {});

        stream.close(DisconnectReason::ConnectionClosed);
        settle_tasks().await;
        assert!(!handle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_matching_times_out() {
        let stream = MessageStream::new();
        let bus = EventBus::new(stream.clone());

        stream.publish(event("CHANNEL_ANSWER", "a"));
        let result = bus
            .first_matching(EventFilter::call("a"), Duration::from_secs(3))
            .await;
        assert!(matches!(result, Err(EslError::Timeout { timeout_ms: 3000 })));
    }

    #[tokio::test]
    async fn test_event_stream_as_futures_stream() {
        let stream = MessageStream::new();
        let bus = EventBus::new(stream.clone());
        let mut events = bus.stream(EventFilter::any().with_event_type(EslEventType::ChannelHangup));

        stream.publish(event("CHANNEL_ANSWER", "a"));
        stream.publish(event("CHANNEL_HANGUP", "a"));
        stream.close(DisconnectReason::ServerNotice);

        let hangup = events
            .next()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hangup.event_type(), Some(EslEventType::ChannelHangup));
        assert!(matches!(
            events
                .next()
                .await,
            Some(Err(EslError::StreamClosed { .. }))
        ));
        assert!(events
            .next()
            .await
            .is_none());
    }
}
