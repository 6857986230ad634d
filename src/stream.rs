//! Ordered fan-out of inbound messages to one-shot and continuous observers

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::{
    error::{EslError, EslResult},
    protocol::EslMessage,
};

/// Why the message stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Server sent a text/disconnect-notice with Content-Disposition: disconnect
    ServerNotice,
    /// Liveness timeout exceeded without any inbound traffic
    HeartbeatExpired,
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Inbound bytes could not be framed or decoded; the stream is out of sync
    ParseError(String),
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// Client called disconnect()
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerNotice => write!(f, "server sent disconnect notice"),
            DisconnectReason::HeartbeatExpired => write!(f, "liveness timeout expired"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ParseError(msg) => write!(f, "parse error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// What an observer receives: a message, or the reason the stream ended.
type Delivery = Result<Arc<EslMessage>, DisconnectReason>;

type Predicate = Box<dyn Fn(&EslMessage) -> bool + Send + Sync>;

enum Observer {
    Once {
        predicate: Predicate,
        tx: Option<oneshot::Sender<Delivery>>,
    },
    Every {
        predicate: Predicate,
        tx: mpsc::UnboundedSender<Delivery>,
    },
}

impl Observer {
    /// Offer a message; returns whether the observer stays registered.
    fn offer(&mut self, message: &Arc<EslMessage>) -> bool {
        match self {
            Observer::Once { predicate, tx } => {
                let Some(sender) = tx.take() else {
                    return false;
                };
                if sender.is_closed() {
                    return false;
                }
                if !predicate(message) {
                    *tx = Some(sender);
                    return true;
                }
                let _ = sender.send(Ok(message.clone()));
                false
            }
            Observer::Every { predicate, tx } => {
                if !predicate(message) {
                    return !tx.is_closed();
                }
                tx.send(Ok(message.clone()))
                    .is_ok()
            }
        }
    }

    fn terminate(self, reason: &DisconnectReason) {
        match self {
            Observer::Once { tx: Some(tx), .. } => {
                let _ = tx.send(Err(reason.clone()));
            }
            Observer::Once { tx: None, .. } => {}
            Observer::Every { tx, .. } => {
                let _ = tx.send(Err(reason.clone()));
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: BTreeMap<u64, Observer>,
    closed: Option<DisconnectReason>,
}

impl Registry {
    fn register(&mut self, observer: Observer) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.observers
            .insert(id, observer);
        id
    }
}

/// Single ordered, multicast sequence of inbound messages.
///
/// Observers registered at any time see every message published after their
/// registration, in publish order. Nothing published earlier is replayed.
/// When the stream is closed every live observer is told why, exactly once,
/// and observers registered afterwards fail immediately.
///
/// Predicates run under the registry lock and must not call back into the
/// stream. Message handlers never do: they run on their own tasks.
#[derive(Clone, Default)]
pub struct MessageStream {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        f.debug_struct("MessageStream")
            .field(
                "observers",
                &registry
                    .observers
                    .len(),
            )
            .field("closed", &registry.closed)
            .finish()
    }
}

impl MessageStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `message` to every matching observer.
    ///
    /// A matching one-shot observer is removed under the lock, so it can only
    /// ever see one message. Returns `false` once the stream is closed.
    pub fn publish(&self, message: EslMessage) -> bool {
        let message = Arc::new(message);
        let mut registry = self.lock();
        if registry
            .closed
            .is_some()
        {
            trace!(
                "Dropping {} published after close",
                message.content_type()
            );
            return false;
        }
        registry
            .observers
            .retain(|_, observer| observer.offer(&message));
        true
    }

    /// End the stream. Only the first call has any effect.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        let observers = {
            let mut registry = self.lock();
            if registry
                .closed
                .is_some()
            {
                return false;
            }
            registry.closed = Some(reason.clone());
            std::mem::take(&mut registry.observers)
        };
        debug!(
            "Message stream closed ({}), notifying {} observers",
            reason,
            observers.len()
        );
        for observer in observers.into_values() {
            observer.terminate(&reason);
        }
        true
    }

    pub fn closed_reason(&self) -> Option<DisconnectReason> {
        self.lock()
            .closed
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock()
            .closed
            .is_some()
    }

    /// Live registrations, one-shot and continuous.
    pub fn observer_count(&self) -> usize {
        self.lock()
            .observers
            .len()
    }

    /// Register a one-shot wait for the next message matching `predicate`.
    ///
    /// Registration is complete when this returns, before the returned future
    /// is first polled. Register first, then send whatever triggers the reply.
    pub fn next_matching<F>(&self, predicate: F) -> NextMessage
    where
        F: Fn(&EslMessage) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut registry = self.lock();
        let id = match &registry.closed {
            Some(reason) => {
                let _ = tx.send(Err(reason.clone()));
                None
            }
            None => Some(registry.register(Observer::Once {
                predicate: Box::new(predicate),
                tx: Some(tx),
            })),
        };
        NextMessage {
            rx,
            id,
            stream: self.clone(),
        }
    }

    /// Register a continuous observer for every message matching `predicate`.
    pub fn every_matching<F>(&self, predicate: F) -> MessageFeed
    where
        F: Fn(&EslMessage) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.lock();
        let id = match &registry.closed {
            Some(reason) => {
                let _ = tx.send(Err(reason.clone()));
                None
            }
            None => Some(registry.register(Observer::Every {
                predicate: Box::new(predicate),
                tx,
            })),
        };
        MessageFeed {
            rx,
            id,
            stream: self.clone(),
        }
    }

    /// Wait up to `limit` for the next message matching `predicate`.
    pub async fn await_next<F>(&self, predicate: F, limit: Duration) -> EslResult<Arc<EslMessage>>
    where
        F: Fn(&EslMessage) -> bool + Send + Sync + 'static,
    {
        self.next_matching(predicate)
            .wait(limit)
            .await
    }

    fn deregister(&self, id: u64) {
        self.lock()
            .observers
            .remove(&id);
    }
}

/// Pending one-shot wait created by [`MessageStream::next_matching`].
///
/// Resolves with the first matching message, or `StreamClosed` if the stream
/// ends first. Dropping it deregisters the wait.
#[must_use = "a registered wait does nothing unless awaited"]
pub struct NextMessage {
    rx: oneshot::Receiver<Delivery>,
    id: Option<u64>,
    stream: MessageStream,
}

impl std::fmt::Debug for NextMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NextMessage")
            .field("id", &self.id)
            .finish()
    }
}

impl NextMessage {
    /// Wait at most `limit`. On timeout the registration is removed.
    pub async fn wait(mut self, limit: Duration) -> EslResult<Arc<EslMessage>> {
        match timeout(limit, &mut self).await {
            Ok(result) => result,
            Err(_) => Err(EslError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }
}

impl Future for NextMessage {
    type Output = EslResult<Arc<EslMessage>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let delivery = ready!(Pin::new(&mut self.rx).poll(cx));
        // The publisher or close() already removed the registration.
        self.id = None;
        Poll::Ready(match delivery {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(reason)) => Err(EslError::StreamClosed { reason }),
            Err(_) => Err(EslError::StreamClosed {
                reason: DisconnectReason::ConnectionClosed,
            }),
        })
    }
}

impl Drop for NextMessage {
    fn drop(&mut self) {
        if let Some(id) = self
            .id
            .take()
        {
            self.stream
                .deregister(id);
        }
    }
}

/// Continuous registration created by [`MessageStream::every_matching`].
///
/// Yields matching messages in publish order, then one `StreamClosed` error
/// when the stream ends, then `None`. Dropping it deregisters.
pub struct MessageFeed {
    rx: mpsc::UnboundedReceiver<Delivery>,
    id: Option<u64>,
    stream: MessageStream,
}

impl std::fmt::Debug for MessageFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFeed")
            .field("id", &self.id)
            .finish()
    }
}

impl MessageFeed {
    pub async fn recv(&mut self) -> Option<EslResult<Arc<EslMessage>>> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<EslResult<Arc<EslMessage>>>> {
        let item = ready!(self
            .rx
            .poll_recv(cx));
        Poll::Ready(item.map(|delivery| delivery.map_err(|reason| EslError::StreamClosed { reason })))
    }

    /// Stop receiving. Messages already queued can still be drained.
    pub fn close(&mut self) {
        if let Some(id) = self
            .id
            .take()
        {
            self.stream
                .deregister(id);
        }
        self.rx
            .close();
    }
}

impl Drop for MessageFeed {
    fn drop(&mut self) {
        if let Some(id) = self
            .id
            .take()
        {
            self.stream
                .deregister(id);
        }
    }
}
