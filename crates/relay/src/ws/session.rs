use std::{
    fmt,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt};
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    time::{timeout, Instant},
};
use uuid::Uuid;

use crate::{metrics::FanoutEviction, sync::Fragment};

/// Opaque handle issued when a connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Write half of a client channel.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// One connected client.
///
/// Every outbound frame goes through [`ClientSession::send`], which holds
/// the write lock for the duration of the write, so fan-out deliveries and
/// liveness probes never interleave on the wire.
pub struct ClientSession {
    id: SessionId,
    doc_id: String,
    joined_at: DateTime<Utc>,
    last_liveness: Mutex<Instant>,
    sink: AsyncMutex<FrameSink>,
    outbound: mpsc::Sender<Fragment>,
    closed: watch::Sender<bool>,
}

impl ClientSession {
    /// Returns the session and the receiving end of its outbound queue.
    pub fn new(
        doc_id: impl Into<String>,
        sink: FrameSink,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Fragment>) {
        let (outbound, receiver) = mpsc::channel(queue_capacity.max(1));
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: SessionId::new(),
            doc_id: doc_id.into(),
            joined_at: Utc::now(),
            last_liveness: Mutex::new(Instant::now()),
            sink: AsyncMutex::new(sink),
            outbound,
            closed,
        });
        (session, receiver)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    /// Queues a fragment for the delivery task without waiting.
    pub fn enqueue(&self, fragment: Fragment) -> Result<(), FanoutEviction> {
        if self.is_closed() {
            return Err(FanoutEviction::QueueClosed);
        }
        self.outbound.try_send(fragment).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => FanoutEviction::QueueFull,
            mpsc::error::TrySendError::Closed(_) => FanoutEviction::QueueClosed,
        })
    }

    /// Writes one frame under the session write lock.
    pub async fn send(&self, message: Message) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(message).await
    }

    /// Records a liveness signal from the peer.
    pub fn touch(&self) {
        *self.last_liveness.lock().expect("liveness lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_liveness.lock().expect("liveness lock poisoned").elapsed()
    }

    /// Signals every task serving this session to stop. Returns `true` only
    /// for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`ClientSession::close`] has been called.
    pub async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    /// Sends a going-away close frame, bounded by `grace`, then closes.
    pub async fn close_gracefully(&self, grace: Duration) {
        let frame = CloseFrame {
            code: close_code::AWAY,
            reason: Utf8Bytes::from_static("server shutting down"),
        };
        let _ = timeout(grace, self.send(Message::Close(Some(frame)))).await;
        self.close();
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::extract::ws::{close_code, Message};

    use super::test_support::{channel_session, failing_session};
    use crate::{metrics::FanoutEviction, sync::Fragment};

    #[tokio::test]
    async fn close_is_reported_once_and_wakes_waiters() {
        let (session, _frames, _rx) = channel_session("notes", 4);
        let waiter = {
            let session = std::sync::Arc::clone(&session);
            tokio::spawn(async move { session.closed().await })
        };

        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn enqueue_reports_full_and_closed_queues() {
        let (session, _frames, _rx) = channel_session("notes", 1);
        session.enqueue(Fragment::from_static(b"a")).expect("first fits");
        assert_eq!(session.enqueue(Fragment::from_static(b"b")), Err(FanoutEviction::QueueFull));

        session.close();
        assert_eq!(session.enqueue(Fragment::from_static(b"c")), Err(FanoutEviction::QueueClosed));
    }

    #[tokio::test]
    async fn close_gracefully_sends_going_away_frame() {
        let (session, mut frames, _rx) = channel_session("notes", 1);
        session.close_gracefully(Duration::from_millis(100)).await;

        match frames.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::AWAY),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn failed_write_surfaces_error() {
        let (session, _rx) = failing_session("notes", 1);
        assert!(session.send(Message::Ping(Default::default())).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_time() {
        let (session, _frames, _rx) = channel_session("notes", 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(session.idle_for() >= Duration::from_secs(5));

        session.touch();
        assert!(session.idle_for() < Duration::from_secs(1));
    }
}
