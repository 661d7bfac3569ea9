use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Fragment, HistoryWriter, Room};
use crate::{
    metrics::{self, FanoutEviction},
    ws::session::{ClientSession, SessionId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Buffer length after the append.
    pub buffered: usize,
    /// Sessions the fragment was queued for.
    pub delivered: usize,
    /// Sessions dropped because their queue could not take the fragment.
    pub evicted: usize,
}

/// Appends fragments to room buffers, persists them and fans them out.
#[derive(Clone)]
pub struct Broadcaster {
    writer: HistoryWriter,
}

impl Broadcaster {
    pub fn new(writer: HistoryWriter) -> Self {
        Self { writer }
    }

    pub fn writer(&self) -> &HistoryWriter {
        &self.writer
    }

    /// Accepts one fragment from `origin` into `room`.
    ///
    /// Buffer append, persistence hand-off and per-recipient enqueue all
    /// happen under the room's write lock, so every recipient queue sees
    /// fragments in buffer order. Socket writes happen later in each
    /// session's delivery task. The origin never gets its own fragment.
    ///
    /// The payload is copied first: frames read off a socket share the
    /// connection's read buffer, which must not outlive the connection.
    /// Sessions already closing are dropped without counting an eviction.
    pub async fn ingest(
        &self,
        room: &Room,
        fragment: Fragment,
        origin: SessionId,
    ) -> IngestOutcome {
        let fragment = Fragment::copy_from_slice(&fragment);
        let bytes = fragment.len();
        let mut delivered = 0;
        let mut evicted = Vec::new();

        let buffered = {
            let mut state = room.state.write().await;
            state.push_update(fragment.clone(), room.max_history());
            self.writer.enqueue(room.doc_id(), fragment.clone());

            state.sessions.retain(|session_id, session| {
                if *session_id == origin {
                    return true;
                }
                if session.is_closed() {
                    return false;
                }
                match session.enqueue(fragment.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(reason) => {
                        evicted.push((Arc::clone(session), reason));
                        false
                    }
                }
            });
            state.updates.len()
        };

        metrics::record_fragment_ingested(bytes);
        for (session, reason) in &evicted {
            warn!(
                doc_id = %room.doc_id(),
                session_id = %session.id(),
                reason = reason.as_str(),
                "dropping session that cannot keep up with fan-out"
            );
            metrics::record_fanout_eviction(*reason);
            session.close();
        }

        IngestOutcome { buffered, delivered, evicted: evicted.len() }
    }
}

/// Writes the join-time replay, then queued live fragments, to one session.
///
/// A failed write removes the session from its room and closes it; the
/// connection's own teardown finishes the job.
pub async fn run_delivery(
    session: Arc<ClientSession>,
    room: Arc<Room>,
    replay: Vec<Fragment>,
    mut outbound: mpsc::Receiver<Fragment>,
) {
    for fragment in replay {
        if !deliver(&session, &room, fragment).await {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = session.closed() => break,
            next = outbound.recv() => {
                let Some(fragment) = next else {
                    break;
                };
                if !deliver(&session, &room, fragment).await {
                    return;
                }
            }
        }
    }
    debug!(session_id = %session.id(), "delivery stopped");
}

async fn deliver(session: &ClientSession, room: &Room, fragment: Fragment) -> bool {
    match session.send(Message::Binary(fragment)).await {
        Ok(()) => true,
        Err(error) => {
            warn!(
                doc_id = %room.doc_id(),
                session_id = %session.id(),
                error = %error,
                "fragment write failed, removing session"
            );
            room.remove(session.id()).await;
            session.close();
            metrics::record_fanout_eviction(FanoutEviction::WriteFailed);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::extract::ws::Message;
    use tokio::{sync::Notify, time::timeout};

    use super::{run_delivery, Broadcaster};
    use crate::{
        history::HistoryStore,
        sync::{Fragment, HistoryWriter, Room},
        ws::session::test_support::{channel_session, failing_session, next_binary},
    };

    fn broadcaster(store: HistoryStore) -> Broadcaster {
        let (writer, _worker) = HistoryWriter::spawn(store, 64);
        Broadcaster::new(writer)
    }

    fn fragment(n: u8) -> Fragment {
        Fragment::copy_from_slice(&[n])
    }

    #[tokio::test]
    async fn fan_out_skips_origin_and_reaches_everyone_else() {
        let engine = broadcaster(HistoryStore::memory(Duration::from_secs(60)));
        let room = Room::new("notes", 10);
        let (a, _a_frames, mut a_rx) = channel_session("notes", 8);
        let (b, _b_frames, mut b_rx) = channel_session("notes", 8);
        let (c, _c_frames, mut c_rx) = channel_session("notes", 8);
        for session in [&a, &b, &c] {
            room.admit(Arc::clone(session)).await.expect("room is live");
        }

        let outcome = engine.ingest(&room, fragment(7), a.id()).await;
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.evicted, 0);
        assert_eq!(outcome.buffered, 1);

        assert_eq!(b_rx.try_recv().expect("b receives"), fragment(7));
        assert_eq!(c_rx.try_recv().expect("c receives"), fragment(7));
        assert!(b_rx.try_recv().is_err());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ingest_copies_payload_out_of_shared_read_buffer() {
        let store = HistoryStore::memory(Duration::from_secs(60));
        let engine = broadcaster(store.clone());
        let room = Room::new("notes", 10);
        let (origin, _o_frames, _o_rx) = channel_session("notes", 8);
        let (peer, _p_frames, mut peer_rx) = channel_session("notes", 8);
        room.admit(Arc::clone(&origin)).await.expect("room is live");
        room.admit(Arc::clone(&peer)).await.expect("room is live");

        let read_buffer = Fragment::from(vec![7u8; 128 * 1024]);
        let shared = read_buffer.as_ptr_range();
        engine.ingest(&room, read_buffer.slice(0..10), origin.id()).await;
        assert!(engine.writer().flush().await);

        let buffered = room.snapshot_history().await.remove(0);
        let delivered = peer_rx.try_recv().expect("peer receives");
        let persisted = store.read_all("notes").await.expect("memory read").remove(0);
        for copy in [&buffered, &delivered, &persisted] {
            assert_eq!(copy.len(), 10);
            assert!(!shared.contains(&copy.as_ptr()), "fragment still aliases the read buffer");
        }
    }

    #[tokio::test]
    async fn closing_session_is_skipped_without_eviction() {
        let engine = broadcaster(HistoryStore::memory(Duration::from_secs(60)));
        let room = Room::new("notes", 10);
        let (origin, _o_frames, _o_rx) = channel_session("notes", 8);
        let (leaving, _l_frames, _l_rx) = channel_session("notes", 8);
        let (staying, _s_frames, mut staying_rx) = channel_session("notes", 8);
        for session in [&origin, &leaving, &staying] {
            room.admit(Arc::clone(session)).await.expect("room is live");
        }

        leaving.close();
        let outcome = engine.ingest(&room, fragment(1), origin.id()).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.evicted, 0);
        assert!(!room.contains(leaving.id()).await);
        assert_eq!(staying_rx.try_recv().expect("staying receives"), fragment(1));
    }

    #[tokio::test]
    async fn ingest_caps_buffer_and_persists_every_fragment() {
        let store = HistoryStore::memory(Duration::from_secs(60));
        let engine = broadcaster(store.clone());
        let room = Room::new("notes", 2);
        let (origin, _frames, _rx) = channel_session("notes", 8);
        room.admit(Arc::clone(&origin)).await.expect("room is live");

        for n in 1..=4u8 {
            let outcome = engine.ingest(&room, fragment(n), origin.id()).await;
            assert_eq!(outcome.buffered, usize::from(n).min(2));
        }
        assert_eq!(room.snapshot_history().await, vec![fragment(3), fragment(4)]);

        assert!(engine.writer().flush().await);
        assert_eq!(store.read_all("notes").await.expect("memory read").len(), 4);
    }

    #[tokio::test]
    async fn full_queue_evicts_only_the_slow_session() {
        let engine = broadcaster(HistoryStore::memory(Duration::from_secs(60)));
        let room = Room::new("notes", 10);
        let (origin, _o_frames, _o_rx) = channel_session("notes", 8);
        let (slow, _s_frames, _slow_rx) = channel_session("notes", 1);
        let (fast, _f_frames, mut fast_rx) = channel_session("notes", 8);
        for session in [&origin, &slow, &fast] {
            room.admit(Arc::clone(session)).await.expect("room is live");
        }

        engine.ingest(&room, fragment(1), origin.id()).await;
        let outcome = engine.ingest(&room, fragment(2), origin.id()).await;
        assert_eq!(outcome.evicted, 1);
        assert!(slow.is_closed());
        assert!(!room.contains(slow.id()).await);

        let outcome = engine.ingest(&room, fragment(3), origin.id()).await;
        assert_eq!(outcome.delivered, 1);
        for n in 1..=3u8 {
            assert_eq!(fast_rx.try_recv().expect("fast receives every fragment"), fragment(n));
        }
    }

    #[tokio::test]
    async fn ingest_does_not_wait_on_stalled_store() {
        let release = Arc::new(Notify::new());
        let engine = broadcaster(HistoryStore::Stalled(Arc::clone(&release)));
        let room = Room::new("notes", 10);
        let (origin, _o_frames, _o_rx) = channel_session("notes", 8);
        let (peer, _p_frames, mut peer_rx) = channel_session("notes", 8);
        room.admit(Arc::clone(&origin)).await.expect("room is live");
        room.admit(Arc::clone(&peer)).await.expect("room is live");

        for n in 0..3u8 {
            timeout(Duration::from_secs(1), engine.ingest(&room, fragment(n), origin.id()))
                .await
                .expect("ingest must not block on persistence");
        }
        assert_eq!(peer_rx.try_recv().expect("peer receives"), fragment(0));
        assert_eq!(room.snapshot_history().await.len(), 3);
    }

    #[tokio::test]
    async fn delivery_replays_history_before_live_fragments() {
        let room = Arc::new(Room::new("notes", 10));
        let (session, mut frames, rx) = channel_session("notes", 8);
        let replay = vec![fragment(1), fragment(2)];
        room.admit(Arc::clone(&session)).await.expect("room is live");

        session.enqueue(fragment(3)).expect("queue has room");
        let task = tokio::spawn(run_delivery(Arc::clone(&session), Arc::clone(&room), replay, rx));

        for n in 1..=3u8 {
            assert_eq!(next_binary(&mut frames).await, fragment(n));
        }
        session.close();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("delivery stops once session closes")
            .expect("delivery task should not panic");
    }

    #[tokio::test]
    async fn write_failure_removes_session_and_spares_others() {
        let engine = broadcaster(HistoryStore::memory(Duration::from_secs(60)));
        let room = Arc::new(Room::new("notes", 10));
        let (origin, _o_frames, _o_rx) = channel_session("notes", 8);
        let (broken, broken_rx) = failing_session("notes", 8);
        let (healthy, mut healthy_frames, healthy_rx) = channel_session("notes", 8);
        for session in [&origin, &broken, &healthy] {
            room.admit(Arc::clone(session)).await.expect("room is live");
        }
        let broken_task = tokio::spawn(run_delivery(
            Arc::clone(&broken),
            Arc::clone(&room),
            Vec::new(),
            broken_rx,
        ));
        tokio::spawn(run_delivery(Arc::clone(&healthy), Arc::clone(&room), Vec::new(), healthy_rx));

        engine.ingest(&room, fragment(1), origin.id()).await;
        timeout(Duration::from_secs(1), broken_task)
            .await
            .expect("failed delivery should end")
            .expect("delivery task should not panic");
        assert!(broken.is_closed());
        assert!(!room.contains(broken.id()).await);

        let outcome = engine.ingest(&room, fragment(2), origin.id()).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(next_binary(&mut healthy_frames).await, fragment(1));
        assert_eq!(next_binary(&mut healthy_frames).await, fragment(2));
        assert!(!matches!(healthy_frames.try_recv(), Ok(Message::Binary(_))));
    }
}
