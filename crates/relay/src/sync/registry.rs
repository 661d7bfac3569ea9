use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{sync::RwLock, time::Instant};

use super::{Fragment, Room, RoomStats};
use crate::{config::RoomSettings, history::HistoryStore, ws::session::ClientSession};

/// Document id to room map shared by every connection.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    store: HistoryStore,
    settings: RoomSettings,
}

impl RoomRegistry {
    pub fn new(store: HistoryStore, settings: RoomSettings) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), store, settings }
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Returns the room for `doc_id`, creating and hydrating it on first use.
    pub async fn resolve(&self, doc_id: &str) -> Arc<Room> {
        let room = self.get_or_create(doc_id).await;
        room.hydrate(&self.store).await;
        room
    }

    /// Resolves the room and registers `session` in it.
    ///
    /// Returns the room together with its buffer at admission time. A room
    /// retired by the reaper between lookup and admission is skipped; by then
    /// it has left the map, so the next lookup creates a fresh one.
    pub async fn admit(
        &self,
        doc_id: &str,
        session: Arc<ClientSession>,
    ) -> (Arc<Room>, Vec<Fragment>) {
        loop {
            let room = self.resolve(doc_id).await;
            if let Some(history) = room.admit(Arc::clone(&session)).await {
                return (room, history);
            }
        }
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    async fn get_or_create(&self, doc_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                return Arc::clone(room);
            }
        }

        let mut rooms = self.rooms.write().await;
        Arc::clone(
            rooms
                .entry(doc_id.to_string())
                .or_insert_with(|| Arc::new(Room::new(doc_id, self.settings.max_history))),
        )
    }

    /// Removes `doc_id` if the room still has no sessions and has been idle
    /// past the retention window at `now`. Only the idle sweep calls this.
    pub(crate) async fn delete(&self, doc_id: &str, now: Instant) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(doc_id) else {
            return false;
        };
        if !room.retire_if_idle(now, self.settings.idle_after).await {
            return false;
        }
        rooms.remove(doc_id);
        true
    }

    /// Deletes every idle room and returns the ids that were removed.
    pub async fn reap_idle(&self, now: Instant) -> Vec<String> {
        let candidates: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        let mut reaped = Vec::new();
        for doc_id in candidates {
            if self.delete(&doc_id, now).await {
                reaped.push(doc_id);
            }
        }
        reaped
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn snapshot_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Per-room stats ordered by document id.
    pub async fn room_stats(&self) -> Vec<RoomStats> {
        let now = Instant::now();
        let mut stats = Vec::new();
        for room in self.snapshot_rooms().await {
            stats.push(room.stats(now).await);
        }
        stats.sort_by(|left, right| left.doc_id.cmp(&right.doc_id));
        stats
    }

    /// Sends every connected session a going-away close, waiting at most
    /// `grace` per session, then force-closes them.
    pub async fn close_all(&self, grace: Duration) -> usize {
        let mut sessions = Vec::new();
        for room in self.snapshot_rooms().await {
            sessions.extend(room.drain_sessions().await);
        }
        let closed = sessions.len();
        join_all(sessions.iter().map(|session| session.close_gracefully(grace))).await;
        closed
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::Instant;

    use super::RoomRegistry;
    use crate::{
        config::RoomSettings,
        history::HistoryStore,
        sync::Fragment,
        ws::session::test_support::channel_session,
    };

    fn registry_with_idle(idle_after: Duration) -> RoomRegistry {
        RoomRegistry::new(
            HistoryStore::memory(Duration::from_secs(60)),
            RoomSettings { idle_after, ..RoomSettings::default() },
        )
    }

    #[tokio::test]
    async fn resolve_returns_same_room_for_same_document() {
        let registry = registry_with_idle(Duration::from_secs(60));
        let first = registry.resolve("notes").await;
        let second = registry.resolve("notes").await;
        let other = registry.resolve("todo").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn concurrent_resolves_create_one_room() {
        let registry = Arc::new(registry_with_idle(Duration::from_secs(60)));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.resolve("shared").await })
            })
            .collect();

        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.expect("resolve task should finish"));
        }
        assert!(rooms.iter().all(|room| Arc::ptr_eq(room, &rooms[0])));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn resolve_hydrates_from_store() {
        let store = HistoryStore::memory(Duration::from_secs(60));
        store.append("notes", &Fragment::from_static(b"a")).await.expect("memory append");
        let registry = RoomRegistry::new(store, RoomSettings::default());

        let room = registry.resolve("notes").await;
        assert_eq!(room.snapshot_history().await, vec![Fragment::from_static(b"a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn reap_idle_removes_only_empty_idle_rooms() {
        let registry = registry_with_idle(Duration::from_secs(30));
        registry.resolve("empty").await;
        let (session, _frames, _rx) = channel_session("busy", 4);
        registry.admit("busy", session).await;

        assert!(registry.reap_idle(Instant::now()).await.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.reap_idle(Instant::now()).await, vec!["empty".to_string()]);
        assert!(registry.get("empty").await.is_none());
        assert!(registry.get("busy").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn admission_after_reap_gets_fresh_room() {
        let registry = registry_with_idle(Duration::from_secs(30));
        let stale = registry.resolve("notes").await;

        tokio::time::advance(Duration::from_secs(31)).await;
        registry.reap_idle(Instant::now()).await;

        let (session, _frames, _rx) = channel_session("notes", 4);
        let (room, _) = registry.admit("notes", Arc::clone(&session)).await;
        assert!(!Arc::ptr_eq(&stale, &room));
        assert!(room.contains(session.id()).await);
        assert_eq!(stale.session_count().await, 0);
    }

    #[tokio::test]
    async fn close_all_drains_and_closes_sessions() {
        let registry = registry_with_idle(Duration::from_secs(30));
        let (first, _first_frames, _first_rx) = channel_session("a", 4);
        let (second, _second_frames, _second_rx) = channel_session("b", 4);
        registry.admit("a", Arc::clone(&first)).await;
        registry.admit("b", Arc::clone(&second)).await;

        assert_eq!(registry.close_all(Duration::from_millis(50)).await, 2);
        assert!(first.is_closed());
        assert!(second.is_closed());
        let stats = registry.room_stats().await;
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|room| room.sessions == 0));
    }
}
