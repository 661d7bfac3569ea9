use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{OnceCell, RwLock},
    time::Instant,
};
use tracing::{debug, warn};

use super::Fragment;
use crate::{
    history::HistoryStore,
    metrics,
    ws::session::{ClientSession, SessionId},
};

/// Connected sessions and replay buffer for one document.
pub struct Room {
    doc_id: String,
    max_history: usize,
    created_at: DateTime<Utc>,
    pub(super) state: RwLock<RoomState>,
    hydrated: OnceCell<()>,
}

pub(super) struct RoomState {
    pub(super) sessions: HashMap<SessionId, Arc<ClientSession>>,
    pub(super) updates: VecDeque<Fragment>,
    pub(super) updated: Instant,
    /// Set by the reaper right before the room leaves the registry.
    pub(super) retired: bool,
}

impl RoomState {
    /// Appends and drops from the front until at most `cap` remain.
    pub(super) fn push_update(&mut self, fragment: Fragment, cap: usize) {
        self.updates.push_back(fragment);
        while self.updates.len() > cap {
            self.updates.pop_front();
        }
        self.updated = Instant::now();
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoomStats {
    pub doc_id: String,
    pub sessions: usize,
    pub buffered_updates: usize,
    pub idle_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(doc_id: impl Into<String>, max_history: usize) -> Self {
        Self {
            doc_id: doc_id.into(),
            max_history: max_history.max(1),
            created_at: Utc::now(),
            state: RwLock::new(RoomState {
                sessions: HashMap::new(),
                updates: VecDeque::new(),
                updated: Instant::now(),
                retired: false,
            }),
            hydrated: OnceCell::new(),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Registers `session` and returns the buffer as it stood at that moment.
    ///
    /// Returns `None` once the room has been retired; the caller must
    /// resolve a fresh room instead.
    pub async fn admit(&self, session: Arc<ClientSession>) -> Option<Vec<Fragment>> {
        let mut state = self.state.write().await;
        if state.retired {
            return None;
        }
        state.sessions.insert(session.id(), session);
        Some(state.updates.iter().cloned().collect())
    }

    /// Removing an absent session is a no-op.
    pub async fn remove(&self, session_id: SessionId) -> Option<Arc<ClientSession>> {
        self.state.write().await.sessions.remove(&session_id)
    }

    pub async fn snapshot_history(&self) -> Vec<Fragment> {
        self.state.read().await.updates.iter().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn contains(&self, session_id: SessionId) -> bool {
        self.state.read().await.sessions.contains_key(&session_id)
    }

    pub async fn stats(&self, now: Instant) -> RoomStats {
        let state = self.state.read().await;
        RoomStats {
            doc_id: self.doc_id.clone(),
            sessions: state.sessions.len(),
            buffered_updates: state.updates.len(),
            idle_secs: now.saturating_duration_since(state.updated).as_secs(),
            created_at: self.created_at,
        }
    }

    /// Loads durable history into the buffer, at most once per room.
    ///
    /// Skipped when fragments were accepted between creation and hydration;
    /// those fragments win and stored history is not merged in. A store
    /// failure leaves the buffer empty.
    pub(crate) async fn hydrate(&self, store: &HistoryStore) {
        self.hydrated
            .get_or_init(|| async {
                let stored = match store.read_all(&self.doc_id).await {
                    Ok(stored) => stored,
                    Err(error) => {
                        warn!(doc_id = %self.doc_id, error = %error, "room hydration failed");
                        metrics::record_hydration_failure();
                        return;
                    }
                };
                if stored.is_empty() {
                    return;
                }

                let mut state = self.state.write().await;
                if !state.updates.is_empty() {
                    debug!(
                        doc_id = %self.doc_id,
                        buffered = state.updates.len(),
                        "room already has live fragments, skipping hydration"
                    );
                    return;
                }
                let skip = stored.len().saturating_sub(self.max_history);
                state.updates.extend(stored.into_iter().skip(skip));
                debug!(doc_id = %self.doc_id, hydrated = state.updates.len(), "room hydrated");
            })
            .await;
    }

    /// Marks the room retired if it has no sessions and has been untouched
    /// for longer than `idle_after`.
    pub(super) async fn retire_if_idle(&self, now: Instant, idle_after: Duration) -> bool {
        let mut state = self.state.write().await;
        if state.retired {
            return true;
        }
        if state.sessions.is_empty() && now.saturating_duration_since(state.updated) > idle_after {
            state.retired = true;
        }
        state.retired
    }

    /// Empties the session set, handing the sessions to the caller.
    pub(super) async fn drain_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.state.write().await.sessions.drain().map(|(_, session)| session).collect()
    }
}
