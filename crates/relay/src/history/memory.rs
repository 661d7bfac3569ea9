use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::RwLock, time::Instant};

use crate::sync::Fragment;

struct StoredList {
    fragments: Vec<Fragment>,
    expires_at: Instant,
}

impl StoredList {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process history used when no database is configured.
#[derive(Clone)]
pub struct MemoryHistory {
    lists: Arc<RwLock<HashMap<String, StoredList>>>,
    ttl: Duration,
}

impl MemoryHistory {
    pub fn new(ttl: Duration) -> Self {
        Self { lists: Arc::new(RwLock::new(HashMap::new())), ttl }
    }

    pub async fn append(&self, doc_id: &str, fragment: Fragment) {
        let now = Instant::now();
        let mut lists = self.lists.write().await;
        let list = lists
            .entry(doc_id.to_string())
            .or_insert_with(|| StoredList { fragments: Vec::new(), expires_at: now });
        if list.is_expired(now) {
            list.fragments.clear();
        }
        list.fragments.push(fragment);
        list.expires_at = now + self.ttl;
    }

    pub async fn read_all(&self, doc_id: &str) -> Vec<Fragment> {
        let now = Instant::now();
        let lists = self.lists.read().await;
        match lists.get(doc_id) {
            Some(list) if !list.is_expired(now) => list.fragments.clone(),
            _ => Vec::new(),
        }
    }

    pub async fn purge_expired(&self) -> u64 {
        let now = Instant::now();
        let mut lists = self.lists.write().await;
        let before = lists.len();
        lists.retain(|_, list| !list.is_expired(now));
        (before - lists.len()) as u64
    }
}
