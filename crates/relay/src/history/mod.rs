//! Durable per-document fragment history.
//!
//! The store is an append-only list keyed by document id. Every append
//! refreshes the list's retention window; a list past its expiry reads as
//! empty and is dropped by [`HistoryStore::purge_expired`].

mod memory;
mod postgres;

#[cfg(test)]
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
#[cfg(test)]
use tokio::sync::Notify;
use tracing::{info, warn};

pub use memory::MemoryHistory;
pub use postgres::PgHistory;

use crate::{
    config::RelayConfig,
    db::pool::{check_pool_health, create_pg_pool},
    sync::Fragment,
};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("history store schema is not ready: {0}")]
    Migration(String),
    #[error("history store is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone)]
pub enum HistoryStore {
    Postgres(PgHistory),
    Memory(MemoryHistory),
    #[cfg(test)]
    Failing,
    /// Appends park until the notify fires; reads return nothing.
    #[cfg(test)]
    Stalled(Arc<Notify>),
}

impl HistoryStore {
    pub fn memory(ttl: Duration) -> Self {
        Self::Memory(MemoryHistory::new(ttl))
    }

    pub fn postgres(pool: sqlx::PgPool, ttl: Duration) -> Self {
        Self::Postgres(PgHistory::new(pool, ttl))
    }

    /// Builds the store named by the configuration.
    ///
    /// An unreachable database is not fatal: the pool connects lazily and
    /// the schema is applied on first use, so the relay keeps serving from
    /// memory until PostgreSQL comes back.
    pub async fn from_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let Some(database_url) = config.database_url.as_deref() else {
            warn!("YDOC_RELAY_DATABASE_URL is not set; fragment history will not survive restarts");
            return Ok(Self::memory(config.history_ttl));
        };

        let pool =
            create_pg_pool(database_url, config.pool.clone(), config.database_require_tls)
                .context("invalid history store configuration")?;
        let store = PgHistory::new(pool.clone(), config.history_ttl);

        match check_pool_health(&pool).await {
            Ok(()) => match store.ensure_schema().await {
                Ok(()) => info!("history store schema is up to date"),
                Err(error) => warn!(error = %error, "history store migrations deferred"),
            },
            Err(error) => {
                warn!(error = %format!("{error:#}"), "history store unreachable at startup")
            }
        }

        Ok(Self::Postgres(store))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
            #[cfg(test)]
            Self::Failing => "failing",
            #[cfg(test)]
            Self::Stalled(_) => "stalled",
        }
    }

    /// Appends one fragment to the document's list and refreshes its expiry.
    pub async fn append(&self, doc_id: &str, fragment: &Fragment) -> Result<(), HistoryError> {
        match self {
            Self::Postgres(store) => store.append(doc_id, fragment).await,
            Self::Memory(store) => {
                store.append(doc_id, fragment.clone()).await;
                Ok(())
            }
            #[cfg(test)]
            Self::Failing => Err(HistoryError::Unavailable("injected failure".into())),
            #[cfg(test)]
            Self::Stalled(release) => {
                release.notified().await;
                Ok(())
            }
        }
    }

    /// Returns the document's list in append order, or nothing if it is
    /// absent or expired.
    pub async fn read_all(&self, doc_id: &str) -> Result<Vec<Fragment>, HistoryError> {
        match self {
            Self::Postgres(store) => store.read_all(doc_id).await,
            Self::Memory(store) => Ok(store.read_all(doc_id).await),
            #[cfg(test)]
            Self::Failing => Err(HistoryError::Unavailable("injected failure".into())),
            #[cfg(test)]
            Self::Stalled(_) => Ok(Vec::new()),
        }
    }

    /// Drops every expired list; returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, HistoryError> {
        match self {
            Self::Postgres(store) => store.purge_expired().await,
            Self::Memory(store) => Ok(store.purge_expired().await),
            #[cfg(test)]
            Self::Failing => Err(HistoryError::Unavailable("injected failure".into())),
            #[cfg(test)]
            Self::Stalled(_) => Ok(0),
        }
    }

    pub async fn health_check(&self) -> Result<(), HistoryError> {
        match self {
            Self::Postgres(store) => store.health_check().await,
            Self::Memory(_) => Ok(()),
            #[cfg(test)]
            Self::Failing => Err(HistoryError::Unavailable("injected failure".into())),
            #[cfg(test)]
            Self::Stalled(_) => Ok(()),
        }
    }
}
