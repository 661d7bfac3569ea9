use std::{sync::Arc, time::Duration};

use sqlx::PgPool;
use tokio::sync::OnceCell;

use super::HistoryError;
use crate::{
    db::{migrations::run_migrations, pool::check_pool_health},
    sync::Fragment,
};

#[derive(Clone)]
pub struct PgHistory {
    pool: PgPool,
    ttl: Duration,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgHistory {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl, schema_ready: Arc::new(OnceCell::new()) }
    }

    /// Applies pending migrations once; a failed attempt is retried on the
    /// next call.
    pub async fn ensure_schema(&self) -> Result<(), HistoryError> {
        self.schema_ready
            .get_or_try_init(|| async {
                run_migrations(&self.pool)
                    .await
                    .map_err(|error| HistoryError::Migration(format!("{error:#}")))
            })
            .await
            .map(|_| ())
    }

    pub async fn append(&self, doc_id: &str, fragment: &Fragment) -> Result<(), HistoryError> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await?;

        // An expired list starts over rather than resurrecting stale entries.
        sqlx::query("DELETE FROM fragment_lists WHERE doc_id = $1 AND expires_at <= now()")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO fragment_lists (doc_id, expires_at)
            VALUES ($1, now() + make_interval(secs => $2))
            ON CONFLICT (doc_id) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(doc_id)
        .bind(self.ttl.as_secs_f64())
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO fragment_log (doc_id, payload) VALUES ($1, $2)")
            .bind(doc_id)
            .bind(&fragment[..])
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn read_all(&self, doc_id: &str) -> Result<Vec<Fragment>, HistoryError> {
        self.ensure_schema().await?;

        let payloads = sqlx::query_scalar::<_, Vec<u8>>(
            r#"
            SELECT log.payload
            FROM fragment_log AS log
            INNER JOIN fragment_lists AS list
                ON list.doc_id = log.doc_id
            WHERE log.doc_id = $1
              AND list.expires_at > now()
            ORDER BY log.seq
            "#,
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payloads.into_iter().map(Fragment::from).collect())
    }

    pub async fn purge_expired(&self) -> Result<u64, HistoryError> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM fragment_lists WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn health_check(&self) -> Result<(), HistoryError> {
        check_pool_health(&self.pool)
            .await
            .map_err(|error| HistoryError::Unavailable(format!("{error:#}")))?;
        self.ensure_schema().await
    }
}
