//! Token-usage accounting store (C8).
//!
//! Collapses the original `token_usage_models.py` (ORM model),
//! `token_usage_schemas.py` (Pydantic schema), and `token_usage_repository.py`
//! (repository) into one typed Rust module: [`TokenUsageRecord`] is both the
//! row shape and the wire shape (this crate has no separate HTTP validation
//! layer, see §1), [`TokenUsageStore`] is the repository, and
//! [`TokenUsageQuery`] mirrors the original's filter object field-for-field.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::pool::ConnectionPool;

/// One append-only record of resource consumption by an agent/task.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenUsageRecord {
    pub id: Uuid,
    pub agent_id: String,
    pub task_id: String,
    pub tokens_used: f64,
    pub model_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Optional filters for [`TokenUsageStore::query`], mirroring the original
/// `TokenUsageQuery` Pydantic model field-for-field.
#[derive(Debug, Clone, Default)]
pub struct TokenUsageQuery {
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Append-only, UUID-keyed token-usage log (C8).
///
/// `log` is safe to call from any number of concurrent producers; writes
/// are serialized through the shared pool's own transaction discipline, and
/// a record only becomes visible to `query` once it is fully committed —
/// there is no partially-visible row.
pub struct TokenUsageStore {
    pool: std::sync::Arc<ConnectionPool>,
}

impl TokenUsageStore {
    pub fn new(pool: std::sync::Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Create the `token_usage` table and its index if they don't exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut session = self.pool.acquire().await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS token_usage (\
                id TEXT PRIMARY KEY, \
                agent_id TEXT NOT NULL, \
                task_id TEXT NOT NULL, \
                tokens_used DOUBLE PRECISION NOT NULL, \
                model_name TEXT NOT NULL, \
                timestamp TIMESTAMPTZ NOT NULL\
             )",
        )
        .execute(&mut **session)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_token_usage_agent_ts ON token_usage(agent_id, timestamp)")
            .execute(&mut **session)
            .await?;

        Ok(())
    }

    /// Append one record, assigning a fresh UUID. Returns once the write is
    /// durable: a subsequent `query` is guaranteed to see it (§4.8,
    /// property 8).
    pub async fn log(
        &self,
        agent_id: impl Into<String>,
        task_id: impl Into<String>,
        tokens_used: f64,
        model_name: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<TokenUsageRecord> {
        let record = TokenUsageRecord {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            tokens_used,
            model_name: model_name.into(),
            timestamp: timestamp.unwrap_or_else(Utc::now),
        };

        let mut session = self.pool.acquire().await?;
        sqlx::query(
            "INSERT INTO token_usage (id, agent_id, task_id, tokens_used, model_name, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.agent_id)
        .bind(&record.task_id)
        .bind(record.tokens_used)
        .bind(&record.model_name)
        .bind(record.timestamp)
        .execute(&mut **session)
        .await?;

        Ok(record)
    }

    /// Return matching records ordered by timestamp ascending.
    pub async fn query(&self, filter: &TokenUsageQuery) -> Result<Vec<TokenUsageRecord>> {
        let mut session = self.pool.acquire().await?;

        let mut sql = String::from(
            "SELECT id, agent_id, task_id, tokens_used, model_name, timestamp FROM token_usage WHERE 1=1",
        );
        if filter.agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        if filter.task_id.is_some() {
            sql.push_str(" AND task_id = ?");
        }
        if filter.start_time.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if filter.end_time.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        sql.push_str(" ORDER BY timestamp ASC");

        let mut q = sqlx::query(&sql);
        if let Some(agent_id) = &filter.agent_id {
            q = q.bind(agent_id.clone());
        }
        if let Some(task_id) = &filter.task_id {
            q = q.bind(task_id.clone());
        }
        if let Some(start_time) = filter.start_time {
            q = q.bind(start_time);
        }
        if let Some(end_time) = filter.end_time {
            q = q.bind(end_time);
        }

        let rows = q.fetch_all(&mut **session).await?;

        use sqlx::Row;
        rows.into_iter()
            .map(|row| {
                let id_text: String = row.try_get("id")?;
                Ok(TokenUsageRecord {
                    id: Uuid::parse_str(&id_text).unwrap_or_default(),
                    agent_id: row.try_get("agent_id")?,
                    task_id: row.try_get("task_id")?,
                    tokens_used: row.try_get("tokens_used")?,
                    model_name: row.try_get("model_name")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    /// Delete records older than `now - days_to_keep`, returning the number
    /// of rows removed.
    pub async fn prune(&self, days_to_keep: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days_to_keep as i64);
        let mut session = self.pool.acquire().await?;
        let result = sqlx::query("DELETE FROM token_usage WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&mut **session)
            .await?;
        Ok(result.rows_affected())
    }

    /// Reinitialize this store against an isolated database URL and
    /// re-create its schema, so integration tests can run in parallel
    /// without sharing state. Not exposed on the production gateway — only
    /// the composition root's test helpers construct a store this way.
    pub async fn isolated_for_test(url: &str, pool_config: crate::config::PoolConfig) -> Result<Self> {
        let pool = ConnectionPool::connect(url, pool_config).await?;
        let store = Self::new(std::sync::Arc::new(pool));
        store.ensure_schema().await?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    async fn test_store() -> TokenUsageStore {
        TokenUsageStore::isolated_for_test("sqlite::memory:", PoolConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_property_8_log_then_query_round_trips() {
        let store = test_store().await;
        let logged = store.log("agent-a", "task-1", 123.5, "claude", None).await.unwrap();

        let results = store
            .query(&TokenUsageQuery {
                agent_id: Some("agent-a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].agent_id, logged.agent_id);
        assert_eq!(results[0].task_id, logged.task_id);
        assert_eq!(results[0].tokens_used, logged.tokens_used);
        assert_eq!(results[0].model_name, logged.model_name);
    }

    #[tokio::test]
    async fn test_s6_time_range_query() {
        // Scenario S6: three records an hour apart; querying the middle
        // 60-minute window returns exactly the middle one.
        let store = test_store().await;
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::hours(1);
        let t2 = t0 + chrono::Duration::hours(2);

        store.log("A", "t", 1.0, "m", Some(t0)).await.unwrap();
        store.log("A", "t", 1.0, "m", Some(t1)).await.unwrap();
        store.log("A", "t", 1.0, "m", Some(t2)).await.unwrap();

        let results = store
            .query(&TokenUsageQuery {
                agent_id: Some("A".to_string()),
                start_time: Some(t0 + chrono::Duration::minutes(30)),
                end_time: Some(t0 + chrono::Duration::minutes(90)),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].timestamp, t1);
    }

    #[tokio::test]
    async fn test_property_9_retention_prunes_old_records() {
        let store = test_store().await;
        let old = Utc::now() - chrono::Duration::days(40);
        store.log("A", "t", 1.0, "m", Some(old)).await.unwrap();
        store.log("A", "t", 1.0, "m", None).await.unwrap();

        let deleted = store.prune(30).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.query(&TokenUsageQuery::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_logs_all_durable() {
        let store = std::sync::Arc::new(test_store().await);
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.log("A", format!("task-{i}"), i as f64, "m", None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let results = store
            .query(&TokenUsageQuery {
                agent_id: Some("A".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 20);
    }
}
