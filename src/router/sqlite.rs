use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::log::SignalLog;
use super::signal::{DeliveryState, Signal, SignalKind};
use crate::models::ExecutionId;
use crate::persistence::StoreError;
use crate::registry::sqlite::{corrupt, parse_json, parse_time};

/// Signal log sharing the registry's SQLite pool
pub struct SqliteSignalLog {
    pool: SqlitePool,
}

impl SqliteSignalLog {
    /// Expects the schema from `migrations/` to be applied already
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn signal_from_row(row: &SqliteRow) -> Result<Signal, StoreError> {
        let id: i64 = row.try_get("id")?;
        let kind: String = row.try_get("kind")?;
        let payload: String = row.try_get("payload")?;
        let status: String = row.try_get("status")?;
        let attempts: i64 = row.try_get("attempts")?;
        let last_error: Option<String> = row.try_get("last_error")?;
        let emitted_at: String = row.try_get("emitted_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        let attempts = attempts as u32;
        let state = match status.as_str() {
            "pending" => DeliveryState::Pending,
            "delivering" => DeliveryState::Delivering { attempts },
            "handled" => DeliveryState::Handled { attempts },
            "dead_lettered" => DeliveryState::DeadLettered {
                attempts,
                error: last_error.unwrap_or_default(),
            },
            other => return Err(corrupt(format!("unknown signal status '{}'", other))),
        };

        Ok(Signal {
            id: id as u64,
            execution_id: ExecutionId::new(row.try_get::<String, _>("execution_id")?),
            kind: SignalKind::from(kind),
            payload: parse_json(&payload)?,
            state,
            emitted_at: parse_time(&emitted_at)?,
            updated_at: parse_time(&updated_at)?,
        })
    }
}

#[async_trait]
impl SignalLog for SqliteSignalLog {
    async fn append(
        &self,
        execution_id: &ExecutionId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<Signal, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO signal_log (execution_id, kind, payload, status, attempts, emitted_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)
            "#,
        )
        .bind(execution_id.as_str())
        .bind(kind.as_str())
        .bind(payload.to_string())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Signal {
            id: result.last_insert_rowid() as u64,
            execution_id: execution_id.clone(),
            kind,
            payload,
            state: DeliveryState::Pending,
            emitted_at: now,
            updated_at: now,
        })
    }

    async fn update_state(&self, id: u64, state: DeliveryState) -> Result<(), StoreError> {
        let last_error = match &state {
            DeliveryState::DeadLettered { error, .. } => Some(error.clone()),
            _ => None,
        };
        let result = sqlx::query(
            "UPDATE signal_log SET status = ?2, attempts = ?3, last_error = ?4, updated_at = ?5 WHERE id = ?1",
        )
        .bind(id as i64)
        .bind(state.status_str())
        .bind(state.attempts() as i64)
        .bind(last_error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("signal {}", id)));
        }
        Ok(())
    }

    async fn get(&self, id: u64) -> Result<Option<Signal>, StoreError> {
        let row = sqlx::query("SELECT * FROM signal_log WHERE id = ?1")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::signal_from_row).transpose()
    }

    async fn list(&self, execution_id: Option<&ExecutionId>) -> Result<Vec<Signal>, StoreError> {
        let rows = match execution_id {
            Some(id) => {
                sqlx::query("SELECT * FROM signal_log WHERE execution_id = ?1 ORDER BY id ASC")
                    .bind(id.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM signal_log ORDER BY id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::signal_from_row).collect()
    }

    async fn unsettled(&self) -> Result<Vec<Signal>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM signal_log WHERE status IN ('pending', 'delivering') ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::signal_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::registry::SqliteRegistryStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_signal_log() {
        let dir = TempDir::new().unwrap();
        let store = SqliteRegistryStore::connect(&DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("bridge.db").display()),
            max_connections: 2,
            auto_migrate: true,
        })
        .await
        .unwrap();
        let log = SqliteSignalLog::new(store.pool().clone());
        let wf = ExecutionId::new("wf-sql");

        let signal = log
            .append(&wf, SignalKind::custom("review_requested"), serde_json::json!({"n": 1}))
            .await
            .unwrap();
        log.update_state(
            signal.id,
            DeliveryState::DeadLettered {
                attempts: 3,
                error: "handler down".into(),
            },
        )
        .await
        .unwrap();

        let stored = log.get(signal.id).await.unwrap().unwrap();
        assert_eq!(stored.kind, SignalKind::Custom("review_requested".into()));
        assert_eq!(stored.payload["n"], 1);
        assert!(matches!(stored.state, DeliveryState::DeadLettered { attempts: 3, .. }));
        assert!(log.unsettled().await.unwrap().is_empty());
    }
}
