use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;

use super::store::RegistryStore;
use crate::config::DatabaseConfig;
use crate::models::{
    AgentAssignment, AgentId, AssignmentId, AssignmentStatus, ExecutionId, IssueId,
    MappingStatus, ResultType, WorkType, WorkflowMapping, WorkflowResult,
};
use crate::persistence::StoreError;
use crate::priority::Priority;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Backend(format!("migration failed: {}", e))
    }
}

pub(crate) fn corrupt(what: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        reason: what.to_string(),
    }
}

pub(crate) fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_opt_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_time).transpose()
}

pub(crate) fn parse_json(raw: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(format!("bad JSON column: {}", e)))
}

/// Registry backed by SQLite through a connection pool
pub struct SqliteRegistryStore {
    pool: SqlitePool,
}

impl SqliteRegistryStore {
    /// Create the database if missing, connect, and optionally run migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        if !sqlx::Sqlite::database_exists(&config.url).await? {
            info!("Creating database at {}", config.url);
            sqlx::Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        if config.auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn mapping_from_row(row: &SqliteRow) -> Result<WorkflowMapping, StoreError> {
        let work_type: String = row.try_get("work_type")?;
        let status: String = row.try_get("status")?;
        let priority: i64 = row.try_get("priority")?;
        let metadata: String = row.try_get("metadata")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let seq: i64 = row.try_get("seq")?;

        Ok(WorkflowMapping {
            issue_id: IssueId::new(row.try_get::<String, _>("issue_id")?),
            execution_id: ExecutionId::new(row.try_get::<String, _>("execution_id")?),
            work_type: work_type.parse::<WorkType>().map_err(corrupt)?,
            status: status.parse::<MappingStatus>().map_err(corrupt)?,
            status_reason: row.try_get("status_reason")?,
            priority: Priority::try_from(priority as u8).map_err(corrupt)?,
            parent: row
                .try_get::<Option<String>, _>("parent_execution_id")?
                .map(ExecutionId::new),
            metadata: parse_json(&metadata)?,
            seq: seq as u64,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
            completed_at: parse_opt_time(row.try_get("completed_at")?)?,
        })
    }

    fn assignment_from_row(row: &SqliteRow) -> Result<AgentAssignment, StoreError> {
        let agent_type: String = row.try_get("agent_type")?;
        let status: String = row.try_get("status")?;
        let assigned_at: String = row.try_get("assigned_at")?;
        let id: i64 = row.try_get("id")?;
        let step_number: i64 = row.try_get("step_number")?;
        let attempt: i64 = row.try_get("attempt")?;

        Ok(AgentAssignment {
            id: AssignmentId(id as u64),
            execution_id: ExecutionId::new(row.try_get::<String, _>("execution_id")?),
            agent_type: agent_type.parse::<WorkType>().map_err(corrupt)?,
            agent_id: AgentId::new(row.try_get::<String, _>("agent_id")?),
            step_number: step_number as u32,
            step_name: row.try_get("step_name")?,
            status: status.parse::<AssignmentStatus>().map_err(corrupt)?,
            attempt: attempt as u32,
            handoff_from: row
                .try_get::<Option<String>, _>("handoff_from")?
                .map(AgentId::new),
            handoff_to: row
                .try_get::<Option<String>, _>("handoff_to")?
                .map(AgentId::new),
            assigned_at: parse_time(&assigned_at)?,
            started_at: parse_opt_time(row.try_get("started_at")?)?,
            completed_at: parse_opt_time(row.try_get("completed_at")?)?,
        })
    }

    fn result_from_row(row: &SqliteRow) -> Result<WorkflowResult, StoreError> {
        let agent_type: String = row.try_get("agent_type")?;
        let result_type: String = row.try_get("result_type")?;
        let payload: String = row.try_get("payload")?;
        let artifacts: String = row.try_get("artifacts")?;
        let resource_usage: Option<String> = row.try_get("resource_usage")?;
        let duration_ms: Option<i64> = row.try_get("duration_ms")?;
        let recorded_at: String = row.try_get("recorded_at")?;

        Ok(WorkflowResult {
            execution_id: ExecutionId::new(row.try_get::<String, _>("execution_id")?),
            agent_type: agent_type.parse::<WorkType>().map_err(corrupt)?,
            result_type: serde_json::from_value::<ResultType>(serde_json::Value::String(
                result_type,
            ))?,
            payload: parse_json(&payload)?,
            confidence: row.try_get("confidence")?,
            quality_score: row.try_get("quality_score")?,
            duration_ms: duration_ms.map(|d| d as u64),
            artifacts: serde_json::from_str(&artifacts)?,
            resource_usage: resource_usage.as_deref().map(parse_json).transpose()?,
            recorded_at: parse_time(&recorded_at)?,
        })
    }
}

#[async_trait]
impl RegistryStore for SqliteRegistryStore {
    async fn snapshot_token(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS token FROM workflow_mappings")
            .fetch_one(&self.pool)
            .await?;
        let token: i64 = row.try_get("token")?;
        Ok(token as u64)
    }

    async fn insert_mapping(&self, mut mapping: WorkflowMapping) -> Result<WorkflowMapping, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_mappings
                (execution_id, issue_id, work_type, status, status_reason, priority,
                 parent_execution_id, metadata, created_at, updated_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(mapping.execution_id.as_str())
        .bind(mapping.issue_id.as_str())
        .bind(mapping.work_type.as_str())
        .bind(mapping.status.as_str())
        .bind(mapping.status_reason.as_deref())
        .bind(mapping.priority.value() as i64)
        .bind(mapping.parent.as_ref().map(|p| p.as_str().to_string()))
        .bind(mapping.metadata.to_string())
        .bind(mapping.created_at.to_rfc3339())
        .bind(mapping.updated_at.to_rfc3339())
        .bind(mapping.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        mapping.seq = result.last_insert_rowid() as u64;
        Ok(mapping)
    }

    async fn update_mapping(&self, mapping: &WorkflowMapping) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_mappings
            SET status = ?2, status_reason = ?3, priority = ?4, metadata = ?5,
                updated_at = ?6, completed_at = ?7
            WHERE execution_id = ?1
            "#,
        )
        .bind(mapping.execution_id.as_str())
        .bind(mapping.status.as_str())
        .bind(mapping.status_reason.as_deref())
        .bind(mapping.priority.value() as i64)
        .bind(mapping.metadata.to_string())
        .bind(mapping.updated_at.to_rfc3339())
        .bind(mapping.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("mapping {}", mapping.execution_id)));
        }
        Ok(())
    }

    async fn get_mapping(&self, id: &ExecutionId) -> Result<Option<WorkflowMapping>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_mappings WHERE execution_id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::mapping_from_row).transpose()
    }

    async fn find_by_issue(&self, issue_id: &IssueId) -> Result<Option<WorkflowMapping>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_mappings WHERE issue_id = ?1")
            .bind(issue_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::mapping_from_row).transpose()
    }

    async fn list_mappings(
        &self,
        status: Option<MappingStatus>,
    ) -> Result<Vec<WorkflowMapping>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM workflow_mappings WHERE status = ?1 ORDER BY seq ASC")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM workflow_mappings ORDER BY seq ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::mapping_from_row).collect()
    }

    async fn insert_assignment(
        &self,
        mut assignment: AgentAssignment,
    ) -> Result<AgentAssignment, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO agent_assignments
                (execution_id, agent_type, agent_id, step_number, step_name, status, attempt,
                 handoff_from, handoff_to, assigned_at, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(assignment.execution_id.as_str())
        .bind(assignment.agent_type.as_str())
        .bind(assignment.agent_id.as_str())
        .bind(assignment.step_number as i64)
        .bind(&assignment.step_name)
        .bind(assignment.status.as_str())
        .bind(assignment.attempt as i64)
        .bind(assignment.handoff_from.as_ref().map(|a| a.as_str().to_string()))
        .bind(assignment.handoff_to.as_ref().map(|a| a.as_str().to_string()))
        .bind(assignment.assigned_at.to_rfc3339())
        .bind(assignment.started_at.map(|t| t.to_rfc3339()))
        .bind(assignment.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        assignment.id = AssignmentId(result.last_insert_rowid() as u64);
        Ok(assignment)
    }

    async fn update_assignment(&self, assignment: &AgentAssignment) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agent_assignments
            SET status = ?2, handoff_to = ?3, started_at = ?4, completed_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(assignment.id.0 as i64)
        .bind(assignment.status.as_str())
        .bind(assignment.handoff_to.as_ref().map(|a| a.as_str().to_string()))
        .bind(assignment.started_at.map(|t| t.to_rfc3339()))
        .bind(assignment.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("assignment {}", assignment.id)));
        }
        Ok(())
    }

    async fn get_assignment(&self, id: AssignmentId) -> Result<Option<AgentAssignment>, StoreError> {
        let row = sqlx::query("SELECT * FROM agent_assignments WHERE id = ?1")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::assignment_from_row).transpose()
    }

    async fn list_assignments(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<AgentAssignment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM agent_assignments WHERE execution_id = ?1 ORDER BY id ASC",
        )
        .bind(execution_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::assignment_from_row).collect()
    }

    async fn append_result(&self, result: WorkflowResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_results
                (execution_id, agent_type, result_type, payload, confidence, quality_score,
                 duration_ms, artifacts, resource_usage, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(result.execution_id.as_str())
        .bind(result.agent_type.as_str())
        .bind(result.result_type.to_string())
        .bind(result.payload.to_string())
        .bind(result.confidence)
        .bind(result.quality_score)
        .bind(result.duration_ms.map(|d| d as i64))
        .bind(serde_json::to_string(&result.artifacts)?)
        .bind(result.resource_usage.as_ref().map(|u| u.to_string()))
        .bind(result.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_results(
        &self,
        execution_id: Option<&ExecutionId>,
    ) -> Result<Vec<WorkflowResult>, StoreError> {
        let rows = match execution_id {
            Some(id) => {
                sqlx::query("SELECT * FROM workflow_results WHERE execution_id = ?1 ORDER BY id ASC")
                    .bind(id.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM workflow_results ORDER BY id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::result_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqliteRegistryStore {
        let url = format!("sqlite://{}", dir.path().join("bridge.db").display());
        SqliteRegistryStore::connect(&DatabaseConfig {
            url,
            max_connections: 2,
            auto_migrate: true,
        })
        .await
        .unwrap()
    }

    fn mapping(issue: &str, exec: &str) -> WorkflowMapping {
        let now = Utc::now();
        WorkflowMapping {
            issue_id: IssueId::new(issue),
            execution_id: ExecutionId::new(exec),
            work_type: WorkType::Poc,
            status: MappingStatus::Active,
            status_reason: None,
            priority: Priority::Critical,
            parent: None,
            metadata: serde_json::json!({"repo": "beads"}),
            seq: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_mapping_round_trip_and_snapshot_token() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert_eq!(store.snapshot_token().await.unwrap(), 0);

        let first = store.insert_mapping(mapping("bd-1", "wf-poc-1")).await.unwrap();
        let second = store.insert_mapping(mapping("bd-2", "wf-poc-2")).await.unwrap();
        assert!(second.seq > first.seq);
        assert_eq!(store.snapshot_token().await.unwrap(), second.seq);

        let mut loaded = store
            .find_by_issue(&IssueId::new("bd-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.priority, Priority::Critical);
        assert_eq!(loaded.metadata["repo"], "beads");

        loaded.status = MappingStatus::Completed;
        loaded.completed_at = Some(Utc::now());
        store.update_mapping(&loaded).await.unwrap();
        let active = store.list_mappings(Some(MappingStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].execution_id, ExecutionId::new("wf-poc-2"));
    }

    #[tokio::test]
    async fn test_partial_index_rejects_second_active_assignment() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let m = store.insert_mapping(mapping("bd-1", "wf-poc-1")).await.unwrap();

        let assignment = |step: u32| AgentAssignment {
            id: AssignmentId(0),
            execution_id: m.execution_id.clone(),
            agent_type: WorkType::Poc,
            agent_id: AgentId::new("poc-01"),
            step_number: step,
            step_name: "build".to_string(),
            status: AssignmentStatus::Assigned,
            attempt: 1,
            handoff_from: None,
            handoff_to: None,
            assigned_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let first = store.insert_assignment(assignment(1)).await.unwrap();
        assert!(store.insert_assignment(assignment(2)).await.is_err());

        let mut done = first.clone();
        done.status = AssignmentStatus::Cancelled;
        store.update_assignment(&done).await.unwrap();
        let second = store.insert_assignment(assignment(2)).await.unwrap();
        assert!(second.id > first.id);
        assert_eq!(store.list_assignments(&m.execution_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_results_are_appended() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let m = store.insert_mapping(mapping("bd-1", "wf-poc-1")).await.unwrap();
        let result = WorkflowResult::new(
            m.execution_id.clone(),
            WorkType::Poc,
            ResultType::PocResults,
            serde_json::json!({"tests_passed": 12}),
        )
        .with_confidence(0.8)
        .with_artifacts(vec!["src/lib.rs".to_string()]);
        store.append_result(result.clone()).await.unwrap();
        store.append_result(result).await.unwrap();

        let stored = store.list_results(Some(&m.execution_id)).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].result_type, ResultType::PocResults);
        assert_eq!(stored[0].artifacts, vec!["src/lib.rs".to_string()]);
        assert_eq!(stored[0].confidence, Some(0.8));
    }
}
