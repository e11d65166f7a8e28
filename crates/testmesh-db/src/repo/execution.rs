//! Execution and step persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::RwLock;

use testmesh_core::execution::{Execution, ExecutionStep};
use testmesh_core::store::ExecutionStore;
use testmesh_core::{Error, ResourceId, Result};

use crate::{DbError, DbResult};

/// An execution row with blob-JSON variables.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionRecord {
    pub id: uuid::Uuid,
    pub flow_id: uuid::Uuid,
    pub status: String,
    pub total_steps: i32,
    pub passed_steps: i32,
    pub failed_steps: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub variables: serde_json::Value,
    pub environment: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn to_execution(&self) -> DbResult<Execution> {
        let variables: HashMap<String, String> = serde_json::from_value(self.variables.clone())
            .map_err(|e| DbError::Corrupt(format!("execution {}: {e}", self.id)))?;
        Ok(Execution {
            id: ResourceId::from_uuid(self.id),
            flow_id: ResourceId::from_uuid(self.flow_id),
            status: self
                .status
                .parse()
                .map_err(|e| DbError::Corrupt(format!("execution {}: {e}", self.id)))?,
            total_steps: self.total_steps.max(0) as u32,
            passed_steps: self.passed_steps.max(0) as u32,
            failed_steps: self.failed_steps.max(0) as u32,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            variables,
            environment: self.environment.clone(),
            error_message: self.error_message.clone(),
        })
    }
}

/// A step row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionStepRecord {
    pub id: uuid::Uuid,
    pub execution_id: uuid::Uuid,
    pub step_id: String,
    pub step_name: String,
    pub action: String,
    pub status: String,
    pub attempt: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output: serde_json::Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionStepRecord {
    pub fn to_step(&self) -> DbResult<ExecutionStep> {
        let output = self
            .output
            .as_object()
            .cloned()
            .ok_or_else(|| DbError::Corrupt(format!("step {}: output is not an object", self.id)))?;
        Ok(ExecutionStep {
            id: ResourceId::from_uuid(self.id),
            execution_id: ResourceId::from_uuid(self.execution_id),
            step_id: self.step_id.clone(),
            step_name: self.step_name.clone(),
            action: self.action.clone(),
            status: self
                .status
                .parse()
                .map_err(|e| DbError::Corrupt(format!("step {}: {e}", self.id)))?,
            attempt: self.attempt.max(1) as u32,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            output,
            error_message: self.error_message.clone(),
        })
    }
}

/// PostgreSQL implementation of the executor's persistence gateway.
///
/// Every call commits independently; the executor tolerates lost step
/// writes and retries only the terminal execution update.
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_execution(&self, id: ResourceId) -> DbResult<ExecutionRecord> {
        let record =
            sqlx::query_as::<_, ExecutionRecord>("SELECT * FROM executions WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("execution {id}")))?;
        Ok(record)
    }

    pub async fn list_executions(
        &self,
        flow_id: ResourceId,
        limit: i64,
    ) -> DbResult<Vec<ExecutionRecord>> {
        let records = sqlx::query_as::<_, ExecutionRecord>(
            "SELECT * FROM executions WHERE flow_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(flow_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn list_steps(&self, execution_id: ResourceId) -> DbResult<Vec<ExecutionStepRecord>> {
        let records = sqlx::query_as::<_, ExecutionStepRecord>(
            "SELECT * FROM execution_steps WHERE execution_id = $1 ORDER BY created_at",
        )
        .bind(execution_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, flow_id, status, total_steps, passed_steps, failed_steps,
                 started_at, finished_at, duration_ms, variables, environment,
                 error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(execution.flow_id.as_uuid())
        .bind(execution.status.as_str())
        .bind(execution.total_steps as i32)
        .bind(execution.passed_steps as i32)
        .bind(execution.failed_steps as i32)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.duration_ms)
        .bind(serde_json::to_value(&execution.variables).unwrap_or_default())
        .bind(&execution.environment)
        .bind(&execution.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions SET
                status = $2, total_steps = $3, passed_steps = $4, failed_steps = $5,
                started_at = $6, finished_at = $7, duration_ms = $8,
                error_message = $9
            WHERE id = $1
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(execution.status.as_str())
        .bind(execution.total_steps as i32)
        .bind(execution.passed_steps as i32)
        .bind(execution.failed_steps as i32)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.duration_ms)
        .bind(&execution.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    async fn create_step(&self, step: &ExecutionStep) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_steps
                (id, execution_id, step_id, step_name, action, status, attempt,
                 started_at, finished_at, duration_ms, output, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.execution_id.as_uuid())
        .bind(&step.step_id)
        .bind(&step.step_name)
        .bind(&step.action)
        .bind(step.status.as_str())
        .bind(step.attempt as i32)
        .bind(step.started_at)
        .bind(step.finished_at)
        .bind(step.duration_ms)
        .bind(serde_json::Value::Object(step.output.clone()))
        .bind(&step.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    async fn update_step(&self, step: &ExecutionStep) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE execution_steps SET
                status = $2, attempt = $3, finished_at = $4, duration_ms = $5,
                output = $6, error_message = $7
            WHERE id = $1
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.status.as_str())
        .bind(step.attempt as i32)
        .bind(step.finished_at)
        .bind(step.duration_ms)
        .bind(serde_json::Value::Object(step.output.clone()))
        .bind(&step.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    async fn get_steps(&self, execution_id: ResourceId) -> Result<Vec<ExecutionStep>> {
        let records = self
            .list_steps(execution_id)
            .await
            .map_err(testmesh_core::Error::from)?;
        records
            .iter()
            .map(|r| r.to_step().map_err(testmesh_core::Error::from))
            .collect()
    }
}

/// In-memory store for tests and detached CLI runs.
#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: RwLock<HashMap<uuid::Uuid, Execution>>,
    steps: RwLock<Vec<ExecutionStep>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution(&self, id: ResourceId) -> Option<Execution> {
        self.executions.read().unwrap().get(id.as_uuid()).cloned()
    }

    pub fn all_steps(&self) -> Vec<ExecutionStep> {
        self.steps.read().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        self.executions
            .write()
            .unwrap()
            .insert(*execution.id.as_uuid(), execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        self.executions
            .write()
            .unwrap()
            .insert(*execution.id.as_uuid(), execution.clone());
        Ok(())
    }

    async fn create_step(&self, step: &ExecutionStep) -> Result<()> {
        self.steps.write().unwrap().push(step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &ExecutionStep) -> Result<()> {
        let mut steps = self.steps.write().unwrap();
        match steps.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(())
    }

    async fn get_steps(&self, execution_id: ResourceId) -> Result<Vec<ExecutionStep>> {
        Ok(self
            .steps
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_updates_in_place() {
        let store = MemoryExecutionStore::new();
        let mut step = ExecutionStep::start(ResourceId::new(), "s1", "Step", "log");
        store.create_step(&step).await.unwrap();

        let mut output = serde_json::Map::new();
        output.insert("logged".into(), json!(true));
        step.complete(output);
        store.update_step(&step).await.unwrap();

        let steps = store.get_steps(step.execution_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(
            steps[0].status,
            testmesh_core::execution::StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_memory_store_round_trips_executions() {
        let store = MemoryExecutionStore::new();
        let mut execution = Execution::new(ResourceId::new(), HashMap::new());
        store.create_execution(&execution).await.unwrap();

        execution.start(2);
        execution.finish(testmesh_core::execution::ExecutionStatus::Completed, None);
        store.update_execution(&execution).await.unwrap();

        let stored = store.execution(execution.id).unwrap();
        assert_eq!(
            stored.status,
            testmesh_core::execution::ExecutionStatus::Completed
        );
        assert_eq!(stored.total_steps, 2);
    }

    #[test]
    fn test_record_status_round_trip() {
        let record = ExecutionRecord {
            id: uuid::Uuid::now_v7(),
            flow_id: uuid::Uuid::now_v7(),
            status: "running".to_string(),
            total_steps: 3,
            passed_steps: 1,
            failed_steps: 0,
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_ms: None,
            variables: json!({ "K": "v" }),
            environment: Some("staging".to_string()),
            error_message: None,
            created_at: Utc::now(),
        };

        let execution = record.to_execution().unwrap();
        assert_eq!(
            execution.status,
            testmesh_core::execution::ExecutionStatus::Running
        );
        assert_eq!(execution.variables["K"], "v");
        assert_eq!(execution.environment.as_deref(), Some("staging"));
    }

    #[test]
    fn test_corrupt_record_is_rejected() {
        let record = ExecutionRecord {
            id: uuid::Uuid::now_v7(),
            flow_id: uuid::Uuid::now_v7(),
            status: "sideways".to_string(),
            total_steps: 0,
            passed_steps: 0,
            failed_steps: 0,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            variables: json!({}),
            environment: None,
            error_message: None,
            created_at: Utc::now(),
        };
        assert!(matches!(record.to_execution(), Err(DbError::Corrupt(_))));
    }
}
