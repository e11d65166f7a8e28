//! Flow storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::RwLock;

use testmesh_core::ResourceId;
use testmesh_core::flow::Flow;

use crate::{DbError, DbResult};

/// A flow definition row. The definition itself lives in a JSON blob
/// column; name and version are denormalized for listings.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FlowRecord {
    pub id: uuid::Uuid,
    pub name: String,
    pub version: String,
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowRecord {
    /// Decode the stored definition, stamping the record id into it.
    pub fn to_flow(&self) -> DbResult<Flow> {
        let mut flow: Flow = serde_json::from_value(self.definition.clone())
            .map_err(|e| DbError::Corrupt(format!("flow {}: {e}", self.id)))?;
        flow.id = Some(ResourceId::from_uuid(self.id));
        Ok(flow)
    }
}

#[async_trait]
pub trait FlowRepo: Send + Sync {
    async fn create(&self, flow: &Flow) -> DbResult<FlowRecord>;
    async fn get_by_id(&self, id: ResourceId) -> DbResult<FlowRecord>;
    async fn list(&self) -> DbResult<Vec<FlowRecord>>;
    async fn update(&self, id: ResourceId, flow: &Flow) -> DbResult<FlowRecord>;
    async fn delete(&self, id: ResourceId) -> DbResult<()>;
}

/// PostgreSQL implementation of FlowRepo.
pub struct PgFlowRepo {
    pool: PgPool,
}

impl PgFlowRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowRepo for PgFlowRepo {
    async fn create(&self, flow: &Flow) -> DbResult<FlowRecord> {
        let definition = serde_json::to_value(flow)
            .map_err(|e| DbError::Corrupt(format!("unserializable flow: {e}")))?;
        let record = sqlx::query_as::<_, FlowRecord>(
            r#"
            INSERT INTO flows (id, name, version, definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&flow.name)
        .bind(&flow.version)
        .bind(definition)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<FlowRecord> {
        let record = sqlx::query_as::<_, FlowRecord>("SELECT * FROM flows WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("flow {id}")))?;
        Ok(record)
    }

    async fn list(&self) -> DbResult<Vec<FlowRecord>> {
        let records = sqlx::query_as::<_, FlowRecord>("SELECT * FROM flows ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn update(&self, id: ResourceId, flow: &Flow) -> DbResult<FlowRecord> {
        let definition = serde_json::to_value(flow)
            .map_err(|e| DbError::Corrupt(format!("unserializable flow: {e}")))?;
        let record = sqlx::query_as::<_, FlowRecord>(
            r#"
            UPDATE flows SET name = $2, version = $3, definition = $4, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(&flow.name)
        .bind(&flow.version)
        .bind(definition)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("flow {id}")))?;
        Ok(record)
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM flows WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory FlowRepo for tests and local CLI runs.
#[derive(Default)]
pub struct MemoryFlowRepo {
    flows: RwLock<HashMap<uuid::Uuid, FlowRecord>>,
}

impl MemoryFlowRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowRepo for MemoryFlowRepo {
    async fn create(&self, flow: &Flow) -> DbResult<FlowRecord> {
        let definition = serde_json::to_value(flow)
            .map_err(|e| DbError::Corrupt(format!("unserializable flow: {e}")))?;
        let now = Utc::now();
        let record = FlowRecord {
            id: uuid::Uuid::now_v7(),
            name: flow.name.clone(),
            version: flow.version.clone(),
            definition,
            created_at: now,
            updated_at: now,
        };
        self.flows.write().unwrap().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<FlowRecord> {
        self.flows
            .read()
            .unwrap()
            .get(id.as_uuid())
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("flow {id}")))
    }

    async fn list(&self) -> DbResult<Vec<FlowRecord>> {
        let mut records: Vec<_> = self.flows.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn update(&self, id: ResourceId, flow: &Flow) -> DbResult<FlowRecord> {
        let definition = serde_json::to_value(flow)
            .map_err(|e| DbError::Corrupt(format!("unserializable flow: {e}")))?;
        let mut flows = self.flows.write().unwrap();
        let record = flows
            .get_mut(id.as_uuid())
            .ok_or_else(|| DbError::NotFound(format!("flow {id}")))?;
        record.name = flow.name.clone();
        record.version = flow.version.clone();
        record.definition = definition;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        self.flows.write().unwrap().remove(id.as_uuid());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testmesh_core::flow::Step;

    fn sample_flow() -> Flow {
        Flow {
            id: None,
            name: "sample".to_string(),
            version: "1".to_string(),
            env: HashMap::new(),
            setup: Vec::new(),
            steps: vec![Step {
                id: Some("s".to_string()),
                name: "s".to_string(),
                action: "log".to_string(),
                config: serde_json::Map::new(),
                assert: Vec::new(),
                output: HashMap::new(),
                retry: None,
            }],
            teardown: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_memory_repo_round_trip() {
        let repo = MemoryFlowRepo::new();
        let record = repo.create(&sample_flow()).await.unwrap();

        let fetched = repo.get_by_id(ResourceId::from_uuid(record.id)).await.unwrap();
        assert_eq!(fetched.name, "sample");

        let flow = fetched.to_flow().unwrap();
        assert_eq!(flow.id, Some(ResourceId::from_uuid(record.id)));
        assert_eq!(flow.steps.len(), 1);

        repo.delete(ResourceId::from_uuid(record.id)).await.unwrap();
        assert!(repo.get_by_id(ResourceId::from_uuid(record.id)).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_repo_lists_sorted_by_name() {
        let repo = MemoryFlowRepo::new();
        let mut b = sample_flow();
        b.name = "bbb".to_string();
        let mut a = sample_flow();
        a.name = "aaa".to_string();
        repo.create(&b).await.unwrap();
        repo.create(&a).await.unwrap();

        let names: Vec<String> = repo.list().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["aaa", "bbb"]);
    }
}
