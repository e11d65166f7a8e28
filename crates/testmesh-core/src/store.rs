//! Persistence gateway used by the executor.

use async_trait::async_trait;

use crate::Result;
use crate::execution::{Execution, ExecutionStep};
use crate::id::ResourceId;

/// Narrow interface the executor uses to persist progress.
///
/// Each call commits independently; no transactions span steps. Step
/// records are created once in `running` and updated once into a terminal
/// state (last-writer-wins on the running row).
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, execution: &Execution) -> Result<()>;
    async fn update_execution(&self, execution: &Execution) -> Result<()>;
    async fn create_step(&self, step: &ExecutionStep) -> Result<()>;
    async fn update_step(&self, step: &ExecutionStep) -> Result<()>;
    /// Steps of an execution in creation order (used by debug hooks and the
    /// API surface).
    async fn get_steps(&self, execution_id: ResourceId) -> Result<Vec<ExecutionStep>>;
}
