//! Execution and step records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::ResourceId;

/// One concrete run of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier.
    pub id: ResourceId,
    /// Flow definition ID.
    pub flow_id: ResourceId,
    /// Current status.
    pub status: ExecutionStatus,
    /// Steps across all three phases.
    pub total_steps: u32,
    /// Main/setup/teardown steps that completed successfully.
    pub passed_steps: u32,
    /// Steps that failed after retry exhaustion.
    pub failed_steps: u32,
    /// When the executor picked the run up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the executor returned.
    pub finished_at: Option<DateTime<Utc>>,
    /// `finished_at - started_at` in milliseconds.
    pub duration_ms: Option<i64>,
    /// Variables passed into this run.
    pub variables: HashMap<String, String>,
    /// Opaque environment label ("staging", "ci", ...).
    pub environment: Option<String>,
    /// First fatal step failure, if any.
    pub error_message: Option<String>,
}

impl Execution {
    /// Create a pending execution for a flow.
    pub fn new(flow_id: ResourceId, variables: HashMap<String, String>) -> Self {
        Self {
            id: ResourceId::new(),
            flow_id,
            status: ExecutionStatus::Pending,
            total_steps: 0,
            passed_steps: 0,
            failed_steps: 0,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            variables,
            environment: None,
            error_message: None,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Mark the execution as running.
    pub fn start(&mut self, total_steps: u32) {
        self.status = ExecutionStatus::Running;
        self.total_steps = total_steps;
        self.started_at = Some(Utc::now());
    }

    /// Transition to a terminal status and stamp the duration.
    pub fn finish(&mut self, status: ExecutionStatus, error_message: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error_message = error_message;
        let finished = Utc::now();
        self.finished_at = Some(finished);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((finished - started).num_milliseconds());
        }
    }
}

/// Overall execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(crate::Error::Internal(format!(
                "unknown execution status '{other}'"
            ))),
        }
    }
}

/// One step of one execution.
///
/// Step records are append-and-update: created in `running`, transitioned
/// once to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Unique identifier.
    pub id: ResourceId,
    /// Execution this step belongs to.
    pub execution_id: ResourceId,
    /// Step identifier within the flow (user-supplied or `<phase>_<index>`).
    pub step_id: String,
    /// Human-readable step name.
    pub step_name: String,
    /// Action identifier.
    pub action: String,
    /// Current status.
    pub status: StepStatus,
    /// Attempt that produced the terminal state, counted from 1.
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// The action's result mapping.
    pub output: Map<String, Value>,
    pub error_message: Option<String>,
}

impl ExecutionStep {
    /// Create a running step record.
    pub fn start(
        execution_id: ResourceId,
        step_id: impl Into<String>,
        step_name: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            execution_id,
            step_id: step_id.into(),
            step_name: step_name.into(),
            action: action.into(),
            status: StepStatus::Running,
            attempt: 1,
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_ms: None,
            output: Map::new(),
            error_message: None,
        }
    }

    /// Transition to `completed` with the action result.
    pub fn complete(&mut self, output: Map<String, Value>) {
        self.status = StepStatus::Completed;
        self.output = output;
        self.stamp_finished();
    }

    /// Transition to `failed` with an error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error_message = Some(error.into());
        self.stamp_finished();
    }

    fn stamp_finished(&mut self) {
        let finished = Utc::now();
        self.finished_at = Some(finished);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((finished - started).num_milliseconds());
        }
    }
}

/// Status of a step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(crate::Error::Internal(format!(
                "unknown step status '{other}'"
            ))),
        }
    }
}
