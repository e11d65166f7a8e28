//! Broadcast event types.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ResourceId;
use crate::execution::{Execution, ExecutionStep};

/// Event delivered to execution observers (dashboards, CLI, websockets).
///
/// Wire shape: `{ "type": "...", "execution_id": "...", "data": { ... } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: ResourceId,
    pub data: Value,
}

/// The six event types observers can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
}

impl ExecutionEvent {
    pub fn execution_started(execution: &Execution, flow_name: &str) -> Self {
        Self {
            event_type: EventType::ExecutionStarted,
            execution_id: execution.id,
            data: json!({
                "flow_id": execution.flow_id,
                "flow_name": flow_name,
                "total_steps": execution.total_steps,
            }),
        }
    }

    pub fn execution_completed(execution: &Execution) -> Self {
        Self {
            event_type: EventType::ExecutionCompleted,
            execution_id: execution.id,
            data: json!({
                "status": execution.status,
                "passed_steps": execution.passed_steps,
                "failed_steps": execution.failed_steps,
                "duration_ms": execution.duration_ms,
            }),
        }
    }

    pub fn execution_failed(execution: &Execution) -> Self {
        Self {
            event_type: EventType::ExecutionFailed,
            execution_id: execution.id,
            data: json!({
                "status": execution.status,
                "passed_steps": execution.passed_steps,
                "failed_steps": execution.failed_steps,
                "duration_ms": execution.duration_ms,
                "error_message": execution.error_message,
            }),
        }
    }

    pub fn step_started(step: &ExecutionStep) -> Self {
        Self {
            event_type: EventType::StepStarted,
            execution_id: step.execution_id,
            data: json!({
                "step_id": step.step_id,
                "step_name": step.step_name,
                "action": step.action,
                "attempt": step.attempt,
            }),
        }
    }

    pub fn step_completed(step: &ExecutionStep) -> Self {
        Self {
            event_type: EventType::StepCompleted,
            execution_id: step.execution_id,
            data: json!({
                "step_id": step.step_id,
                "step_name": step.step_name,
                "action": step.action,
                "status": step.status,
                "duration_ms": step.duration_ms,
            }),
        }
    }

    pub fn step_failed(step: &ExecutionStep) -> Self {
        Self {
            event_type: EventType::StepFailed,
            execution_id: step.execution_id,
            data: json!({
                "step_id": step.step_id,
                "step_name": step.step_name,
                "action": step.action,
                "status": step.status,
                "duration_ms": step.duration_ms,
                "error_message": step.error_message,
            }),
        }
    }
}
