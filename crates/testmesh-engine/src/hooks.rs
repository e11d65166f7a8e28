//! Debug interception hooks.
//!
//! A hook installed on the executor is consulted before and after every
//! step. Hooks are never retried and can never fail a step on their own;
//! the only influence the before-hook has is pausing (by awaiting) or
//! aborting the execution.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use testmesh_core::handler::Output;
use testmesh_core::{Error, ResourceId};

/// What the executor should do after the before-hook returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDecision {
    /// Run the step normally.
    #[default]
    Continue,
    /// Abort the execution; the current step is recorded as failed without
    /// being attempted.
    Abort,
}

/// Context passed to the before-hook.
#[derive(Debug)]
pub struct BeforeStep<'a> {
    pub execution_id: ResourceId,
    pub step_id: &'a str,
    pub step_name: &'a str,
    pub action: &'a str,
    /// The step config after interpolation.
    pub config: &'a Value,
}

/// Context passed to the after-hook.
#[derive(Debug)]
pub struct AfterStep<'a> {
    pub execution_id: ResourceId,
    pub step_id: &'a str,
    pub output: Option<&'a Output>,
    pub failure: Option<&'a Error>,
    pub duration: Duration,
}

/// Debug interception installed on the executor.
///
/// A hook that wants to pause execution simply awaits in `before_step`;
/// the executor makes no attempt to time hooks out.
#[async_trait]
pub trait StepHook: Send + Sync {
    async fn before_step(&self, step: BeforeStep<'_>) -> HookDecision {
        let _ = step;
        HookDecision::Continue
    }

    async fn after_step(&self, step: AfterStep<'_>) {
        let _ = step;
    }
}
