//! Flow executor: phases, retries, assertions, events, step records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use testmesh_core::Error as CoreError;
use testmesh_core::execution::{Execution, ExecutionStatus, ExecutionStep};
use testmesh_core::flow::{Backoff, Flow, Step};
use testmesh_core::handler::{CallEnvelope, Output};
use testmesh_core::store::ExecutionStore;
use testmesh_core::event::ExecutionEvent;

use crate::assertions;
use crate::broadcast::BroadcastHub;
use crate::context::ExecutionContext;
use crate::dispatch::ActionDispatcher;
use crate::extract;
use crate::hooks::{AfterStep, BeforeStep, HookDecision, StepHook};

/// How often the terminal execution update is retried before giving up.
const FINALIZE_ATTEMPTS: u32 = 3;

/// Phase of a flow a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Main,
    Teardown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Main => "main",
            Phase::Teardown => "teardown",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure surfaced by the executor.
#[derive(Debug, Error)]
#[error("{phase} step `{step_id}` ({action}) failed: {message}")]
pub struct ExecutionError {
    pub phase: Phase,
    pub step_id: String,
    pub step_name: String,
    pub action: String,
    pub message: String,
    #[source]
    pub source: CoreError,
}

impl ExecutionError {
    fn new(phase: Phase, step: &ExecutionStep, source: CoreError) -> Self {
        Self {
            phase,
            step_id: step.step_id.clone(),
            step_name: step.step_name.clone(),
            action: step.action.clone(),
            message: source.to_string(),
            source,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.source, CoreError::Cancelled | CoreError::Timeout(_))
    }
}

/// Orchestrates one flow: setup → steps → teardown, with retries, events
/// and step records.
///
/// Within one execution, steps run strictly sequentially; step N's output
/// extraction completes before step N+1's config interpolation begins.
pub struct FlowExecutor {
    dispatcher: Arc<ActionDispatcher>,
    store: Arc<dyn ExecutionStore>,
    hub: Arc<BroadcastHub>,
    hook: Option<Arc<dyn StepHook>>,
}

impl FlowExecutor {
    pub fn new(
        dispatcher: Arc<ActionDispatcher>,
        store: Arc<dyn ExecutionStore>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            dispatcher,
            store,
            hub,
            hook: None,
        }
    }

    /// Install a debug interception hook.
    pub fn with_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Execute a flow against an existing execution record, persisting
    /// progress and emitting events.
    pub async fn execute(
        &self,
        execution: &mut Execution,
        flow: &Flow,
        variables: &HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<(), ExecutionError> {
        self.run(execution, flow, variables, cancel, true).await
    }

    /// Fast path without persistence or event emission (load-test
    /// scenarios). Output extraction into the context still occurs, so
    /// inter-step references work.
    pub async fn execute_detached(
        &self,
        flow: &Flow,
        variables: &HashMap<String, String>,
    ) -> (Execution, Result<(), ExecutionError>) {
        let flow_id = flow.id.unwrap_or_default();
        let mut execution = Execution::new(flow_id, variables.clone());
        let result = self
            .run(
                &mut execution,
                flow,
                variables,
                CancellationToken::new(),
                false,
            )
            .await;
        (execution, result)
    }

    async fn run(
        &self,
        execution: &mut Execution,
        flow: &Flow,
        variables: &HashMap<String, String>,
        cancel: CancellationToken,
        record: bool,
    ) -> Result<(), ExecutionError> {
        // Flow env first, user-supplied variables win.
        let mut ctx = ExecutionContext::new();
        for (key, value) in &flow.env {
            ctx.set(key, value);
        }
        for (key, value) in variables {
            ctx.set(key, value);
        }

        execution.start(flow.total_steps());
        info!(
            execution_id = %execution.id,
            flow = %flow.name,
            total_steps = execution.total_steps,
            "Starting execution"
        );
        if record {
            self.persist_execution(execution).await;
            self.hub
                .broadcast(ExecutionEvent::execution_started(execution, &flow.name));
        }

        let mut failure: Option<ExecutionError> = None;

        // Setup: a failure aborts the flow before the main phase.
        if let Err(e) = self
            .run_phase(Phase::Setup, &flow.setup, execution, &mut ctx, &cancel, record)
            .await
        {
            failure = Some(e);
        }

        if failure.is_none() {
            if let Err(e) = self
                .run_phase(Phase::Main, &flow.steps, execution, &mut ctx, &cancel, record)
                .await
            {
                failure = Some(e);
            }

            // Teardown runs whenever the main phase was entered, including
            // after a main failure or caller cancellation. It gets its own
            // root token so the caller's cancellation does not starve it.
            let teardown_cancel = CancellationToken::new();
            if let Err(e) = self
                .run_phase(
                    Phase::Teardown,
                    &flow.teardown,
                    execution,
                    &mut ctx,
                    &teardown_cancel,
                    record,
                )
                .await
            {
                warn!(
                    execution_id = %execution.id,
                    step = %e.step_id,
                    error = %e,
                    "Teardown failure (does not change the execution outcome)"
                );
                // Recorded on the step records above; a completed execution
                // is not demoted by teardown failures.
            }
        }

        let status = match &failure {
            None => ExecutionStatus::Completed,
            Some(e) if e.is_cancellation() => ExecutionStatus::Cancelled,
            Some(_) => ExecutionStatus::Failed,
        };
        execution.finish(status, failure.as_ref().map(|e| e.to_string()));

        if record {
            self.finalize_execution(execution).await;
            let event = match status {
                ExecutionStatus::Completed => ExecutionEvent::execution_completed(execution),
                _ => ExecutionEvent::execution_failed(execution),
            };
            self.hub.broadcast(event);
            self.hub.close(execution.id);
        }

        // Give handlers a chance to release per-execution resources
        // (websocket connections and the like).
        self.dispatcher.notify_execution_end(execution.id).await;

        info!(
            execution_id = %execution.id,
            status = %execution.status.as_str(),
            passed = execution.passed_steps,
            failed = execution.failed_steps,
            "Execution finished"
        );

        match failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn run_phase(
        &self,
        phase: Phase,
        steps: &[Step],
        execution: &mut Execution,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        record: bool,
    ) -> Result<(), ExecutionError> {
        for (index, step) in steps.iter().enumerate() {
            // The first fatal failure ends the phase.
            self.run_step(phase, index, step, execution, ctx, cancel, record)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        phase: Phase,
        index: usize,
        step: &Step,
        execution: &mut Execution,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        record: bool,
    ) -> Result<(), ExecutionError> {
        let step_id = step
            .id
            .clone()
            .unwrap_or_else(|| format!("{}_{}", phase.as_str(), index));

        let mut step_record = ExecutionStep::start(execution.id, &step_id, &step.name, &step.action);
        if record {
            if let Err(e) = self.store.create_step(&step_record).await {
                // Step-record write failures must not fail the run.
                error!(execution_id = %execution.id, step = %step_id, error = %e, "Failed to persist step");
            }
            self.hub.broadcast(ExecutionEvent::step_started(&step_record));
        }

        let config = ctx.interpolate_config(&step.config);

        let mut aborted_by_hook = false;
        if let Some(hook) = &self.hook {
            let decision = hook
                .before_step(BeforeStep {
                    execution_id: execution.id,
                    step_id: &step_id,
                    step_name: &step.name,
                    action: &step.action,
                    config: &config,
                })
                .await;
            aborted_by_hook = decision == HookDecision::Abort;
        }

        let result = if aborted_by_hook {
            Err(CoreError::Internal("aborted by debug hook".to_string()))
        } else {
            self.attempt_action(step, &step_id, execution, ctx, &config, cancel, &mut step_record)
                .await
                .and_then(|output| {
                    // Assertions run once per step; their failures are
                    // final even when a retry policy is present.
                    assertions::evaluate_all(&output, &step.assert)?;
                    Ok(output)
                })
        };

        let outcome = match result {
            Ok(output) => {
                // Extraction is nil-not-missing: every output entry stores
                // something, even when the path did not match.
                let result_value = serde_json::Value::Object(output.clone());
                for (variable, path) in &step.output {
                    let value = extract::evaluate_json_path(&result_value, path);
                    ctx.set_step_output(&step_id, variable, value);
                }

                step_record.complete(output);
                execution.passed_steps += 1;
                if record {
                    self.persist_step(&step_record).await;
                    self.hub.broadcast(ExecutionEvent::step_completed(&step_record));
                }
                info!(
                    execution_id = %execution.id,
                    step = %step_id,
                    attempt = step_record.attempt,
                    duration_ms = step_record.duration_ms.unwrap_or(0),
                    "Step completed"
                );
                Ok(())
            }
            Err(e) => {
                step_record.fail(e.to_string());
                execution.failed_steps += 1;
                if record {
                    self.persist_step(&step_record).await;
                    self.hub.broadcast(ExecutionEvent::step_failed(&step_record));
                }
                warn!(
                    execution_id = %execution.id,
                    step = %step_id,
                    attempt = step_record.attempt,
                    error = %e,
                    "Step failed"
                );
                Err(ExecutionError::new(phase, &step_record, e))
            }
        };

        if let Some(hook) = &self.hook {
            let duration = step_record
                .duration_ms
                .map(|ms| Duration::from_millis(ms.max(0) as u64))
                .unwrap_or_default();
            hook.after_step(AfterStep {
                execution_id: execution.id,
                step_id: &step_id,
                output: outcome.is_ok().then_some(&step_record.output),
                failure: outcome.as_ref().err().map(|e| &e.source),
                duration,
            })
            .await;
        }

        outcome
    }

    /// Resolve the handler and invoke it under the step's retry policy.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_action(
        &self,
        step: &Step,
        step_id: &str,
        execution: &Execution,
        ctx: &ExecutionContext,
        config: &serde_json::Value,
        cancel: &CancellationToken,
        step_record: &mut ExecutionStep,
    ) -> testmesh_core::Result<Output> {
        // Unknown action is fatal on the first attempt, never retried.
        let resolved = self.dispatcher.resolve(&step.action).await?;
        let plan = RetryPlan::for_step(step)?;

        let mut delay = plan.delay;
        let mut attempt = 1u32;

        loop {
            step_record.attempt = attempt;
            let envelope = CallEnvelope::new(execution.id, execution.flow_id, step_id)
                .with_variables(ctx.variables())
                .with_step_outputs(ctx.step_outputs())
                .with_cancel(cancel.clone());

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(CoreError::Cancelled),
                result = resolved.execute(&envelope, config) => result,
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < plan.max_attempts => {
                    warn!(
                        execution_id = %execution.id,
                        step = %step_id,
                        attempt,
                        max_attempts = plan.max_attempts,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    if plan.backoff == Backoff::Exponential {
                        delay *= 2;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn persist_step(&self, step: &ExecutionStep) {
        if let Err(e) = self.store.update_step(step).await {
            error!(step = %step.step_id, error = %e, "Failed to update step record");
        }
    }

    async fn persist_execution(&self, execution: &Execution) {
        if let Err(e) = self.store.update_execution(execution).await {
            error!(execution_id = %execution.id, error = %e, "Failed to update execution record");
        }
    }

    /// The terminal status write is retried best-effort: a lost step record
    /// is tolerable, a lost terminal status is not.
    async fn finalize_execution(&self, execution: &Execution) {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self.store.update_execution(execution).await {
                Ok(()) => return,
                Err(e) if attempt < FINALIZE_ATTEMPTS => {
                    warn!(
                        execution_id = %execution.id,
                        attempt,
                        error = %e,
                        "Retrying terminal execution update"
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => {
                    error!(
                        execution_id = %execution.id,
                        error = %e,
                        "Giving up on terminal execution update"
                    );
                }
            }
        }
    }
}

/// Effective retry settings for one step.
#[derive(Debug, Clone, Copy)]
struct RetryPlan {
    max_attempts: u32,
    delay: Duration,
    backoff: Backoff,
}

impl RetryPlan {
    fn for_step(step: &Step) -> testmesh_core::Result<Self> {
        match &step.retry {
            None => Ok(Self {
                max_attempts: 1,
                delay: Duration::ZERO,
                backoff: Backoff::Fixed,
            }),
            Some(policy) => {
                let delay = match &policy.delay {
                    None => Duration::ZERO,
                    Some(text) => humantime::parse_duration(text).map_err(|e| {
                        CoreError::InvalidConfig(format!("invalid retry delay `{text}`: {e}"))
                    })?,
                };
                Ok(Self {
                    max_attempts: policy.max_attempts.max(1),
                    delay,
                    backoff: policy.backoff,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;
    use testmesh_core::ResourceId;
    use testmesh_core::event::EventType;
    use testmesh_core::handler::ActionHandler;

    // -- test doubles -------------------------------------------------------

    /// In-memory store recording every call.
    #[derive(Default)]
    struct RecordingStore {
        executions: Mutex<Vec<Execution>>,
        steps: Mutex<Vec<ExecutionStep>>,
    }

    #[async_trait]
    impl ExecutionStore for RecordingStore {
        async fn create_execution(&self, execution: &Execution) -> testmesh_core::Result<()> {
            self.executions.lock().unwrap().push(execution.clone());
            Ok(())
        }

        async fn update_execution(&self, execution: &Execution) -> testmesh_core::Result<()> {
            self.executions.lock().unwrap().push(execution.clone());
            Ok(())
        }

        async fn create_step(&self, step: &ExecutionStep) -> testmesh_core::Result<()> {
            self.steps.lock().unwrap().push(step.clone());
            Ok(())
        }

        async fn update_step(&self, step: &ExecutionStep) -> testmesh_core::Result<()> {
            self.steps.lock().unwrap().push(step.clone());
            Ok(())
        }

        async fn get_steps(
            &self,
            execution_id: ResourceId,
        ) -> testmesh_core::Result<Vec<ExecutionStep>> {
            Ok(self
                .steps
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.execution_id == execution_id)
                .cloned()
                .collect())
        }
    }

    /// Echoes its (interpolated) config as output and records every call.
    struct EchoHandler {
        calls: Mutex<Vec<Value>>,
    }

    impl EchoHandler {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ActionHandler for EchoHandler {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            _envelope: &CallEnvelope,
            config: &Value,
        ) -> testmesh_core::Result<Output> {
            self.calls.lock().unwrap().push(config.clone());
            Ok(config.as_object().cloned().unwrap_or_default())
        }
    }

    /// Fails the first `failures` calls, then echoes.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionHandler for FlakyHandler {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            _envelope: &CallEnvelope,
            config: &Value,
        ) -> testmesh_core::Result<Output> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(CoreError::Handler("transient failure".to_string()))
            } else {
                Ok(config.as_object().cloned().unwrap_or_default())
            }
        }
    }

    /// Sleeps until cancelled or the configured duration elapses.
    struct SleepyHandler;

    #[async_trait]
    impl ActionHandler for SleepyHandler {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn execute(
            &self,
            envelope: &CallEnvelope,
            config: &Value,
        ) -> testmesh_core::Result<Output> {
            let ms = config.get("ms").and_then(Value::as_u64).unwrap_or(60_000);
            tokio::select! {
                _ = envelope.cancel.cancelled() => Err(CoreError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Output::new()),
            }
        }
    }

    fn executor_with(
        handlers: Vec<Arc<dyn ActionHandler>>,
    ) -> (FlowExecutor, Arc<RecordingStore>, Arc<BroadcastHub>) {
        let store = Arc::new(RecordingStore::default());
        let hub = Arc::new(BroadcastHub::new());
        let executor = FlowExecutor::new(
            Arc::new(ActionDispatcher::new(handlers)),
            store.clone(),
            hub.clone(),
        );
        (executor, store, hub)
    }

    fn flow(steps: Vec<Step>) -> Flow {
        Flow {
            id: Some(ResourceId::new()),
            name: "test-flow".to_string(),
            version: "1".to_string(),
            env: HashMap::new(),
            setup: Vec::new(),
            steps,
            teardown: Vec::new(),
        }
    }

    fn step(id: &str, action: &str, config: Value) -> Step {
        Step {
            id: Some(id.to_string()),
            name: id.to_string(),
            action: action.to_string(),
            config: config.as_object().cloned().unwrap_or_default(),
            assert: Vec::new(),
            output: HashMap::new(),
            retry: None,
        }
    }

    async fn run(
        executor: &FlowExecutor,
        flow: &Flow,
    ) -> (Execution, Result<(), ExecutionError>) {
        let mut execution = Execution::new(flow.id.unwrap(), HashMap::new());
        let result = executor
            .execute(&mut execution, flow, &HashMap::new(), CancellationToken::new())
            .await;
        (execution, result)
    }

    fn drain_events(
        rx: &mut tokio::sync::broadcast::Receiver<ExecutionEvent>,
    ) -> Vec<EventType> {
        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            types.push(event.event_type);
        }
        types
    }

    // -- tests --------------------------------------------------------------

    #[tokio::test]
    async fn test_chained_outputs_flow_between_steps() {
        let echo = Arc::new(EchoHandler::new());
        let (executor, _store, _hub) = executor_with(vec![echo.clone()]);

        let mut login = step("login", "echo", json!({ "body": { "token": "T" } }));
        login.assert = vec!["len(body) == 1".to_string()];
        login.output = HashMap::from([("token".to_string(), "$.body.token".to_string())]);

        let me = step(
            "me",
            "echo",
            json!({ "headers": { "Authorization": "Bearer ${login.token}" } }),
        );

        let flow = flow(vec![login, me]);
        let (execution, result) = run(&executor, &flow).await;

        result.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.passed_steps, 2);
        assert_eq!(execution.failed_steps, 0);

        // The second handler call saw the extracted output of the first.
        let calls = echo.calls.lock().unwrap();
        assert_eq!(calls[1]["headers"]["Authorization"], "Bearer T");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_exponential_backoff() {
        let flaky = Arc::new(FlakyHandler {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let (executor, store, _hub) = executor_with(vec![flaky.clone()]);

        let mut s = step("retry-me", "flaky", json!({ "ok": true }));
        s.retry = Some(testmesh_core::flow::RetryPolicy {
            max_attempts: 3,
            delay: Some("50ms".to_string()),
            backoff: Backoff::Exponential,
        });

        // Paused tokio time: sleeps auto-advance the virtual clock.
        let started = tokio::time::Instant::now();
        let flow = flow(vec![s]);
        let (execution, result) = run(&executor, &flow).await;

        result.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        // 50ms + 100ms of backoff sleeping.
        assert!(started.elapsed() >= Duration::from_millis(150));

        let steps = store.steps.lock().unwrap();
        let terminal = steps.last().unwrap();
        assert_eq!(terminal.attempt, 3);
        assert_eq!(terminal.status, testmesh_core::execution::StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_retries_exhausted_surface_the_failure() {
        let flaky = Arc::new(FlakyHandler {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let (executor, _store, _hub) = executor_with(vec![flaky.clone()]);

        let mut s = step("hopeless", "flaky", json!({}));
        s.retry = Some(testmesh_core::flow::RetryPolicy {
            max_attempts: 3,
            delay: None,
            backoff: Backoff::Fixed,
        });

        let flow = flow(vec![s]);
        let (execution, result) = run(&executor, &flow).await;

        let err = result.unwrap_err();
        assert_eq!(err.phase, Phase::Main);
        assert_eq!(err.step_id, "hopeless");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        // Invocations bounded by max_attempts.
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_teardown_runs_after_main_failure() {
        let flaky = Arc::new(FlakyHandler {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let echo = Arc::new(EchoHandler::new());
        let (executor, _store, hub) = executor_with(vec![flaky, echo.clone()]);

        let mut f = flow(vec![step("a", "flaky", json!({}))]);
        f.teardown = vec![step("t", "echo", json!({ "cleaned": true }))];

        let mut execution = Execution::new(f.id.unwrap(), HashMap::new());
        let mut rx = hub.subscribe(execution.id);

        let result = executor
            .execute(&mut execution, &f, &HashMap::new(), CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(execution.status, ExecutionStatus::Failed);
        // Teardown ran despite the main failure.
        assert_eq!(echo.calls.lock().unwrap().len(), 1);
        assert_eq!(execution.passed_steps, 1);
        assert_eq!(execution.failed_steps, 1);

        let events = drain_events(&mut rx);
        assert_eq!(
            events,
            vec![
                EventType::ExecutionStarted,
                EventType::StepStarted,
                EventType::StepFailed,
                EventType::StepStarted,
                EventType::StepCompleted,
                EventType::ExecutionFailed,
            ]
        );
    }

    #[tokio::test]
    async fn test_setup_failure_skips_main_phase() {
        let flaky = Arc::new(FlakyHandler {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let echo = Arc::new(EchoHandler::new());
        let (executor, _store, _hub) = executor_with(vec![flaky, echo.clone()]);

        let mut f = flow(vec![step("main-step", "echo", json!({}))]);
        f.setup = vec![step("prepare", "flaky", json!({}))];

        let (execution, result) = run(&executor, &f).await;

        let err = result.unwrap_err();
        assert_eq!(err.phase, Phase::Setup);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(echo.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_fails_without_retry() {
        let (executor, store, _hub) = executor_with(vec![]);

        let mut s = step("mystery", "no_such_action", json!({}));
        s.retry = Some(testmesh_core::flow::RetryPolicy {
            max_attempts: 5,
            delay: Some("10s".to_string()),
            backoff: Backoff::Fixed,
        });

        let started = Instant::now();
        let flow = flow(vec![s]);
        let (_execution, result) = run(&executor, &flow).await;

        let err = result.unwrap_err();
        assert!(matches!(err.source, CoreError::UnknownAction(_)));
        // No retry sleeps happened.
        assert!(started.elapsed() < Duration::from_secs(1));

        let steps = store.steps.lock().unwrap();
        assert_eq!(steps.last().unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_assertion_failure_is_not_retried() {
        let echo = Arc::new(EchoHandler::new());
        let (executor, _store, _hub) = executor_with(vec![echo.clone()]);

        let mut s = step("asserted", "echo", json!({ "status": 500 }));
        s.assert = vec!["status == 200".to_string()];
        s.retry = Some(testmesh_core::flow::RetryPolicy {
            max_attempts: 3,
            delay: None,
            backoff: Backoff::Fixed,
        });

        let flow = flow(vec![s]);
        let (execution, result) = run(&executor, &flow).await;

        let err = result.unwrap_err();
        assert!(matches!(err.source, CoreError::Assertion(_)));
        assert!(err.message.contains("status == 200"));
        assert_eq!(execution.status, ExecutionStatus::Failed);
        // The action itself ran exactly once.
        assert_eq!(echo.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_step() {
        let (executor, _store, hub) = executor_with(vec![Arc::new(SleepyHandler)]);

        let f = flow(vec![step("long-sleep", "sleepy", json!({ "ms": 60_000 }))]);
        let mut execution = Execution::new(f.id.unwrap(), HashMap::new());
        let mut rx = hub.subscribe(execution.id);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = executor
            .execute(&mut execution, &f, &HashMap::new(), cancel)
            .await;

        let err = result.unwrap_err();
        assert!(err.is_cancellation());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(execution.status, ExecutionStatus::Cancelled);

        let events = drain_events(&mut rx);
        assert_eq!(*events.last().unwrap(), EventType::ExecutionFailed);
    }

    #[tokio::test]
    async fn test_step_ids_assigned_by_phase_and_index() {
        let echo = Arc::new(EchoHandler::new());
        let (executor, store, _hub) = executor_with(vec![echo]);

        let mut f = flow(vec![Step {
            id: None,
            name: "anonymous".to_string(),
            action: "echo".to_string(),
            config: serde_json::Map::new(),
            assert: Vec::new(),
            output: HashMap::new(),
            retry: None,
        }]);
        f.setup = vec![Step {
            id: None,
            name: "anonymous setup".to_string(),
            action: "echo".to_string(),
            config: serde_json::Map::new(),
            assert: Vec::new(),
            output: HashMap::new(),
            retry: None,
        }];

        let (_execution, result) = run(&executor, &f).await;
        result.unwrap();

        let steps = store.steps.lock().unwrap();
        let ids: Vec<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
        assert!(ids.contains(&"setup_0"));
        assert!(ids.contains(&"main_0"));
    }

    #[tokio::test]
    async fn test_step_timestamps_are_ordered() {
        let echo = Arc::new(EchoHandler::new());
        let (executor, store, _hub) = executor_with(vec![echo]);

        let f = flow(vec![
            step("one", "echo", json!({})),
            step("two", "echo", json!({})),
            step("three", "echo", json!({})),
        ]);
        let (_execution, result) = run(&executor, &f).await;
        result.unwrap();

        let steps = store.steps.lock().unwrap();
        let started: Vec<_> = steps
            .iter()
            .filter(|s| s.status == testmesh_core::execution::StepStatus::Running)
            .map(|s| s.started_at.unwrap())
            .collect();
        assert!(started.windows(2).all(|w| w[0] <= w[1]));

        for s in steps.iter().filter(|s| s.status.is_terminal()) {
            assert!(s.finished_at.unwrap() >= s.started_at.unwrap());
        }
    }

    #[tokio::test]
    async fn test_detached_execution_skips_persistence_but_chains_outputs() {
        let echo = Arc::new(EchoHandler::new());
        let (executor, store, _hub) = executor_with(vec![echo.clone()]);

        let mut first = step("first", "echo", json!({ "value": "V" }));
        first.output = HashMap::from([("v".to_string(), "$.value".to_string())]);
        let second = step("second", "echo", json!({ "got": "${first.v}" }));

        let f = flow(vec![first, second]);
        let (execution, result) = executor.execute_detached(&f, &HashMap::new()).await;

        result.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.passed_steps, 2);
        // Nothing persisted.
        assert!(store.steps.lock().unwrap().is_empty());
        assert!(store.executions.lock().unwrap().is_empty());
        // Output chaining still worked.
        assert_eq!(echo.calls.lock().unwrap()[1]["got"], "V");
    }

    #[tokio::test]
    async fn test_user_variables_override_flow_env() {
        let echo = Arc::new(EchoHandler::new());
        let (executor, _store, _hub) = executor_with(vec![echo.clone()]);

        let mut f = flow(vec![step("s", "echo", json!({ "host": "${HOST}" }))]);
        f.env = HashMap::from([("HOST".to_string(), "from-env".to_string())]);

        let mut execution = Execution::new(f.id.unwrap(), HashMap::new());
        let vars = HashMap::from([("HOST".to_string(), "from-user".to_string())]);
        executor
            .execute(&mut execution, &f, &vars, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(echo.calls.lock().unwrap()[0]["host"], "from-user");
    }

    #[tokio::test]
    async fn test_hook_can_abort_execution() {
        struct AbortingHook;

        #[async_trait]
        impl StepHook for AbortingHook {
            async fn before_step(&self, _step: BeforeStep<'_>) -> HookDecision {
                HookDecision::Abort
            }
        }

        let echo = Arc::new(EchoHandler::new());
        let store = Arc::new(RecordingStore::default());
        let hub = Arc::new(BroadcastHub::new());
        let executor = FlowExecutor::new(
            Arc::new(ActionDispatcher::new(vec![echo.clone()])),
            store,
            hub,
        )
        .with_hook(Arc::new(AbortingHook));

        let f = flow(vec![step("s", "echo", json!({}))]);
        let (execution, result) = run(&executor, &f).await;

        assert!(result.is_err());
        assert_eq!(execution.status, ExecutionStatus::Failed);
        // The handler itself never ran.
        assert!(echo.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_retry_delay_is_a_config_error() {
        let echo = Arc::new(EchoHandler::new());
        let (executor, _store, _hub) = executor_with(vec![echo]);

        let mut s = step("bad", "echo", json!({}));
        s.retry = Some(testmesh_core::flow::RetryPolicy {
            max_attempts: 2,
            delay: Some("not-a-duration".to_string()),
            backoff: Backoff::Fixed,
        });

        let flow = flow(vec![s]);
        let (_execution, result) = run(&executor, &flow).await;
        let err = result.unwrap_err();
        assert!(matches!(err.source, CoreError::InvalidConfig(_)));
    }
}
