//! Data-driven collection runs.
//!
//! A collection run executes one or more flows N times, optionally driven
//! by a CSV/JSON/inline data source, with bounded parallelism and
//! per-iteration variable binding.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use testmesh_core::execution::{Execution, ExecutionStatus};
use testmesh_core::flow::Flow;
use testmesh_core::store::ExecutionStore;
use testmesh_core::{Error, ResourceId, Result};

use crate::executor::FlowExecutor;

/// One row of collection input data.
pub type DataRow = HashMap<String, String>;

/// Where iteration data comes from.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// CSV text; the header row names the columns.
    Csv(String),
    /// JSON text: an array of flat objects.
    Json(String),
    /// Pre-built rows.
    Inline(Vec<DataRow>),
}

impl DataSource {
    /// Materialize the rows. Scalar JSON values are rendered to strings;
    /// nested values are rejected.
    pub fn rows(&self) -> Result<Vec<DataRow>> {
        match self {
            DataSource::Inline(rows) => Ok(rows.clone()),
            DataSource::Csv(text) => {
                let mut reader = csv::Reader::from_reader(text.as_bytes());
                let headers = reader
                    .headers()
                    .map_err(|e| Error::InvalidConfig(format!("invalid CSV header: {e}")))?
                    .clone();
                let mut rows = Vec::new();
                for record in reader.records() {
                    let record = record
                        .map_err(|e| Error::InvalidConfig(format!("invalid CSV row: {e}")))?;
                    let mut row = DataRow::new();
                    for (header, field) in headers.iter().zip(record.iter()) {
                        row.insert(header.to_string(), field.to_string());
                    }
                    rows.push(row);
                }
                Ok(rows)
            }
            DataSource::Json(text) => {
                let values: Vec<serde_json::Map<String, serde_json::Value>> =
                    serde_json::from_str(text).map_err(|e| {
                        Error::InvalidConfig(format!("data source must be a JSON array of objects: {e}"))
                    })?;
                values
                    .into_iter()
                    .map(|object| {
                        object
                            .into_iter()
                            .map(|(key, value)| {
                                let rendered = match value {
                                    serde_json::Value::String(s) => s,
                                    serde_json::Value::Number(n) => n.to_string(),
                                    serde_json::Value::Bool(b) => b.to_string(),
                                    serde_json::Value::Null => String::new(),
                                    nested => {
                                        return Err(Error::InvalidConfig(format!(
                                            "data column `{key}` must be scalar, got {nested}"
                                        )));
                                    }
                                };
                                Ok((key, rendered))
                            })
                            .collect::<Result<DataRow>>()
                    })
                    .collect()
            }
        }
    }
}

/// Settings for one collection run.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Iteration count when no data source is present; a data source's row
    /// count always wins.
    pub iterations: u32,
    /// Delay between dispatches of consecutive iterations.
    pub delay_ms: u64,
    /// Mark the collection failed as soon as any iteration fails; in-flight
    /// iterations finish, no new ones start.
    pub stop_on_error: bool,
    /// Iterations in flight at once (≥ 1).
    pub parallel: usize,
    /// Variables applied to every iteration.
    pub variables: HashMap<String, String>,
    /// Data column → target variable. Empty means every column binds under
    /// its own name.
    pub variable_mapping: HashMap<String, String>,
    /// Environment label recorded on each execution.
    pub environment: Option<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            delay_ms: 0,
            stop_on_error: false,
            parallel: 1,
            variables: HashMap::new(),
            variable_mapping: HashMap::new(),
            environment: None,
        }
    }
}

/// Outcome of a collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResult {
    pub id: ResourceId,
    pub status: CollectionStatus,
    pub total_iterations: u32,
    pub completed_iterations: u32,
    pub passed_iterations: u32,
    pub failed_iterations: u32,
    pub iteration_results: Vec<IterationResult>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of a single iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-based iteration number.
    pub iteration: u32,
    pub data_row: Option<DataRow>,
    pub flow_results: Vec<FlowRunResult>,
    pub status: IterationStatus,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Passed,
    Failed,
}

/// Outcome of one flow within one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunResult {
    pub flow_name: String,
    pub execution_id: ResourceId,
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

/// Runs flows across iterations with bounded concurrency.
pub struct CollectionRunner {
    executor: Arc<FlowExecutor>,
    store: Arc<dyn ExecutionStore>,
}

impl CollectionRunner {
    pub fn new(executor: Arc<FlowExecutor>, store: Arc<dyn ExecutionStore>) -> Self {
        Self { executor, store }
    }

    pub async fn run(
        &self,
        flows: Vec<Flow>,
        data: Option<DataSource>,
        config: CollectionConfig,
        cancel: CancellationToken,
    ) -> Result<CollectionResult> {
        let collection_id = ResourceId::new();
        let started = Utc::now();

        let rows = match &data {
            Some(source) => Some(source.rows()?),
            None => None,
        };
        // A data source's row count overrides the configured iterations.
        let total_iterations = rows
            .as_ref()
            .map(|rows| rows.len() as u32)
            .unwrap_or(config.iterations.max(1));

        info!(
            collection_id = %collection_id,
            flows = flows.len(),
            total_iterations,
            parallel = config.parallel,
            "Starting collection run"
        );

        let flows = Arc::new(flows);
        let semaphore = Arc::new(Semaphore::new(config.parallel.max(1)));
        let stopped = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(total_iterations as usize);

        for index in 0..total_iterations {
            if cancel.is_cancelled() {
                break;
            }
            if config.stop_on_error && stopped.load(Ordering::SeqCst) {
                break;
            }
            // Inter-dispatch delay, applied between starts rather than
            // between completions.
            if index > 0 && config.delay_ms > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(config.delay_ms)) => {}
                }
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let row = rows.as_ref().map(|rows| rows[index as usize].clone());
            let variables = iteration_variables(&config, row.as_ref(), index, total_iterations);
            let executor = self.executor.clone();
            let store = self.store.clone();
            let flows = flows.clone();
            let environment = config.environment.clone();
            let iteration_cancel = cancel.child_token();
            let stopped = stopped.clone();
            let stop_on_error = config.stop_on_error;

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let iteration_started = Utc::now();
                let mut flow_results = Vec::with_capacity(flows.len());

                for flow in flows.iter() {
                    let flow_id = flow.id.unwrap_or_default();
                    let mut execution = Execution::new(flow_id, variables.clone());
                    if let Some(environment) = &environment {
                        execution = execution.with_environment(environment.clone());
                    }
                    if let Err(e) = store.create_execution(&execution).await {
                        warn!(flow = %flow.name, error = %e, "Failed to create execution record");
                    }

                    let outcome = executor
                        .execute(&mut execution, flow, &variables, iteration_cancel.clone())
                        .await;

                    flow_results.push(FlowRunResult {
                        flow_name: flow.name.clone(),
                        execution_id: execution.id,
                        status: execution.status,
                        error: outcome.err().map(|e| e.to_string()),
                    });
                }

                let passed = flow_results
                    .iter()
                    .all(|r| r.status == ExecutionStatus::Completed);
                if !passed && stop_on_error {
                    stopped.store(true, Ordering::SeqCst);
                }

                IterationResult {
                    iteration: index + 1,
                    data_row: row,
                    flow_results,
                    status: if passed {
                        IterationStatus::Passed
                    } else {
                        IterationStatus::Failed
                    },
                    duration_ms: (Utc::now() - iteration_started).num_milliseconds(),
                }
            }));
        }

        let mut iteration_results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => iteration_results.push(result),
                Err(e) => warn!(error = %e, "Iteration task panicked"),
            }
        }
        iteration_results.sort_by_key(|r| r.iteration);

        let completed_iterations = iteration_results.len() as u32;
        let passed_iterations = iteration_results
            .iter()
            .filter(|r| r.status == IterationStatus::Passed)
            .count() as u32;
        let failed_iterations = completed_iterations - passed_iterations;

        let status = if cancel.is_cancelled() {
            CollectionStatus::Cancelled
        } else if failed_iterations > 0 {
            CollectionStatus::Failed
        } else {
            CollectionStatus::Completed
        };

        Ok(CollectionResult {
            id: collection_id,
            status,
            total_iterations,
            completed_iterations,
            passed_iterations,
            failed_iterations,
            iteration_results,
            duration_ms: (Utc::now() - started).num_milliseconds(),
        })
    }
}

/// Effective variables for one iteration: globals, then the mapped data
/// row, then the reserved `__iteration` / `__total_iterations` bindings.
fn iteration_variables(
    config: &CollectionConfig,
    row: Option<&DataRow>,
    index: u32,
    total: u32,
) -> HashMap<String, String> {
    let mut variables = config.variables.clone();

    if let Some(row) = row {
        if config.variable_mapping.is_empty() {
            for (column, value) in row {
                variables.insert(column.clone(), value.clone());
            }
        } else {
            for (column, target) in &config.variable_mapping {
                if let Some(value) = row.get(column) {
                    variables.insert(target.clone(), value.clone());
                }
            }
        }
    }

    variables.insert("__iteration".to_string(), (index + 1).to_string());
    variables.insert("__total_iterations".to_string(), total.to_string());
    variables
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use testmesh_core::execution::ExecutionStep;
    use testmesh_core::flow::Step;
    use testmesh_core::handler::{ActionHandler, CallEnvelope, Output};

    use crate::broadcast::BroadcastHub;
    use crate::dispatch::ActionDispatcher;

    #[derive(Default)]
    struct NullStore;

    #[async_trait]
    impl ExecutionStore for NullStore {
        async fn create_execution(&self, _execution: &Execution) -> Result<()> {
            Ok(())
        }
        async fn update_execution(&self, _execution: &Execution) -> Result<()> {
            Ok(())
        }
        async fn create_step(&self, _step: &ExecutionStep) -> Result<()> {
            Ok(())
        }
        async fn update_step(&self, _step: &ExecutionStep) -> Result<()> {
            Ok(())
        }
        async fn get_steps(&self, _execution_id: ResourceId) -> Result<Vec<ExecutionStep>> {
            Ok(Vec::new())
        }
    }

    /// Fails when the interpolated config says so; tracks peak concurrency.
    struct ProbeHandler {
        calls: Mutex<Vec<Value>>,
        in_flight: AtomicU32,
        peak: AtomicU32,
    }

    impl ProbeHandler {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicU32::new(0),
                peak: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ActionHandler for ProbeHandler {
        fn name(&self) -> &str {
            "probe"
        }

        async fn execute(&self, _envelope: &CallEnvelope, config: &Value) -> Result<Output> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.calls.lock().unwrap().push(config.clone());
            if config.get("should_fail").and_then(Value::as_str) == Some("yes") {
                Err(Error::Handler("probe failure requested".to_string()))
            } else {
                Ok(config.as_object().cloned().unwrap_or_default())
            }
        }
    }

    fn runner_with_probe() -> (CollectionRunner, Arc<ProbeHandler>) {
        let probe = Arc::new(ProbeHandler::new());
        let store: Arc<dyn ExecutionStore> = Arc::new(NullStore);
        let executor = Arc::new(FlowExecutor::new(
            Arc::new(ActionDispatcher::new(vec![probe.clone()])),
            store.clone(),
            Arc::new(BroadcastHub::new()),
        ));
        (CollectionRunner::new(executor, store), probe)
    }

    fn probe_flow() -> Flow {
        Flow {
            id: Some(ResourceId::new()),
            name: "probe-flow".to_string(),
            version: "1".to_string(),
            env: HashMap::new(),
            setup: Vec::new(),
            steps: vec![Step {
                id: Some("probe".to_string()),
                name: "probe".to_string(),
                action: "probe".to_string(),
                config: json!({ "should_fail": "${should_fail}", "user": "${user}" })
                    .as_object()
                    .cloned()
                    .unwrap(),
                assert: Vec::new(),
                output: HashMap::new(),
                retry: None,
            }],
            teardown: Vec::new(),
        }
    }

    const CSV_DATA: &str = "user,should_fail\nalice,no\nbob,yes\ncarol,no\ndave,yes\n";

    #[tokio::test]
    async fn test_csv_rows_drive_iterations() {
        let (runner, probe) = runner_with_probe();
        let result = runner
            .run(
                vec![probe_flow()],
                Some(DataSource::Csv(CSV_DATA.to_string())),
                CollectionConfig {
                    parallel: 2,
                    // A data source overrides configured iterations.
                    iterations: 99,
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.total_iterations, 4);
        assert_eq!(result.completed_iterations, 4);
        assert_eq!(result.passed_iterations, 2);
        assert_eq!(result.failed_iterations, 2);
        assert_eq!(result.status, CollectionStatus::Failed);
        assert!(probe.peak.load(Ordering::SeqCst) <= 2);

        // Row columns bound as variables, plus the reserved bindings.
        let first = &result.iteration_results[0];
        assert_eq!(first.iteration, 1);
        assert_eq!(first.data_row.as_ref().unwrap()["user"], "alice");
        assert_eq!(first.status, IterationStatus::Passed);
        assert_eq!(first.flow_results[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_iteration_variables_include_reserved_bindings() {
        let (runner, probe) = runner_with_probe();
        let flow = {
            let mut f = probe_flow();
            f.steps[0].config = json!({ "i": "${__iteration}", "n": "${__total_iterations}" })
                .as_object()
                .cloned()
                .unwrap();
            f
        };

        runner
            .run(
                vec![flow],
                None,
                CollectionConfig {
                    iterations: 3,
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let calls = probe.calls.lock().unwrap();
        let mut seen: Vec<String> = calls
            .iter()
            .map(|c| c["i"].as_str().unwrap().to_string())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["1", "2", "3"]);
        assert!(calls.iter().all(|c| c["n"] == "3"));
    }

    #[tokio::test]
    async fn test_variable_mapping_renames_columns() {
        let config = CollectionConfig {
            variables: HashMap::from([("global".to_string(), "g".to_string())]),
            variable_mapping: HashMap::from([("user".to_string(), "username".to_string())]),
            ..Default::default()
        };
        let row = DataRow::from([
            ("user".to_string(), "alice".to_string()),
            ("ignored".to_string(), "x".to_string()),
        ]);

        let variables = iteration_variables(&config, Some(&row), 0, 4);
        assert_eq!(variables["username"], "alice");
        assert_eq!(variables["global"], "g");
        assert_eq!(variables["__iteration"], "1");
        assert_eq!(variables["__total_iterations"], "4");
        assert!(!variables.contains_key("ignored"));
    }

    #[tokio::test]
    async fn test_stop_on_error_stops_dispatching() {
        let (runner, probe) = runner_with_probe();
        let rows: Vec<DataRow> = (0..20)
            .map(|i| {
                DataRow::from([
                    ("user".to_string(), format!("u{i}")),
                    ("should_fail".to_string(), "yes".to_string()),
                ])
            })
            .collect();

        let result = runner
            .run(
                vec![probe_flow()],
                Some(DataSource::Inline(rows)),
                CollectionConfig {
                    stop_on_error: true,
                    parallel: 1,
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, CollectionStatus::Failed);
        // Sequential dispatch notices the first failure quickly.
        assert!(result.completed_iterations < 20);
        assert!(probe.calls.lock().unwrap().len() < 20);
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_dispatches() {
        let (runner, _probe) = runner_with_probe();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner
            .run(
                vec![probe_flow()],
                None,
                CollectionConfig {
                    iterations: 10,
                    ..Default::default()
                },
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(result.status, CollectionStatus::Cancelled);
        assert_eq!(result.completed_iterations, 0);
    }

    #[tokio::test]
    async fn test_json_data_source_renders_scalars() {
        let source = DataSource::Json(r#"[{ "a": "x", "b": 2, "c": true }]"#.to_string());
        let rows = source.rows().unwrap();
        assert_eq!(rows[0]["a"], "x");
        assert_eq!(rows[0]["b"], "2");
        assert_eq!(rows[0]["c"], "true");

        let nested = DataSource::Json(r#"[{ "a": { "no": 1 } }]"#.to_string());
        assert!(nested.rows().is_err());
    }
}
