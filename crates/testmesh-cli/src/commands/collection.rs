//! Data-driven collection run command.

use anyhow::{Context, Result, bail};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use testmesh_engine::CollectionRunner;
use testmesh_engine::collection::{CollectionConfig, CollectionStatus, DataSource, IterationStatus};

use super::{local_stack, parse_vars};

/// Run a flow across iterations. Returns whether every iteration passed.
#[allow(clippy::too_many_arguments)]
pub async fn run_collection(
    flow_path: &Path,
    data_path: Option<&Path>,
    iterations: u32,
    parallel: usize,
    delay_ms: u64,
    stop_on_error: bool,
    vars: Vec<String>,
    plugin_dir: Option<&Path>,
) -> Result<bool> {
    let flow = testmesh_config::load_flow_file(flow_path)
        .with_context(|| format!("failed to load flow {}", flow_path.display()))?;
    let variables = parse_vars(&vars)?;

    let data = match data_path {
        None => None,
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read data file {}", path.display()))?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("csv") => Some(DataSource::Csv(content)),
                Some("json") => Some(DataSource::Json(content)),
                other => bail!("unsupported data file extension {other:?}; use .csv or .json"),
            }
        }
    };

    let (executor, store, _hub) = local_stack(plugin_dir).await?;
    let runner = CollectionRunner::new(executor, store);

    let config = CollectionConfig {
        iterations,
        delay_ms,
        stop_on_error,
        parallel,
        variables,
        variable_mapping: Default::default(),
        environment: None,
    };

    println!("Running collection over flow: {}", flow.name);
    let result = runner
        .run(vec![flow], data, config, CancellationToken::new())
        .await?;

    println!("\n--- Collection summary ---");
    for iteration in &result.iteration_results {
        let marker = match iteration.status {
            IterationStatus::Passed => "✓",
            IterationStatus::Failed => "✗",
        };
        let row = iteration
            .data_row
            .as_ref()
            .map(|row| format!(" {row:?}"))
            .unwrap_or_default();
        println!(
            "  {marker} iteration {}/{} in {}ms{row}",
            iteration.iteration, result.total_iterations, iteration.duration_ms
        );
    }
    println!(
        "  {:?}: {} passed, {} failed of {} ({}ms)",
        result.status,
        result.passed_iterations,
        result.failed_iterations,
        result.total_iterations,
        result.duration_ms
    );

    Ok(result.status == CollectionStatus::Completed)
}
