//! Local flow execution command.

use anyhow::{Context, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use testmesh_core::event::{EventType, ExecutionEvent};
use testmesh_core::execution::{Execution, ExecutionStatus};
use testmesh_core::store::ExecutionStore;

use super::{local_stack, parse_vars};

/// Run a flow file locally. Returns whether the execution passed.
pub async fn run_flow(
    path: &Path,
    vars: Vec<String>,
    timeout: Option<String>,
    plugin_dir: Option<&Path>,
) -> Result<bool> {
    let flow = testmesh_config::load_flow_file(path)
        .with_context(|| format!("failed to load flow {}", path.display()))?;
    let variables = parse_vars(&vars)?;

    println!("Running flow: {}", flow.name);
    println!("Steps: {}", flow.total_steps());

    let (executor, store, hub) = local_stack(plugin_dir).await?;

    let mut execution = Execution::new(flow.id.unwrap_or_default(), variables.clone());
    store.create_execution(&execution).await.ok();

    // Print events concurrently with execution.
    let mut events = hub.subscribe(execution.id);
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let cancel = CancellationToken::new();
    if let Some(text) = timeout {
        let duration = humantime_parse(&text)?;
        let deadline_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            deadline_cancel.cancel();
        });
    }

    let result = executor
        .execute(&mut execution, &flow, &variables, cancel)
        .await;
    printer.await.ok();

    println!("\n--- Summary ---");
    println!(
        "  {} - passed {} / failed {} / total {} in {}ms",
        execution.status.as_str(),
        execution.passed_steps,
        execution.failed_steps,
        execution.total_steps,
        execution.duration_ms.unwrap_or(0),
    );
    if let Err(e) = &result {
        println!("  failure: {e}");
    }

    Ok(execution.status == ExecutionStatus::Completed)
}

fn humantime_parse(text: &str) -> Result<std::time::Duration> {
    humantime::parse_duration(text).with_context(|| format!("invalid timeout `{text}`"))
}

fn print_event(event: &ExecutionEvent) {
    match event.event_type {
        EventType::ExecutionStarted => {
            println!("▶ Execution {} started", event.execution_id.short());
        }
        EventType::StepStarted => {
            println!(
                "  ▶ {} ({})",
                event.data["step_name"].as_str().unwrap_or("?"),
                event.data["action"].as_str().unwrap_or("?"),
            );
        }
        EventType::StepCompleted => {
            println!(
                "  ✓ {} in {}ms",
                event.data["step_name"].as_str().unwrap_or("?"),
                event.data["duration_ms"].as_i64().unwrap_or(0),
            );
        }
        EventType::StepFailed => {
            println!(
                "  ✗ {}: {}",
                event.data["step_name"].as_str().unwrap_or("?"),
                event.data["error_message"].as_str().unwrap_or("failed"),
            );
        }
        EventType::ExecutionCompleted => {
            println!("--- Execution completed ---");
        }
        EventType::ExecutionFailed => {
            println!("--- Execution failed ---");
        }
    }
}
