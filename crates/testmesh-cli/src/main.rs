//! TestMesh CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "testmesh")]
#[command(about = "Run TestMesh flows locally", long_about = None)]
struct Cli {
    /// Plugin directory to discover subprocess plugins from.
    #[arg(long, env = "TESTMESH_PLUGIN_DIR")]
    plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file
    Run {
        /// Path to the flow definition (.json, .yaml)
        flow: PathBuf,
        /// Variables as key=value pairs
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Overall execution timeout (e.g. "5m")
        #[arg(long)]
        timeout: Option<String>,
    },
    /// Validate a flow file without executing it
    Validate {
        /// Path to the flow definition
        flow: PathBuf,
    },
    /// Run a flow across data-driven iterations
    Collection {
        /// Path to the flow definition
        flow: PathBuf,
        /// CSV or JSON data file driving the iterations
        #[arg(long)]
        data: Option<PathBuf>,
        /// Iteration count when no data file is given
        #[arg(long, default_value = "1")]
        iterations: u32,
        /// Iterations in flight at once
        #[arg(long, default_value = "1")]
        parallel: usize,
        /// Delay between iteration starts in milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,
        /// Stop dispatching new iterations after the first failure
        #[arg(long)]
        stop_on_error: bool,
        /// Variables as key=value pairs
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let passed = match cli.command {
        Commands::Run {
            flow,
            vars,
            timeout,
        } => commands::run::run_flow(&flow, vars, timeout, cli.plugin_dir.as_deref()).await?,
        Commands::Validate { flow } => {
            commands::validate::validate(&flow)?;
            true
        }
        Commands::Collection {
            flow,
            data,
            iterations,
            parallel,
            delay_ms,
            stop_on_error,
            vars,
        } => {
            commands::collection::run_collection(
                &flow,
                data.as_deref(),
                iterations,
                parallel,
                delay_ms,
                stop_on_error,
                vars,
                cli.plugin_dir.as_deref(),
            )
            .await?
        }
    };

    // Exit 0 only when every execution passed.
    if passed {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
