use clap::Args;
use colored::Colorize;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use fund_sim_core::engine::{self, RunOptions};
use fund_sim_core::summary::RunStatus;
use fund_sim_core::SimulationConfig;

use crate::output;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the simulation configuration JSON file
    #[arg(long, short = 'c')]
    pub config: String,

    /// Path to save the simulation results
    #[arg(long, short = 'o')]
    pub output: Option<String>,

    /// Random seed for reproducibility
    #[arg(long, short = 's')]
    pub seed: Option<u64>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn results_dir() -> PathBuf {
    std::env::var("RESULTS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("results"))
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

pub fn execute(args: RunArgs) -> Result<(), Box<dyn Error>> {
    init_logging(args.verbose);

    let raw = fs::read_to_string(&args.config)
        .map_err(|e| format!("cannot read configuration {}: {e}", args.config))?;
    let options: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| format!("invalid JSON in {}: {e}", args.config))?;

    // Parse without validating: the orchestrator owns validation and turns
    // failures into a structured summary.
    let config: SimulationConfig = serde_json::from_value(options)
        .map_err(|e| format!("invalid configuration: {e}"))?;

    let summary = engine::run(
        config,
        RunOptions {
            seed: args.seed,
            ..Default::default()
        },
    );
    let value = summary.to_sanitized_json()?;

    if let Some(output_path) = &args.output {
        write_json(Path::new(output_path), &value)?;
        println!("Results saved to {}", output_path.bold());
    }
    write_json(&results_dir().join("latest.json"), &value)?;

    output::display_summary(&value);

    match summary.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => Err("simulation cancelled".into()),
        _ => {
            let message = summary
                .error
                .map(|e| format!("[{}/{}] {}", e.kind, e.module, e.message))
                .unwrap_or_else(|| "simulation failed".into());
            Err(message.into())
        }
    }
}
