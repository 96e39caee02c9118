use clap::Args;
use std::error::Error;
use std::fs;

use crate::output;

#[derive(Args)]
pub struct ResultsArgs {
    /// Path to the simulation results JSON file
    #[arg(default_value = "results/latest.json")]
    pub path: String,
}

pub fn execute(args: ResultsArgs) -> Result<(), Box<dyn Error>> {
    let raw = fs::read_to_string(&args.path)
        .map_err(|e| format!("cannot read results {}: {e}", args.path))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| format!("invalid JSON in {}: {e}", args.path))?;
    output::display_summary(&value);
    Ok(())
}
