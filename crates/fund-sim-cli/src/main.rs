mod commands;
mod output;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process;

use commands::results::ResultsArgs;
use commands::run::RunArgs;

/// Home-equity fund simulation engine
#[derive(Parser)]
#[command(
    name = "fundsim",
    version,
    about = "Monte-Carlo simulation engine for home-equity investment funds",
    long_about = "Runs parameterized fund simulations: loan origination, stochastic \
                  property price paths, exit timing, reinvestment, cashflow \
                  aggregation, GP/LP waterfalls, and risk/performance metrics."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation from a configuration file
    Run(RunArgs),
    /// Display a stored simulation result
    Results(ResultsArgs),
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args),
        Commands::Results(args) => commands::results::execute(args),
    };

    if let Err(e) = result {
        eprintln!("{} {e}", "Error:".red().bold());
        process::exit(1);
    }
}
