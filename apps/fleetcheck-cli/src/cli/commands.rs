use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "fleetcheck",
    version,
    about = "Automated health assessments for distributed data infrastructure"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Print backtraces for unexpected failures
    #[arg(long, global = true, default_value_t = false)]
    pub backtrace: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a one-shot health assessment against the configured target
    Run {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Query the trend store for recent runs and metric trends
    Trends {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Trailing window, in days
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}
