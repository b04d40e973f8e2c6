#[macro_use]
mod cli;
pub mod checks;
pub mod engine;
pub mod infrastructure;
pub mod report;
pub mod utilities;

use std::process::ExitCode;

use clap::Parser;
use cli::display::{Message, MessageType};
use cli::settings::Settings;
use cli::{Cli, Commands};

// Entry point for the CLI application
fn main() -> ExitCode {
    let cli_result = match Cli::try_parse() {
        Ok(cli_result) => cli_result,
        Err(e) => e.exit(),
    };

    if cli_result.backtrace {
        // Safe: no other threads have started yet.
        std::env::set_var("RUST_LIB_BACKTRACE", "1");
    }

    // Configuration errors surface before any check runs.
    let config_path = match &cli_result.command {
        Commands::Run { config } => config,
        Commands::Trends { config, .. } => config,
    };
    let settings = match Settings::load(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            show_message!(
                MessageType::Error,
                Message::new("Config", e.to_string())
            );
            return ExitCode::from(1);
        }
    };

    let logger_settings = settings.logger.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    let result = runtime.block_on(async {
        cli::logger::setup_logging(&logger_settings);
        cli::top_command_handler(settings, &cli_result.command).await
    });

    match result {
        Ok(success) => {
            show_message!(MessageType::Success, success.message);
            ExitCode::from(success.exit_code)
        }
        Err(failure) => {
            show_message!(MessageType::Error, failure.message);
            if let Some(error) = failure.error {
                eprintln!("{error}");
            }
            ExitCode::from(1)
        }
    }
}
