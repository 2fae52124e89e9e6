use blotter::app::{self, App};
use blotter::cli::{Args, Command};
use blotter::config::Config;
use blotter::logging::setup_logging;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Configuration errors are fatal before anything starts, including logging
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = setup_logging(&config, args.tracing) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    let command = args.command.unwrap_or_default();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        ?command,
        "starting blotter"
    );

    let result = match command {
        Command::Status => app::print_status(&config).await,
        Command::Inspect { sample } => app::inspect(&config, sample).await,
        Command::Run => match App::new(config).await {
            Ok(app) => app.run_once().await,
            Err(e) => Err(e),
        },
        Command::Serve { no_schedule } => match App::new(config).await {
            Ok(app) => app.serve(!no_schedule).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "blotter exited with an error");
            ExitCode::FAILURE
        }
    }
}
