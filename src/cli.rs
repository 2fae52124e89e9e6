use clap::{Parser, Subcommand, ValueEnum};

/// Incremental ingestion of public crime incident records
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the HTTP API and run scheduled syncs (the default)
    Serve {
        /// Only sync when triggered through the API
        #[arg(long)]
        no_schedule: bool,
    },
    /// Execute a single sync run and exit with its outcome
    Run,
    /// Print the status document as JSON
    Status,
    /// Check upstream connectivity: dataset metadata plus a small sample page
    Inspect {
        /// Records to request in the sample page
        #[arg(long, default_value_t = 5)]
        sample: u32,
    },
}

impl Default for Command {
    fn default() -> Self {
        Self::Serve { no_schedule: false }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingFormat {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}
