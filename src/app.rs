use crate::config::Config;
use crate::data::{PgStore, RecordStore};
use crate::state::AppState;
use crate::status::{RunOutcome, StatusFile, StatusReport, StatusTracker};
use crate::sync::{Fetcher, Normalizer, Scheduler, SyncEngine};
use crate::upstream::{CkanApi, PageRequest, UpstreamSource};
use crate::utils::fmt_duration;
use crate::web::create_router;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::ConnectOptions;
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Main application struct containing all necessary components
pub struct App {
    config: Config,
    db_pool: sqlx::PgPool,
    app_state: AppState,
}

impl App {
    /// Connect to the database, apply migrations, and wire the pipeline.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let slow_threshold = Duration::from_millis(500);

        let connect_options = sqlx::postgres::PgConnectOptions::from_str(&config.database_url)
            .context("Failed to parse database URL")?
            .log_statements(tracing::log::LevelFilter::Debug)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let db_pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(4)
            .acquire_slow_threshold(slow_threshold)
            .acquire_timeout(Duration::from_secs(4))
            .idle_timeout(Duration::from_secs(60 * 2))
            .max_lifetime(Duration::from_secs(60 * 30))
            .connect_with(connect_options)
            .await
            .context("Failed to create database pool")?;

        info!(
            min_connections = 0,
            max_connections = 4,
            acquire_timeout = "4s",
            idle_timeout = "2m",
            max_lifetime = "30m",
            acquire_slow_threshold = fmt_duration(slow_threshold),
            "database pool established"
        );

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations completed successfully");

        let upstream: Arc<dyn UpstreamSource> = Arc::new(
            CkanApi::new(config.ckan_settings()?).context("Failed to create upstream client")?,
        );
        let tracker = Arc::new(open_tracker(&config).await?);
        let store: Arc<dyn RecordStore> = Arc::new(PgStore::new(db_pool.clone()));

        let engine = SyncEngine::new(
            Fetcher::new(
                upstream,
                config.page_size,
                config.retry_policy(),
                config.source_timezone,
            ),
            Normalizer::new(config.source_timezone),
            store.clone(),
            tracker.clone(),
            config.retry_policy(),
            config.store_timeout,
        );
        let mut scheduler = Scheduler::new(Arc::new(engine));
        if let Some(daily) = config.daily_run() {
            scheduler = scheduler.with_daily_run(daily);
        }
        let scheduler = Arc::new(scheduler);

        Ok(App {
            config,
            db_pool,
            app_state: AppState::new(scheduler, tracker, store),
        })
    }

    /// Serve the API (and scheduled runs) until a shutdown signal arrives.
    pub async fn serve(self, schedule: bool) -> Result<ExitCode, anyhow::Error> {
        let scheduler = self.app_state.scheduler.clone();
        match scheduler.engine().recover_interrupted().await {
            Ok(Some(run)) => info!(run_id = %run.run_id, outcome = ?run.outcome, "Recovered interrupted run"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not check for an interrupted run"),
        }
        if schedule {
            scheduler.start_periodic(self.config.sync_interval).await;
        } else {
            info!("Periodic sync disabled, runs only start from the API");
        }

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("Failed to bind port {}", self.config.port))?;
        info!(port = self.config.port, "web server listening");

        axum::serve(listener, create_router(self.app_state.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Web server failed")?;

        info!(
            timeout = fmt_duration(self.config.shutdown_timeout),
            "Shutting down"
        );
        scheduler.stop_periodic(self.config.shutdown_timeout).await;
        self.db_pool.close().await;
        Ok(ExitCode::SUCCESS)
    }

    /// Execute one manual run; the exit code reflects its outcome.
    pub async fn run_once(self) -> Result<ExitCode, anyhow::Error> {
        let status = self.app_state.scheduler.run_now().await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
        self.db_pool.close().await;
        Ok(match status.outcome {
            Some(RunOutcome::Success) => ExitCode::SUCCESS,
            _ => ExitCode::FAILURE,
        })
    }
}

async fn open_tracker(config: &Config) -> Result<StatusTracker, anyhow::Error> {
    let file = StatusFile::new(&config.status_path);
    StatusTracker::open(file, config.status_history)
        .await
        .with_context(|| format!("Failed to open status file {}", config.status_path.display()))
}

/// Print the status document without touching the database or upstream.
/// Read-only: a run in flight elsewhere is shown as running.
pub async fn print_status(config: &Config) -> Result<ExitCode, anyhow::Error> {
    let report = status_report(&StatusFile::new(&config.status_path), Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn status_report(file: &StatusFile, now: DateTime<Utc>) -> Result<StatusReport, anyhow::Error> {
    let doc = file
        .load()
        .await
        .with_context(|| format!("Failed to read status file {}", file.path().display()))?
        .unwrap_or_default();
    Ok(doc.report(now))
}

/// Read dataset metadata and a small page from upstream, normalizing it but
/// writing nothing.
pub async fn inspect(config: &Config, sample: u32) -> Result<ExitCode, anyhow::Error> {
    let api = CkanApi::new(config.ckan_settings()?).context("Failed to create upstream client")?;

    let metadata = api.metadata().await.context("Failed to read dataset metadata")?;
    let total = match api.record_count().await {
        Ok(total) => Some(total),
        Err(e) => {
            warn!(error = %e, "could not count upstream records");
            None
        }
    };
    let page = api
        .fetch_page(&PageRequest {
            since: None,
            offset: 0,
            limit: sample.max(1),
        })
        .await
        .context("Failed to fetch sample page")?;
    let batch = Normalizer::new(config.source_timezone).normalize_batch(&page.records);
    if !batch.rejected.is_empty() {
        warn!(rejected = batch.rejected.len(), "sample contained malformed records");
    }

    let report = json!({
        "dataset": metadata,
        "upstreamTotal": total,
        "sample": {
            "fetched": page.records.len(),
            "hasMore": page.has_more,
            "normalized": batch.records,
            "rejected": batch.rejected.iter().map(|r| json!({
                "naturalKey": r.natural_key,
                "reason": r.reason.to_string(),
            })).collect::<Vec<_>>(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
