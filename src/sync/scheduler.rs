//! Periodic and on-demand entry points into the single-run executor.

use crate::status::{RunStatus, RunTrigger};
use crate::sync::SyncError;
use crate::sync::engine::SyncEngine;
use crate::utils::fmt_duration;
use chrono::{DateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct PeriodicTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A fixed wall-clock time, in the source time zone, at which a run fires
/// every day on top of the interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyRun {
    pub at: NaiveTime,
    pub tz: Tz,
}

impl DailyRun {
    /// The first occurrence strictly after `now`. Days where `at` falls in a
    /// DST gap are skipped.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = now.with_timezone(&self.tz).date_naive();
        loop {
            if let Some(candidate) = self
                .tz
                .from_local_datetime(&date.and_time(self.at))
                .earliest()
                .map(|dt| dt.to_utc())
                && candidate > now
            {
                return candidate;
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => return now + TimeDelta::days(1),
            }
        }
    }

    async fn wait(daily: Option<Self>) {
        let Some(daily) = daily else {
            return std::future::pending().await;
        };
        let now = Utc::now();
        let wait = (daily.next_after(now) - now).to_std().unwrap_or(Duration::ZERO);
        time::sleep(wait).await;
    }
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    daily: Option<DailyRun>,
    periodic: Mutex<Option<PeriodicTask>>,
}

/// How long to wait before the first periodic run, given when the last run
/// finished. A recent run keeps its remaining cooldown across restarts.
fn first_run_delay(last_finished: Option<DateTime<Utc>>, interval: Duration) -> Duration {
    match last_finished {
        None => Duration::ZERO,
        Some(ts) => {
            let elapsed = (Utc::now() - ts).to_std().unwrap_or(Duration::ZERO);
            interval.saturating_sub(elapsed)
        }
    }
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            daily: None,
            periodic: Mutex::new(None),
        }
    }

    /// Also fire a scheduled run every day at `daily.at`.
    pub fn with_daily_run(mut self, daily: DailyRun) -> Self {
        self.daily = Some(daily);
        self
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Run a manual sync and wait for it.
    pub async fn run_now(&self) -> Result<RunStatus, SyncError> {
        self.engine.run_now(RunTrigger::Manual).await
    }

    /// Start a manual sync in the background. Returns once the run-lock is
    /// held, never waiting for the run itself.
    pub async fn trigger(&self) -> Result<(), SyncError> {
        let guard = self.engine.try_acquire().await?;
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run(guard, RunTrigger::Manual).await {
                error!(error = %e, "Triggered sync run failed");
            }
        });
        Ok(())
    }

    /// Begin firing scheduled runs every `interval`. Returns `false` if the
    /// periodic task is already running.
    pub async fn start_periodic(&self, interval: Duration) -> bool {
        let last_finished = self
            .engine
            .tracker()
            .document()
            .await
            .last_completed_run()
            .and_then(|r| r.finished_at);

        let mut periodic = self.periodic.lock().unwrap_or_else(PoisonError::into_inner);
        if periodic.is_some() {
            return false;
        }

        let delay = first_run_delay(last_finished, interval);
        info!(
            interval = fmt_duration(interval),
            first_run_in = fmt_duration(delay),
            daily_at = ?self.daily.map(|d| d.at),
            "Periodic sync started"
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(periodic_loop(
            self.engine.clone(),
            interval,
            delay,
            self.daily,
            cancel.clone(),
        ));
        *periodic = Some(PeriodicTask { cancel, handle });
        true
    }

    /// Cancel the timer, then give any in-flight run, scheduled or
    /// triggered, what is left of `grace` to finish before abandoning it.
    pub async fn stop_periodic(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        let task = self
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(PeriodicTask { cancel, mut handle }) = task {
            cancel.cancel();
            match time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!("Periodic sync stopped"),
                Ok(Err(e)) => error!(error = ?e, "Periodic sync task panicked"),
                Err(_) => {
                    warn!(
                        grace = fmt_duration(grace),
                        "Scheduled run still in flight, abandoning it"
                    );
                    handle.abort();
                }
            }
        }

        if time::timeout_at(deadline, self.engine.wait_idle()).await.is_err() {
            warn!(
                grace = fmt_duration(grace),
                "Triggered run still in flight, abandoning it"
            );
        }
    }
}

async fn periodic_loop(
    engine: Arc<SyncEngine>,
    interval: Duration,
    delay: Duration,
    daily: Option<DailyRun>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let reason = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => "interval",
            _ = DailyRun::wait(daily) => "daily",
        };
        match engine.run_now(RunTrigger::Scheduled).await {
            Ok(status) => debug!(
                reason,
                run_id = %status.run_id,
                outcome = ?status.outcome,
                "Scheduled run finished"
            ),
            Err(SyncError::RunAlreadyInProgress) => {
                info!(reason, "Skipping scheduled run, another run is in progress");
            }
            Err(e) => error!(reason, error = %e, "Scheduled run failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{RunOutcome, StatusFile, StatusTracker};
    use crate::sync::{Fetcher, Normalizer};
    use crate::testing::{MemoryStore, ScriptedUpstream, fast_retry, raw};
    use tempfile::TempDir;

    async fn scheduler(upstream: ScriptedUpstream) -> (TempDir, Arc<ScriptedUpstream>, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StatusTracker::open(StatusFile::new(dir.path().join("status.json")), 20)
            .await
            .unwrap();
        let upstream = Arc::new(upstream);
        let tz = chrono_tz::America::Phoenix;
        let engine = SyncEngine::new(
            Fetcher::new(upstream.clone(), 10, fast_retry(2), tz),
            Normalizer::new(tz),
            Arc::new(MemoryStore::new()),
            Arc::new(tracker),
            fast_retry(2),
            Duration::from_secs(5),
        );
        (dir, upstream, Scheduler::new(Arc::new(engine)))
    }

    #[test]
    fn first_run_respects_remaining_cooldown() {
        let interval = Duration::from_secs(4 * 3600);
        assert_eq!(first_run_delay(None, interval), Duration::ZERO);

        let long_ago = Utc::now() - TimeDelta::hours(9);
        assert_eq!(first_run_delay(Some(long_ago), interval), Duration::ZERO);

        let recent = Utc::now() - TimeDelta::hours(1);
        let delay = first_run_delay(Some(recent), interval);
        assert!(delay <= Duration::from_secs(3 * 3600));
        assert!(delay > Duration::from_secs(3 * 3600 - 60));
    }

    #[tokio::test]
    async fn trigger_returns_immediately_and_rejects_overlap() {
        let upstream = ScriptedUpstream::new(vec![raw("A", "01/01/2024 10:00")]).gated();
        let (_dir, upstream, scheduler) = scheduler(upstream).await;

        scheduler.trigger().await.unwrap();
        upstream.entered().await;
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.trigger().await,
            Err(SyncError::RunAlreadyInProgress)
        ));
        assert!(matches!(
            scheduler.run_now().await,
            Err(SyncError::RunAlreadyInProgress)
        ));

        upstream.release(10);
        while scheduler.is_running() {
            tokio::task::yield_now().await;
        }
        let runs = scheduler.engine().tracker().document().await.runs;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, RunTrigger::Manual);
        assert_eq!(runs[0].outcome, Some(RunOutcome::Success));
    }

    #[tokio::test]
    async fn periodic_runs_fire_and_stop() {
        let (_dir, _upstream, scheduler) =
            scheduler(ScriptedUpstream::new(vec![raw("A", "01/01/2024 10:00")])).await;

        assert!(scheduler.start_periodic(Duration::from_millis(20)).await);
        assert!(!scheduler.start_periodic(Duration::from_millis(20)).await);

        let tracker = scheduler.engine().tracker().clone();
        time::timeout(Duration::from_secs(5), async {
            while tracker.document().await.runs.len() < 2 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        scheduler.stop_periodic(Duration::from_secs(5)).await;
        let after_stop = tracker.document().await.runs.len();
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(tracker.document().await.runs.len(), after_stop);
        assert!(
            tracker
                .document()
                .await
                .runs
                .iter()
                .all(|r| r.trigger == RunTrigger::Scheduled)
        );
    }

    #[tokio::test]
    async fn stopping_waits_for_a_triggered_run() {
        let upstream = ScriptedUpstream::new(vec![raw("A", "01/01/2024 10:00")]).gated();
        let (_dir, upstream, scheduler) = scheduler(upstream).await;
        let scheduler = Arc::new(scheduler);

        scheduler.trigger().await.unwrap();
        upstream.entered().await;

        let stopping = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.stop_periodic(Duration::from_secs(5)).await }
        });
        time::sleep(Duration::from_millis(30)).await;
        assert!(!stopping.is_finished());

        upstream.release(10);
        time::timeout(Duration::from_secs(5), stopping)
            .await
            .unwrap()
            .unwrap();
        assert!(!scheduler.is_running());
        let runs = scheduler.engine().tracker().document().await.runs;
        assert_eq!(runs[0].outcome, Some(RunOutcome::Success));
    }

    #[tokio::test]
    async fn stopping_gives_up_after_the_grace_period() {
        let upstream = ScriptedUpstream::new(vec![raw("A", "01/01/2024 10:00")]).gated();
        let (_dir, upstream, scheduler) = scheduler(upstream).await;

        scheduler.trigger().await.unwrap();
        upstream.entered().await;

        let started = Instant::now();
        scheduler.stop_periodic(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(scheduler.is_running());
        upstream.release(10);
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().to_utc()
    }

    #[test]
    fn daily_run_fires_at_the_next_local_time() {
        let daily = DailyRun {
            at: NaiveTime::from_hms_opt(11, 30, 0).unwrap(),
            tz: chrono_tz::America::Phoenix,
        };
        // 10:00 MST, later the same day
        assert_eq!(
            daily.next_after(utc("2024-05-01T17:00:00Z")),
            utc("2024-05-01T18:30:00Z")
        );
        // exactly at the time rolls over to tomorrow
        assert_eq!(
            daily.next_after(utc("2024-05-01T18:30:00Z")),
            utc("2024-05-02T18:30:00Z")
        );
        // local date is still the 1st at 02:00 UTC on the 2nd
        assert_eq!(
            daily.next_after(utc("2024-05-02T02:00:00Z")),
            utc("2024-05-02T18:30:00Z")
        );
    }

    #[test]
    fn daily_run_skips_a_dst_gap() {
        let daily = DailyRun {
            at: NaiveTime::from_hms_opt(2, 30, 0).unwrap(),
            tz: chrono_tz::America::Chicago,
        };
        // 2024-03-10 02:30 does not exist in Chicago
        assert_eq!(
            daily.next_after(utc("2024-03-09T12:00:00Z")),
            utc("2024-03-11T07:30:00Z")
        );
    }
}
