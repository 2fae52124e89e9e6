//! Configuration module for the blotter application.
//!
//! Values come from the process environment (after `.env` is loaded) through
//! figment. Durations accept integer seconds or human strings like `"4h"`.

use crate::sync::{DailyRun, RetryPolicy};
use crate::upstream::CkanSettings;
use crate::upstream::models::MAX_PAGE_SIZE;
use chrono::NaiveTime;
use chrono_tz::Tz;
use figment::Figment;
use figment::providers::Env;
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

/// Main application configuration containing all sub-configurations
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Log level for the application
    ///
    /// Controls the verbosity of `blotter` targets. `RUST_LOG` overrides it
    /// entirely. Valid values: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional file receiving a JSON copy of every log event (append-only)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Port for the web server (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database connection URL
    pub database_url: String,

    /// CKAN action API root
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    /// Datastore resource holding the incident table
    #[serde(default = "default_upstream_resource_id")]
    pub upstream_resource_id: String,
    #[serde(
        default = "default_upstream_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub upstream_timeout: Duration,
    #[serde(default = "default_requests_per_minute")]
    pub upstream_requests_per_minute: u32,
    /// Rows per upstream page (the portal caps this at 32 000)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(
        default = "default_retry_base_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub retry_base_delay: Duration,
    #[serde(
        default = "default_retry_max_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub retry_max_delay: Duration,
    /// Upper bound on a single batch upsert
    #[serde(
        default = "default_store_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub store_timeout: Duration,

    /// Time between scheduled runs
    #[serde(
        default = "default_sync_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub sync_interval: Duration,
    /// Local time (in `source_timezone`) of an extra daily run, as "HH:MM".
    /// "off" disables it.
    #[serde(default = "default_sync_at", deserialize_with = "deserialize_time_of_day")]
    pub sync_at: Option<NaiveTime>,
    /// Location of the status document (checkpoint and run history)
    #[serde(default = "default_status_path")]
    pub status_path: PathBuf,
    /// Number of runs kept in the status document
    #[serde(default = "default_status_history")]
    pub status_history: usize,
    /// Zone used to interpret the portal's naive timestamps
    #[serde(default = "default_source_timezone")]
    pub source_timezone: Tz,

    /// Graceful shutdown timeout (default: 8 seconds)
    ///
    /// Accepts both numeric values (seconds) and duration strings.
    /// Examples: "8", "8s", "30s", "1m"
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_upstream_base_url() -> String {
    "https://www.phoenixopendata.com/api/3/action".to_string()
}

fn default_upstream_resource_id() -> String {
    "0ce3411a-2fc6-4302-a33f-167f68608a20".to_string()
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_requests_per_minute() -> u32 {
    30
}

fn default_page_size() -> u32 {
    10_000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_retry_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(4 * 60 * 60)
}

fn default_sync_at() -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(11, 30, 0)
}

fn default_status_path() -> PathBuf {
    PathBuf::from("data/update_status.json")
}

fn default_status_history() -> usize {
    20
}

fn default_source_timezone() -> Tz {
    chrono_tz::America::Phoenix
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

static DURATION_PARSER: LazyLock<DurationParser> = LazyLock::new(|| {
    DurationParser::with_time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
        TimeUnit::Day,
    ])
});

fn parse_duration(value: &str) -> Result<Duration, String> {
    let parsed = DURATION_PARSER
        .parse(value.trim())
        .map_err(|e| format!("invalid duration {value:?}: {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("duration {value:?} out of range: {e}"))
}

/// Accepts a bare number of seconds or a duration string with a unit.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string or number of seconds")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            parse_duration(value).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("negative duration: {value}")))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

fn parse_time_of_day(value: &str) -> Result<Option<NaiveTime>, String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("off") || value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map(Some)
        .map_err(|e| format!("invalid time of day {value:?}: {e}"))
}

/// Accepts "HH:MM" or "HH:MM:SS"; an empty string or "off" means no time.
fn deserialize_time_of_day<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_time_of_day(&value).map_err(serde::de::Error::custom)
}

impl Config {
    /// Load from the environment and validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Env::raw()))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Config = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a run misbehave, before any run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::invalid("DATABASE_URL", "must not be empty"));
        }
        self.upstream_url()?;
        if self.upstream_resource_id.trim().is_empty() {
            return Err(ConfigError::invalid("UPSTREAM_RESOURCE_ID", "must not be empty"));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::invalid(
                "PAGE_SIZE",
                format!("must be between 1 and {MAX_PAGE_SIZE}, got {}", self.page_size),
            ));
        }
        if self.upstream_requests_per_minute == 0 {
            return Err(ConfigError::invalid(
                "UPSTREAM_REQUESTS_PER_MINUTE",
                "must be at least 1",
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::invalid("RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::invalid(
                "RETRY_BASE_DELAY",
                "must not exceed RETRY_MAX_DELAY",
            ));
        }
        for (key, value) in [
            ("UPSTREAM_TIMEOUT", self.upstream_timeout),
            ("STORE_TIMEOUT", self.store_timeout),
            ("SYNC_INTERVAL", self.sync_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if self.status_history == 0 {
            return Err(ConfigError::invalid("STATUS_HISTORY", "must be at least 1"));
        }
        Ok(())
    }

    fn upstream_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.upstream_base_url)
            .map_err(|e| ConfigError::invalid("UPSTREAM_BASE_URL", e.to_string()))
    }

    pub fn ckan_settings(&self) -> Result<CkanSettings, ConfigError> {
        let requests_per_minute = NonZeroU32::new(self.upstream_requests_per_minute)
            .ok_or_else(|| ConfigError::invalid("UPSTREAM_REQUESTS_PER_MINUTE", "must be at least 1"))?;
        Ok(CkanSettings {
            base_url: self.upstream_url()?,
            resource_id: self.upstream_resource_id.clone(),
            timeout: self.upstream_timeout,
            requests_per_minute,
            source_timezone: self.source_timezone,
        })
    }

    pub fn daily_run(&self) -> Option<DailyRun> {
        self.sync_at.map(|at| DailyRun {
            at,
            tz: self.source_timezone,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            jitter: true,
        }
    }
}
