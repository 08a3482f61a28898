use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::DbConfig;
use crate::quota::{
    QuotaLimits, DEFAULT_MAX_CONCURRENT_JOBS, DEFAULT_MAX_SERVERS_IN_ALL_JOBS,
    DEFAULT_MAX_SERVERS_PER_JOB,
};
use crate::scheduler::SchedulerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// Use the in-process mock provider instead of the HTTP gateway.
    pub dev_mode: bool,
    pub provider_url: String,
    pub provider_timeout: Duration,
    pub scheduler: SchedulerSettings,
    pub quota: QuotaLimits,
    pub max_tick_retries: u32,
    pub retry_window: Duration,
    /// Postgres store when set, in-memory store otherwise.
    pub database: Option<DbConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("DRX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("DRX_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let provider_url = std::env::var("DRX_PROVIDER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
        let provider_timeout = Duration::from_secs(parse_var("DRX_PROVIDER_TIMEOUT_SECS", 30)?);

        let tick_interval = Duration::from_secs(parse_var(
            "DRX_TICK_INTERVAL_SECS",
            drx_reconcile::DEFAULT_TICK_INTERVAL.as_secs(),
        )?);
        if tick_interval.is_zero() {
            anyhow::bail!("DRX_TICK_INTERVAL_SECS must be greater than zero");
        }
        let scheduler = SchedulerSettings {
            tick_interval,
            default_region: std::env::var("DRX_DEFAULT_REGION")
                .unwrap_or_else(|_| SchedulerSettings::default().default_region),
        };

        let quota = QuotaLimits {
            max_servers_per_job: parse_var("DRX_MAX_SERVERS_PER_JOB", DEFAULT_MAX_SERVERS_PER_JOB)?,
            max_concurrent_jobs: parse_var("DRX_MAX_CONCURRENT_JOBS", DEFAULT_MAX_CONCURRENT_JOBS)?,
            max_servers_in_all_jobs: parse_var(
                "DRX_MAX_SERVERS_IN_ALL_JOBS",
                DEFAULT_MAX_SERVERS_IN_ALL_JOBS,
            )?,
        };

        let max_tick_retries = parse_var("DRX_MAX_TICK_RETRIES", drx_reconcile::DEFAULT_MAX_RETRIES)?;
        let retry_window = Duration::from_secs(parse_var(
            "DRX_RETRY_WINDOW_SECS",
            drx_reconcile::DEFAULT_RETRY_WINDOW.as_secs(),
        )?);

        let database = match std::env::var("DRX_DATABASE_URL") {
            Ok(url) if !url.is_empty() => Some(DbConfig::new(
                url,
                parse_var("DRX_DB_MAX_CONNECTIONS", 10)?,
            )),
            _ => None,
        };

        Ok(Self {
            log_level,
            dev_mode,
            provider_url,
            provider_timeout,
            scheduler,
            quota,
            max_tick_retries,
            retry_window,
            database,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
