use std::env;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{Context, Result};
use zeroize::{Zeroize, Zeroizing};

const MAX_LICENSE_VALIDITY_DAYS: i64 = 36_500;
const MAX_OFFLINE_GRACE_HOURS: i64 = 24 * 36_500;

/// Service configuration, read once at startup.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database.
    pub database_url: String,
    /// Maximum open database connections.
    pub database_pool_size: usize,
    /// The master key the KEKs are derived from.
    pub master_key: Zeroizing<Vec<u8>>,
    /// KEK version new CEKs are wrapped under.
    pub kek_version: i32,
    /// How long a freshly issued license stays valid, in days.
    pub license_validity_days: i64,
    /// Default offline grace period, in hours.
    pub offline_grace_hours: i64,
    /// Substitute the default grace period for unparsable stored values.
    pub lenient_grace_parsing: bool,
    /// Jobs processed in parallel by one worker.
    pub worker_concurrency: usize,
    /// Jobs claimed per poll.
    pub worker_batch_size: usize,
    /// Delay between polls when the queue is idle.
    pub worker_poll_interval: Duration,
    /// How long a job may sit in `processing` before it is reclaimed.
    pub job_visibility_timeout: Duration,
    /// Retries before a failed job is abandoned.
    pub job_max_retries: i32,
    /// How long completed jobs are kept.
    pub job_retention: Duration,
    /// Interval between sweeper runs.
    pub sweep_interval: Duration,
    /// Capacity of the audit forwarding queue.
    pub audit_queue_size: usize,
}

fn var_or<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

impl Config {
    /// Creates a new `Config` from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut master_key_hex = env::var("MASTER_KEY")
            .context("MASTER_KEY must be set (generate with: openssl rand -hex 32)")?;

        let master_key_bytes = hex::decode(&master_key_hex)
            .context("MASTER_KEY must be valid hexadecimal")?;

        master_key_hex.zeroize();

        if master_key_bytes.len() != 32 {
            anyhow::bail!("MASTER_KEY must be exactly 32 bytes (64 hex characters)");
        }

        let config = Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            database_pool_size: var_or("DATABASE_POOL_SIZE", "16")?,
            master_key: Zeroizing::new(master_key_bytes),
            kek_version: var_or("KEK_VERSION", "1")?,
            license_validity_days: var_or("LICENSE_VALIDITY_DAYS", "30")?,
            offline_grace_hours: var_or("OFFLINE_GRACE_HOURS", "72")?,
            lenient_grace_parsing: var_or("LENIENT_GRACE_PARSING", "false")?,
            worker_concurrency: var_or("WORKER_CONCURRENCY", "2")?,
            worker_batch_size: var_or("WORKER_BATCH_SIZE", "10")?,
            worker_poll_interval: Duration::from_millis(var_or("WORKER_POLL_INTERVAL_MS", "1000")?),
            job_visibility_timeout: Duration::from_secs(var_or("JOB_VISIBILITY_TIMEOUT_SECS", "1800")?),
            job_max_retries: var_or("JOB_MAX_RETRIES", "3")?,
            job_retention: Duration::from_secs(3600 * var_or::<u64>("JOB_RETENTION_HOURS", "168")?),
            sweep_interval: Duration::from_secs(var_or("SWEEP_INTERVAL_SECS", "60")?),
            audit_queue_size: var_or("AUDIT_QUEUE_SIZE", "1024")?,
        };

        config.check()?;

        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.kek_version < 1 {
            anyhow::bail!("KEK_VERSION must be at least 1");
        }
        if self.worker_concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.worker_poll_interval.is_zero() {
            anyhow::bail!("WORKER_POLL_INTERVAL_MS must be at least 1");
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be at least 1");
        }
        if !(1..=MAX_LICENSE_VALIDITY_DAYS).contains(&self.license_validity_days) {
            anyhow::bail!("LICENSE_VALIDITY_DAYS must be between 1 and {}", MAX_LICENSE_VALIDITY_DAYS);
        }
        if !(0..=MAX_OFFLINE_GRACE_HOURS).contains(&self.offline_grace_hours) {
            anyhow::bail!("OFFLINE_GRACE_HOURS must be between 0 and {}", MAX_OFFLINE_GRACE_HOURS);
        }
        Ok(())
    }

    /// License validity as a chrono duration.
    pub fn license_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.license_validity_days)
    }

    /// Default grace period as a chrono duration.
    pub fn offline_grace_period(&self) -> chrono::Duration {
        chrono::Duration::hours(self.offline_grace_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database_url: "postgres://localhost/offline".into(),
            database_pool_size: 16,
            master_key: Zeroizing::new(vec![0u8; 32]),
            kek_version: 1,
            license_validity_days: 30,
            offline_grace_hours: 72,
            lenient_grace_parsing: false,
            worker_concurrency: 2,
            worker_batch_size: 10,
            worker_poll_interval: Duration::from_millis(1000),
            job_visibility_timeout: Duration::from_secs(1800),
            job_max_retries: 3,
            job_retention: Duration::from_secs(3600 * 168),
            sweep_interval: Duration::from_secs(60),
            audit_queue_size: 1024,
        }
    }

    #[test]
    fn defaults_pass_checks() {
        assert!(config().check().is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut c = config();
        c.sweep_interval = Duration::ZERO;
        assert!(c.check().is_err());

        let mut c = config();
        c.worker_poll_interval = Duration::ZERO;
        assert!(c.check().is_err());
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let mut c = config();
        c.license_validity_days = i64::MAX;
        assert!(c.check().is_err());

        let mut c = config();
        c.offline_grace_hours = -1;
        assert!(c.check().is_err());

        let mut c = config();
        c.kek_version = 0;
        assert!(c.check().is_err());
    }
}
