//! Service configuration from the environment.

use crate::broadcast::{DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_TERMINAL_RETENTION};
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerSettings;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration. Every field has a default suitable for local use.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Default output directory for jobs that do not name one.
    pub output_dir: PathBuf,
    /// Where failure trace files go; `None` disables them.
    pub error_log_dir: Option<PathBuf>,
    /// Redis URL for the status mirror; `None` disables it.
    pub redis_url: Option<String>,
    pub request_retries: u32,
    pub request_retry_backoff: Duration,
    pub subscriber_buffer: usize,
    /// Finished jobs kept pollable; `0` keeps all of them.
    pub terminal_job_retention: usize,
    pub sse_heartbeat: Duration,
    pub mirror_write_interval: Duration,
    /// Exporter program speaking the JSON-lines protocol.
    pub export_command: Option<PathBuf>,
    pub slow_job_warn: Duration,
    /// Emit JSON log lines.
    pub log_json: bool,
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default        |
    /// |-------------------------------|----------------|
    /// | `HOST`                        | `127.0.0.1`    |
    /// | `PORT`                        | `8000`         |
    /// | `OUTPUT_DIR`                  | `./output`     |
    /// | `ERROR_LOG_DIR`               | unset          |
    /// | `REDIS_URL`                   | unset          |
    /// | `REQUEST_RETRIES`             | `2`            |
    /// | `REQUEST_RETRY_BACKOFF_MS`    | `500`          |
    /// | `SUBSCRIBER_BUFFER`           | `32`           |
    /// | `TERMINAL_JOB_RETENTION`      | `500`          |
    /// | `SSE_HEARTBEAT_SECS`          | `15`           |
    /// | `MIRROR_WRITE_INTERVAL_MS`    | `250`          |
    /// | `EXPORT_COMMAND`              | unset          |
    /// | `SLOW_JOB_WARN_SECS`          | `600`          |
    /// | `LOG_FORMAT`                  | `text`         |
    /// | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset          |
    /// | `OTEL_SERVICE_NAME`           | `export-queue` |
    ///
    /// `TERMINAL_JOB_RETENTION=0` disables pruning of finished jobs.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: parse(&var, "PORT", 8000)?,
            output_dir: var("OUTPUT_DIR").map_or_else(|| PathBuf::from("./output"), PathBuf::from),
            error_log_dir: var("ERROR_LOG_DIR").map(PathBuf::from),
            redis_url: var("REDIS_URL"),
            request_retries: parse(&var, "REQUEST_RETRIES", 2)?,
            request_retry_backoff: Duration::from_millis(parse(&var, "REQUEST_RETRY_BACKOFF_MS", 500)?),
            subscriber_buffer: parse(&var, "SUBSCRIBER_BUFFER", DEFAULT_SUBSCRIBER_BUFFER)?,
            terminal_job_retention: parse(&var, "TERMINAL_JOB_RETENTION", DEFAULT_TERMINAL_RETENTION)?,
            sse_heartbeat: Duration::from_secs(parse(&var, "SSE_HEARTBEAT_SECS", 15)?),
            mirror_write_interval: Duration::from_millis(parse(&var, "MIRROR_WRITE_INTERVAL_MS", 250)?),
            export_command: var("EXPORT_COMMAND").map(PathBuf::from),
            slow_job_warn: Duration::from_secs(parse(&var, "SLOW_JOB_WARN_SECS", 600)?),
            log_json: var("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
            otlp_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT"),
            service_name: var("OTEL_SERVICE_NAME").unwrap_or_else(|| "export-queue".into()),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Retry policy for individual exporter requests.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_retries(self.request_retries, self.request_retry_backoff)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            error_log_dir: self.error_log_dir.clone(),
            slow_job_warn: self.slow_job_warn,
        }
    }
}

fn parse<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number, got {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:8000");
        assert_eq!(config.output_dir, PathBuf::from("./output"));
        assert_eq!(config.request_retries, 2);
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.subscriber_buffer, 32);
        assert_eq!(config.terminal_job_retention, 500);
        assert_eq!(config.sse_heartbeat, Duration::from_secs(15));
        assert!(config.redis_url.is_none());
        assert!(config.export_command.is_none());
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PORT", "9100"),
            ("REDIS_URL", "redis://cache:6379/"),
            ("REQUEST_RETRY_BACKOFF_MS", "50"),
            ("ERROR_LOG_DIR", "/var/log/export"),
            ("LOG_FORMAT", "JSON"),
            ("EXPORT_COMMAND", " "),
            ("TERMINAL_JOB_RETENTION", "0"),
        ])
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379/"));
        assert_eq!(config.request_retry_backoff, Duration::from_millis(50));
        assert_eq!(config.scheduler_settings().error_log_dir, Some(PathBuf::from("/var/log/export")));
        assert!(config.log_json);
        assert!(config.export_command.is_none());
        assert_eq!(config.terminal_job_retention, 0);
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = config(&[("SUBSCRIBER_BUFFER", "lots")]).unwrap_err();
        assert!(err.to_string().contains("SUBSCRIBER_BUFFER"));
    }
}
