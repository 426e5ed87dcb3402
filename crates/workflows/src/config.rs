// Worker configuration loaded from environment variables.
// Decision: One process serves every configured task queue, one worker pool each
// Decision: Without DATABASE_URL the worker runs on in-memory stores (development only)

use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::rack::MaasApiKey;

pub const DEFAULT_TASK_QUEUE: &str = "region";
pub const DEFAULT_MAAS_URL: &str = "http://localhost:5240/MAAS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(name: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            name,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// `maas-temporal-worker` configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique identifier of this worker process
    pub worker_id: String,
    /// Task queues served by this process
    pub task_queues: Vec<String>,
    pub max_concurrent_tasks: usize,
    /// Delay between polls of an empty task queue
    pub poll_interval: Duration,
    /// PostgreSQL connection string; in-memory stores when unset
    pub database_url: Option<String>,
    /// Base URL of the MAAS API
    pub maas_url: Url,
    /// Credentials for the MAAS API; requests go unsigned when unset
    pub maas_api_key: Option<MaasApiKey>,
    /// Timeout of a single MSM HTTP request
    pub msm_request_timeout: Duration,
    /// Log filter, `RUST_LOG` syntax
    pub log_level: Option<String>,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    ///
    /// - `WORKER_ID`: worker identifier (default: `worker-<uuid>`)
    /// - `TASK_QUEUES`: comma separated task queues (default: `region`)
    /// - `MAX_CONCURRENT_TASKS`: concurrent activity tasks per queue (default: 10)
    /// - `POLL_INTERVAL_MS`: empty queue poll delay (default: 500)
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `MAAS_URL`: MAAS API base URL (default: `http://localhost:5240/MAAS`)
    /// - `MAAS_API_KEY`: MAAS API key, `<consumer>:<token>:<secret>`
    /// - `MSM_REQUEST_TIMEOUT_SECS`: MSM request timeout (default: 3600)
    /// - `LOG_LEVEL`: log filter
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let task_queues = match get("TASK_QUEUES") {
            Some(raw) => {
                let queues: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(str::to_string)
                    .collect();
                if queues.is_empty() {
                    return Err(ConfigError::invalid("TASK_QUEUES", &raw, "no task queue"));
                }
                queues
            }
            None => vec![DEFAULT_TASK_QUEUE.to_string()],
        };

        let max_concurrent_tasks = match get("MAX_CONCURRENT_TASKS") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) => {
                    return Err(ConfigError::invalid(
                        "MAX_CONCURRENT_TASKS",
                        &raw,
                        "must be positive",
                    ))
                }
                Ok(n) => n,
                Err(e) => return Err(ConfigError::invalid("MAX_CONCURRENT_TASKS", &raw, e)),
            },
            None => 10,
        };

        let poll_interval = match get("POLL_INTERVAL_MS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::invalid("POLL_INTERVAL_MS", &raw, e))?,
            None => Duration::from_millis(500),
        };

        let raw_url = get("MAAS_URL").unwrap_or_else(|| DEFAULT_MAAS_URL.to_string());
        let maas_url =
            Url::parse(raw_url.trim()).map_err(|e| ConfigError::invalid("MAAS_URL", &raw_url, e))?;

        let maas_api_key = get("MAAS_API_KEY")
            .map(|raw| {
                raw.parse::<MaasApiKey>()
                    .map_err(|e| ConfigError::invalid("MAAS_API_KEY", "<redacted>", e))
            })
            .transpose()?;

        let msm_request_timeout = match get("MSM_REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::invalid("MSM_REQUEST_TIMEOUT_SECS", &raw, e))?,
            None => Duration::from_secs(60 * 60),
        };

        Ok(Self {
            worker_id: get("WORKER_ID").unwrap_or_else(|| format!("worker-{}", Uuid::now_v7())),
            task_queues,
            max_concurrent_tasks,
            poll_interval,
            database_url: get("DATABASE_URL"),
            maas_url,
            maas_api_key,
            msm_request_timeout,
            log_level: get("LOG_LEVEL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[])).expect("should load");

        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.task_queues, vec!["region"]);
        assert_eq!(config.max_concurrent_tasks, 10);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.database_url, None);
        assert_eq!(config.maas_url.as_str(), "http://localhost:5240/MAAS");
        assert_eq!(config.maas_api_key, None);
        assert_eq!(config.msm_request_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_overrides() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_ID", "region-1"),
            ("TASK_QUEUES", "region, abc123 ,"),
            ("MAX_CONCURRENT_TASKS", "4"),
            ("POLL_INTERVAL_MS", "50"),
            ("DATABASE_URL", "postgres://maas@localhost/maasdb"),
            ("MAAS_URL", "http://10.0.0.2:5240/MAAS/"),
            ("MAAS_API_KEY", "consumer:token:secret"),
            ("LOG_LEVEL", "debug"),
        ]))
        .expect("should load");

        assert_eq!(config.worker_id, "region-1");
        assert_eq!(config.task_queues, vec!["region", "abc123"]);
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://maas@localhost/maasdb")
        );
        assert_eq!(config.maas_url.host_str(), Some("10.0.0.2"));
        let api_key = config.maas_api_key.expect("should load api key");
        assert_eq!(api_key.consumer_key, "consumer");
        assert_eq!(api_key.token_key, "token");
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        for vars in [
            [("MAX_CONCURRENT_TASKS", "0")],
            [("MAX_CONCURRENT_TASKS", "many")],
            [("POLL_INTERVAL_MS", "-1")],
            [("MAAS_URL", "not a url")],
            [("TASK_QUEUES", " , ")],
            [("MAAS_API_KEY", "consumer:token")],
        ] {
            let result = WorkerConfig::from_lookup(lookup(&vars));
            assert!(result.is_err(), "{vars:?} should be rejected");
        }
    }

    #[test]
    fn test_invalid_api_key_is_not_echoed() {
        let error = WorkerConfig::from_lookup(lookup(&[("MAAS_API_KEY", "consumer:hunter2")]))
            .expect_err("should reject api key");

        let message = error.to_string();
        assert!(message.contains("MAAS_API_KEY"));
        assert!(!message.contains("hunter2"));
    }
}
