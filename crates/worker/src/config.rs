use std::str::FromStr;
use std::time::Duration;

use sdrelay_sdwebui::readiness::ReadinessConfig;
use sdrelay_sdwebui::RetryPolicy;
use sdrelay_storage::BlobStoreConfig;

use crate::registry::{WorkerBinding, WorkerKind};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Worker configuration loaded from environment variables.
///
/// Every option has a default suitable for local development.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// WebUI base URL.
    pub api_endpoint: String,
    /// Policy for short status calls (readiness).
    pub check_policy: RetryPolicy,
    /// Policy for generation, options, captioning and upscale calls.
    pub post_policy: RetryPolicy,
    pub readiness: ReadinessConfig,
    pub redis_url: String,
    pub blobs: BlobStoreConfig,
    /// Bus key prefix.
    pub exchange: String,
    /// Jobs processed at once. The backend is single-tenant, so this
    /// rarely needs to exceed 1.
    pub concurrency: usize,
    /// Replaces the identity's default queue.
    pub queue_override: Option<String>,
    pub sd15_routing_key: String,
    pub sdxl_routing_key: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                     |
    /// |--------------------------------|-----------------------------|
    /// | `SD_WEBUI_API_ENDPOINT`        | `http://localhost:7860`     |
    /// | `SERVER_CHECK_TIMEOUT_SECS`    | `10`                        |
    /// | `SERVER_CHECK_RETRIES`         | `5`                         |
    /// | `SERVER_CHECK_BACKOFF`         | `1.0`                       |
    /// | `SERVER_POST_TIMEOUT_SECS`     | `600`                       |
    /// | `SERVER_POST_RETRIES`          | `3`                         |
    /// | `SERVER_POST_BACKOFF`          | `2.0`                       |
    /// | `READINESS_INITIAL_DELAY_SECS` | `0`                         |
    /// | `READINESS_POLL_INTERVAL_SECS` | `5`                         |
    /// | `READINESS_MAX_POLLS`          | `60`                        |
    /// | `REDIS_URL`                    | `redis://127.0.0.1:6379/0`  |
    /// | `BLOB_TTL_SECS`                | `86400`                     |
    /// | `TRACKING_TTL_SECS`            | `86400`                     |
    /// | `BLOB_NAMESPACE`               | `sdrelay`                   |
    /// | `BLOB_PUBLIC_BASE_URL`         | `https://blobs.localhost`   |
    /// | `EXCHANGE_NAME`                | `sdrelay`                   |
    /// | `WORKER_CONCURRENCY`           | `1`                         |
    /// | `SD_WEBUI_WORKER_QUEUE`        | identity default            |
    /// | `SD15_WEBUI_WORKER_ROUTING_KEY`| `*.sd15_webui.worker`       |
    /// | `SDXL_WEBUI_WORKER_ROUTING_KEY`| `*.sdxl_webui.worker`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let check_policy = RetryPolicy::new(
            env.parse("SERVER_CHECK_RETRIES", 5, "a non-negative integer")?,
            env.parse_backoff("SERVER_CHECK_BACKOFF", 1.0)?,
            env.secs("SERVER_CHECK_TIMEOUT_SECS", 10)?,
        );
        let post_policy = RetryPolicy::new(
            env.parse("SERVER_POST_RETRIES", 3, "a non-negative integer")?,
            env.parse_backoff("SERVER_POST_BACKOFF", 2.0)?,
            env.secs("SERVER_POST_TIMEOUT_SECS", 600)?,
        );

        let readiness = ReadinessConfig {
            initial_delay: env.secs("READINESS_INITIAL_DELAY_SECS", 0)?,
            poll_interval: env.secs("READINESS_POLL_INTERVAL_SECS", 5)?,
            max_polls: env.parse("READINESS_MAX_POLLS", 60, "a non-negative integer")?,
        };

        let defaults = BlobStoreConfig::default();
        let blobs = BlobStoreConfig {
            namespace: env.string("BLOB_NAMESPACE", &defaults.namespace),
            public_base_url: env.string("BLOB_PUBLIC_BASE_URL", &defaults.public_base_url),
            blob_ttl: env.secs("BLOB_TTL_SECS", 86_400)?,
            tracking_ttl: env.secs("TRACKING_TTL_SECS", 86_400)?,
        };

        let concurrency: usize = env.parse("WORKER_CONCURRENCY", 1, "a positive integer")?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_CONCURRENCY",
                value: "0".into(),
                expected: "a positive integer",
            });
        }

        Ok(Self {
            api_endpoint: env.string("SD_WEBUI_API_ENDPOINT", "http://localhost:7860"),
            check_policy,
            post_policy,
            readiness,
            redis_url: env.string("REDIS_URL", "redis://127.0.0.1:6379/0"),
            blobs,
            exchange: env.string("EXCHANGE_NAME", "sdrelay"),
            concurrency,
            queue_override: (env.lookup)("SD_WEBUI_WORKER_QUEUE").filter(|q| !q.trim().is_empty()),
            sd15_routing_key: env.string(
                "SD15_WEBUI_WORKER_ROUTING_KEY",
                WorkerKind::Sd15.default_routing_key(),
            ),
            sdxl_routing_key: env.string(
                "SDXL_WEBUI_WORKER_ROUTING_KEY",
                WorkerKind::Sdxl.default_routing_key(),
            ),
        })
    }

    /// Queue and routing pattern for `kind`.
    pub fn binding(&self, kind: WorkerKind) -> WorkerBinding {
        let routing_key = match kind {
            WorkerKind::Sd15 => self.sd15_routing_key.clone(),
            WorkerKind::Sdxl => self.sdxl_routing_key.clone(),
        };
        WorkerBinding {
            kind,
            queue: self
                .queue_override
                .clone()
                .unwrap_or_else(|| kind.default_queue().to_string()),
            routing_key,
        }
    }
}

// ---- private helpers ----

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, var: &str, default: &str) -> String {
        (self.lookup)(var)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(
        &self,
        var: &'static str,
        default: T,
        expected: &'static str,
    ) -> Result<T, ConfigError> {
        match (self.lookup)(var).filter(|v| !v.trim().is_empty()) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                var,
                value,
                expected,
            }),
        }
    }

    fn secs(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(var, default, "a whole number of seconds")
            .map(Duration::from_secs)
    }

    fn parse_backoff(&self, var: &'static str, default: f64) -> Result<f64, ConfigError> {
        let factor: f64 = self.parse(var, default, "a non-negative number")?;
        if !factor.is_finite() || factor < 0.0 {
            return Err(ConfigError::Invalid {
                var,
                value: factor.to_string(),
                expected: "a non-negative number",
            });
        }
        Ok(factor)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.api_endpoint, "http://localhost:7860");
        assert_eq!(config.check_policy, RetryPolicy::new(5, 1.0, Duration::from_secs(10)));
        assert_eq!(config.post_policy, RetryPolicy::new(3, 2.0, Duration::from_secs(600)));
        assert_eq!(config.readiness.max_polls, 60);
        assert_eq!(config.blobs.blob_ttl, Duration::from_secs(86_400));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.exchange, "sdrelay");
    }

    #[test]
    fn overrides_are_read() {
        let config = load(&[
            ("SD_WEBUI_API_ENDPOINT", "http://gpu-1:7860"),
            ("SERVER_POST_RETRIES", "7"),
            ("SERVER_POST_BACKOFF", "0.5"),
            ("BLOB_TTL_SECS", "60"),
            ("WORKER_CONCURRENCY", "2"),
        ])
        .unwrap();
        assert_eq!(config.api_endpoint, "http://gpu-1:7860");
        assert_eq!(config.post_policy.retries, 7);
        assert_eq!(config.post_policy.backoff_factor, 0.5);
        assert_eq!(config.blobs.blob_ttl, Duration::from_secs(60));
        assert_eq!(config.concurrency, 2);
    }

    #[test]
    fn invalid_values_are_reported() {
        assert_matches!(
            load(&[("SERVER_CHECK_RETRIES", "many")]),
            Err(ConfigError::Invalid { var: "SERVER_CHECK_RETRIES", .. })
        );
        assert_matches!(
            load(&[("SERVER_POST_BACKOFF", "-1")]),
            Err(ConfigError::Invalid { var: "SERVER_POST_BACKOFF", .. })
        );
        assert_matches!(
            load(&[("WORKER_CONCURRENCY", "0")]),
            Err(ConfigError::Invalid { var: "WORKER_CONCURRENCY", .. })
        );
    }

    #[test]
    fn binding_uses_identity_defaults_and_overrides() {
        let config = load(&[]).unwrap();
        let binding = config.binding(WorkerKind::Sd15);
        assert_eq!(binding.queue, "sd_webui_sd15_queue");
        assert_eq!(binding.routing_key, "*.sd15_webui.worker");

        let config = load(&[
            ("SD_WEBUI_WORKER_QUEUE", "gpu_7_queue"),
            ("SDXL_WEBUI_WORKER_ROUTING_KEY", "eu.sdxl_webui.worker"),
        ])
        .unwrap();
        let binding = config.binding(WorkerKind::Sdxl);
        assert_eq!(binding.queue, "gpu_7_queue");
        assert_eq!(binding.routing_key, "eu.sdxl_webui.worker");
    }
}
