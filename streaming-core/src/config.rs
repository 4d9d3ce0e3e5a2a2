//! Configuration options the core recognizes (spec.md §6, SPEC_FULL.md §10.2).

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_application() -> String {
    "MetaApi".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_max_accounts_per_instance() -> usize {
    100
}

fn default_packet_ordering_timeout_secs() -> u64 {
    60
}

fn default_unsubscribe_throttling_interval_secs() -> u64 {
    10
}

fn default_retries() -> u32 {
    5
}

fn default_min_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    30
}

fn default_subscribe_cooldown_secs() -> u64 {
    600
}

fn default_max_concurrent_synchronizations() -> usize {
    15
}

fn default_queue_timeout_secs() -> u64 {
    300
}

fn default_synchronization_timeout_secs() -> u64 {
    10
}

/// Retry/backoff knobs for the RPC layer (§6 `retryOpts.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOpts {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_min_delay_secs")]
    pub min_delay_in_seconds: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_in_seconds: u64,
    #[serde(default = "default_subscribe_cooldown_secs")]
    pub subscribe_cooldown_in_seconds: u64,
}

impl Default for RetryOpts {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            min_delay_in_seconds: default_min_delay_secs(),
            max_delay_in_seconds: default_max_delay_secs(),
            subscribe_cooldown_in_seconds: default_subscribe_cooldown_secs(),
        }
    }
}

impl RetryOpts {
    pub fn min_delay(&self) -> Duration {
        Duration::from_secs(self.min_delay_in_seconds)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_in_seconds)
    }

    pub fn subscribe_cooldown(&self) -> Duration {
        Duration::from_secs(self.subscribe_cooldown_in_seconds)
    }
}

/// Synchronization throttler knobs (§6, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizationThrottlerConfig {
    #[serde(default = "default_max_concurrent_synchronizations")]
    pub max_concurrent_synchronizations: usize,
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_in_seconds: u64,
    #[serde(default = "default_synchronization_timeout_secs")]
    pub synchronization_timeout_in_seconds: u64,
}

impl Default for SynchronizationThrottlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_synchronizations: default_max_concurrent_synchronizations(),
            queue_timeout_in_seconds: default_queue_timeout_secs(),
            synchronization_timeout_in_seconds: default_synchronization_timeout_secs(),
        }
    }
}

impl SynchronizationThrottlerConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_in_seconds)
    }

    pub fn synchronization_timeout(&self) -> Duration {
        Duration::from_secs(self.synchronization_timeout_in_seconds)
    }
}

/// Top level configuration for the streaming core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_application")]
    pub application: String,
    pub domain: String,
    pub region: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_in_seconds: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_in_seconds: u64,
    #[serde(default)]
    pub retry_opts: RetryOpts,
    #[serde(default = "default_packet_ordering_timeout_secs")]
    pub packet_ordering_timeout_in_seconds: u64,
    #[serde(default)]
    pub use_shared_client_api: bool,
    #[serde(default = "default_unsubscribe_throttling_interval_secs")]
    pub unsubscribe_throttling_interval_in_seconds: u64,
    #[serde(default)]
    pub synchronization_throttler: SynchronizationThrottlerConfig,
    #[serde(default = "default_max_accounts_per_instance")]
    pub max_accounts_per_instance: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application: default_application(),
            domain: String::new(),
            region: None,
            request_timeout_in_seconds: default_request_timeout_secs(),
            connect_timeout_in_seconds: default_connect_timeout_secs(),
            retry_opts: RetryOpts::default(),
            packet_ordering_timeout_in_seconds: default_packet_ordering_timeout_secs(),
            use_shared_client_api: false,
            unsubscribe_throttling_interval_in_seconds: default_unsubscribe_throttling_interval_secs(),
            synchronization_throttler: SynchronizationThrottlerConfig::default(),
            max_accounts_per_instance: default_max_accounts_per_instance(),
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_in_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_in_seconds)
    }

    pub fn packet_ordering_timeout(&self) -> Duration {
        Duration::from_secs(self.packet_ordering_timeout_in_seconds)
    }

    pub fn unsubscribe_throttling_interval(&self) -> Duration {
        Duration::from_secs(self.unsubscribe_throttling_interval_in_seconds)
    }

    /// Validate invariants that would otherwise surface confusingly deep in a
    /// retry loop (SPEC_FULL.md §11).
    pub fn validate(&self) -> Result<(), String> {
        if self.retry_opts.min_delay_in_seconds > self.retry_opts.max_delay_in_seconds {
            return Err("retry_opts.min_delay_in_seconds must be <= max_delay_in_seconds".into());
        }

        if self.max_accounts_per_instance == 0 {
            return Err("max_accounts_per_instance must be > 0".into());
        }

        if self.domain.is_empty() {
            return Err("domain must be set".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config {
            domain: "agiliumtrade.agiliumtrade.ai".to_string(),
            ..Default::default()
        };

        assert_eq!(cfg.application, "MetaApi");
        assert_eq!(cfg.request_timeout_in_seconds, 60);
        assert_eq!(cfg.retry_opts.retries, 5);
        assert_eq!(cfg.retry_opts.min_delay_in_seconds, 1);
        assert_eq!(cfg.retry_opts.max_delay_in_seconds, 30);
        assert_eq!(cfg.retry_opts.subscribe_cooldown_in_seconds, 600);
        assert_eq!(cfg.max_accounts_per_instance, 100);
        assert_eq!(cfg.synchronization_throttler.max_concurrent_synchronizations, 15);
        assert_eq!(cfg.synchronization_throttler.queue_timeout_in_seconds, 300);
        assert_eq!(cfg.synchronization_throttler.synchronization_timeout_in_seconds, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_retry_bounds() {
        let cfg = Config {
            domain: "x".to_string(),
            retry_opts: RetryOpts {
                min_delay_in_seconds: 45,
                max_delay_in_seconds: 30,
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(cfg.validate().is_err());
    }
}
