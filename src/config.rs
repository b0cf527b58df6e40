//! Cluster and consumer configuration types.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use std::time::Duration;

#[serde_with::serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
/// Controls how a consumer fetches, locks and executes jobs.
pub struct ConsumerConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_fetch_timeout")]
    /// How long a blocking fetch waits for a delivery before looping.
    pub fetch_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_lock_ttl")]
    /// Nominal TTL of the per-job distributed lock.
    pub lock_ttl: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(default = "default_watchdog_tick")]
    /// Wake-up period of the visibility watchdog while a job is in flight.
    pub watchdog_tick: Duration,
    #[serde(default = "default_ack_on_handler_error")]
    /// Whether a job is acknowledged even when its handler returned an
    /// error. When `false` the job is left to be redelivered instead.
    pub ack_on_handler_error: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: default_fetch_timeout(),
            lock_ttl: default_lock_ttl(),
            watchdog_tick: default_watchdog_tick(),
            ack_on_handler_error: default_ack_on_handler_error(),
        }
    }
}

#[serde_with::serde_as]
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[builder(build_fn(skip))]
/// Connection settings for the job-queue cluster.
/// Build with [`QueueClusterConfig::builder`](Self::builder).
pub struct QueueClusterConfig {
    #[builder(setter(into))]
    /// `host:port` of every queue node. At least one is required.
    pub hosts: Vec<String>,
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds<u64>>")]
    #[serde(default)]
    #[builder(setter(strip_option), default)]
    /// Replication timeout passed along with every add.
    pub(crate) add_timeout: Option<Duration>,
}

impl QueueClusterConfig {
    pub fn builder() -> QueueClusterConfigBuilder {
        QueueClusterConfigBuilder::default()
    }

    /// Shorthand for a config with default options.
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            add_timeout: None,
        }
    }

    pub(crate) fn add_timeout(&self) -> Duration {
        self.add_timeout.unwrap_or_else(default_add_timeout)
    }
}

impl QueueClusterConfigBuilder {
    /// Validate and construct a [`QueueClusterConfig`].
    pub fn build(&mut self) -> Result<QueueClusterConfig, String> {
        match self.hosts.as_ref() {
            None => return Err("At least one queue host must be set".to_string()),
            Some(hosts) if hosts.is_empty() => {
                return Err("At least one queue host must be set".to_string());
            }
            Some(_) => (),
        }
        Ok(QueueClusterConfig {
            hosts: self.hosts.clone().unwrap_or_default(),
            add_timeout: self.add_timeout.flatten(),
        })
    }
}

#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[builder(build_fn(skip))]
/// Connection settings for the lock cluster: independent in-memory key/value
/// nodes the consumer fans out to for quorum locking.
pub struct LockClusterConfig {
    #[builder(setter(into))]
    /// `host:port` of every lock member. The member count fixes the quorum.
    pub hosts: Vec<String>,
}

impl LockClusterConfig {
    pub fn builder() -> LockClusterConfigBuilder {
        LockClusterConfigBuilder::default()
    }

    /// Shorthand for a config with default options.
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

impl LockClusterConfigBuilder {
    /// Validate and construct a [`LockClusterConfig`].
    pub fn build(&mut self) -> Result<LockClusterConfig, String> {
        match self.hosts.as_ref() {
            None => return Err("At least one lock member must be set".to_string()),
            Some(hosts) if hosts.is_empty() => {
                return Err("At least one lock member must be set".to_string());
            }
            Some(_) => (),
        }
        Ok(LockClusterConfig {
            hosts: self.hosts.clone().unwrap_or_default(),
        })
    }
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(16)
}

fn default_watchdog_tick() -> Duration {
    Duration::from_millis(1)
}

fn default_ack_on_handler_error() -> bool {
    true
}

fn default_add_timeout() -> Duration {
    Duration::from_millis(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_requires_hosts() {
        assert!(QueueClusterConfig::builder().build().is_err());
        assert!(
            QueueClusterConfig::builder()
                .hosts(Vec::<String>::new())
                .build()
                .is_err()
        );
        let config = QueueClusterConfig::builder()
            .hosts(vec!["127.0.0.1:7711".to_string()])
            .build()
            .unwrap();
        assert_eq!(config.hosts.len(), 1);
    }

    #[test]
    fn lock_config_requires_hosts() {
        assert!(LockClusterConfig::builder().build().is_err());
        let config = LockClusterConfig::builder()
            .hosts(vec!["127.0.0.1:7777".to_string()])
            .build()
            .unwrap();
        assert_eq!(config.hosts.len(), 1);
    }

    #[test]
    fn consumer_config_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.lock_ttl, Duration::from_secs(16));
        assert_eq!(config.watchdog_tick, Duration::from_millis(1));
        assert!(config.ack_on_handler_error);
    }

    #[test]
    fn consumer_config_deserializes_with_defaults() {
        let config: ConsumerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
        let config: ConsumerConfig =
            serde_json::from_str(r#"{"fetch_timeout": 2, "ack_on_handler_error": false}"#).unwrap();
        assert_eq!(config.fetch_timeout, Duration::from_secs(2));
        assert!(!config.ack_on_handler_error);
    }
}
