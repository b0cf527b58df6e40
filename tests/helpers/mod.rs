#![allow(dead_code)]

use relayq::{LockClusterConfig, QueueClusterConfig};

fn hosts_from_env(var: &str, default: &[&str]) -> Vec<String> {
    std::env::var(var)
        .map(|hosts| hosts.split(',').map(|h| h.trim().to_string()).collect())
        .unwrap_or_else(|_| default.iter().map(|h| h.to_string()).collect())
}

pub fn queue_hosts() -> Vec<String> {
    hosts_from_env(
        "RELAYQ_QUEUE_HOSTS",
        &["127.0.0.1:7711", "127.0.0.1:7712", "127.0.0.1:7713"],
    )
}

pub fn lock_hosts() -> Vec<String> {
    hosts_from_env(
        "RELAYQ_LOCK_HOSTS",
        &["127.0.0.1:7777", "127.0.0.1:7778", "127.0.0.1:7779"],
    )
}

pub fn queue_config() -> QueueClusterConfig {
    QueueClusterConfig::new(queue_hosts())
}

pub fn queue_config_single() -> QueueClusterConfig {
    QueueClusterConfig::new(queue_hosts().into_iter().take(1))
}

pub fn lock_config() -> LockClusterConfig {
    LockClusterConfig::new(lock_hosts())
}

pub fn random_key() -> String {
    format!("lockkey{}", uuid::Uuid::new_v4().simple())
}

pub fn random_queue() -> String {
    format!("jobq{}", uuid::Uuid::new_v4().simple())
}
