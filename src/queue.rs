//! Client for the job-queue cluster.
//!
//! The queue speaks a RESP dialect: `ADDJOB`, `GETJOB`, `SHOW`, `WORKING`
//! and `ACKJOB`. Every node is held behind its own auto-reconnecting
//! connection; commands prefer a current node and fail over to the next
//! member on error.

use chrono::{DateTime, Utc};
use redis::{Value, aio::ConnectionManager};
use tracing::instrument;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::{
    config::QueueClusterConfig,
    error::QueueError,
    job::{AddOptions, DEFAULT_RETRY, Job, JobId, QueueName},
};

struct QueueNode {
    addr: String,
    conn: ConnectionManager,
}

struct QueueClusterInner {
    nodes: Vec<QueueNode>,
    cursor: AtomicUsize,
    add_timeout: Duration,
}

#[derive(Clone)]
/// Handle to the queue cluster. Cheap to clone; safe for concurrent use by
/// workers and watchdogs.
pub struct QueueCluster {
    inner: Arc<QueueClusterInner>,
}

impl QueueCluster {
    /// Connect to every configured node.
    pub async fn connect(config: &QueueClusterConfig) -> Result<Self, QueueError> {
        if config.hosts.is_empty() {
            return Err(QueueError::NoNodesConfigured);
        }
        let mut nodes = Vec::with_capacity(config.hosts.len());
        for host in &config.hosts {
            let client = redis::Client::open(format!("redis://{host}"))?;
            let conn = client.get_connection_manager().await?;
            nodes.push(QueueNode {
                addr: host.clone(),
                conn,
            });
        }
        Ok(Self {
            inner: Arc::new(QueueClusterInner {
                nodes,
                cursor: AtomicUsize::new(0),
                add_timeout: config.add_timeout(),
            }),
        })
    }

    /// Open a command-grouping scope pinned to the current node, so that a
    /// fetch and the follow-up lookups/ack for the same job hit the node
    /// that delivered it. Advisory: correctness does not depend on it.
    /// The scope ends with [`QueueChain::unchain`] or on drop.
    pub fn chain(&self) -> QueueChain<'_> {
        QueueChain {
            cluster: self,
            node: self.inner.cursor.load(Ordering::Relaxed) % self.inner.nodes.len(),
        }
    }

    /// Enqueue a job for delivery at `eta`, honoring the replication options.
    #[instrument(name = "queue.add", skip(self, body, options), fields(queue = %queue), err)]
    pub async fn add(
        &self,
        queue: &QueueName,
        body: &str,
        eta: DateTime<Utc>,
        options: &AddOptions,
    ) -> Result<Job, QueueError> {
        let delay = (eta - Utc::now()).num_seconds().max(0);
        let mut cmd = redis::cmd("ADDJOB");
        cmd.arg(queue.as_str())
            .arg(body)
            .arg(self.inner.add_timeout.as_millis() as u64);
        if let Some(replicate) = options.replicate {
            cmd.arg("REPLICATE").arg(replicate);
        }
        if delay > 0 {
            cmd.arg("DELAY").arg(delay);
        }
        if let Some(retry) = options.retry {
            cmd.arg("RETRY").arg(retry.as_secs());
        }
        if let Some(ttl) = options.ttl {
            cmd.arg("TTL").arg(ttl.as_secs());
        }
        let value = self.exec(None, &cmd).await?;
        let id: String = redis::from_redis_value(&value)?;
        Ok(Job {
            id: id.into(),
            queue: queue.clone(),
            body: body.to_string(),
            retry: options.retry.unwrap_or(DEFAULT_RETRY),
        })
    }

    /// Look a job up by id. `None` when no node knows about it.
    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.get_on(None, id).await
    }

    /// Blocking fetch from `queue`, claiming the delivered job. `None` when
    /// the timeout expired with nothing to deliver.
    pub async fn fetch(
        &self,
        queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        self.fetch_on(None, queue, timeout).await
    }

    /// Extend the visibility/retry timer of an in-flight job.
    pub async fn wait(&self, id: &JobId) -> Result<(), QueueError> {
        let mut cmd = redis::cmd("WORKING");
        cmd.arg(id.as_str());
        self.exec(None, &cmd).await?;
        Ok(())
    }

    /// Finalize and remove a job.
    pub async fn ack(&self, id: &JobId) -> Result<(), QueueError> {
        self.ack_on(None, id).await
    }

    async fn get_on(&self, pin: Option<usize>, id: &JobId) -> Result<Option<Job>, QueueError> {
        let mut cmd = redis::cmd("SHOW");
        cmd.arg(id.as_str());
        let value = self.exec(pin, &cmd).await?;
        Job::from_show_reply(value)
    }

    async fn fetch_on(
        &self,
        pin: Option<usize>,
        queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let mut cmd = redis::cmd("GETJOB");
        cmd.arg("TIMEOUT")
            .arg(timeout.as_millis() as u64)
            .arg("COUNT")
            .arg(1)
            .arg("FROM")
            .arg(queue.as_str());
        let value = self.exec(pin, &cmd).await?;
        Job::from_fetch_reply(value)
    }

    async fn ack_on(&self, pin: Option<usize>, id: &JobId) -> Result<(), QueueError> {
        let mut cmd = redis::cmd("ACKJOB");
        cmd.arg(id.as_str());
        self.exec(pin, &cmd).await?;
        Ok(())
    }

    /// Run a command against the preferred node, rotating through the rest
    /// of the cluster on failure.
    async fn exec(&self, pin: Option<usize>, cmd: &redis::Cmd) -> Result<Value, QueueError> {
        let nodes = &self.inner.nodes;
        let start = pin.unwrap_or_else(|| self.inner.cursor.load(Ordering::Relaxed));
        let mut last_err = None;
        for attempt in 0..nodes.len() {
            let idx = (start + attempt) % nodes.len();
            let mut conn = nodes[idx].conn.clone();
            let reply: Result<Value, redis::RedisError> = cmd.query_async(&mut conn).await;
            match reply {
                Ok(value) => {
                    if attempt > 0 && pin.is_none() {
                        self.inner.cursor.store(idx, Ordering::Relaxed);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(node = %nodes[idx].addr, error = %e, "queue node command failed");
                    last_err = Some(e);
                }
            }
        }
        Err(QueueError::Redis(
            last_err.expect("at least one node was attempted"),
        ))
    }
}

/// A command-grouping scope over [`QueueCluster`], bound to one node for
/// its lifetime.
pub struct QueueChain<'a> {
    cluster: &'a QueueCluster,
    node: usize,
}

impl QueueChain<'_> {
    pub async fn fetch(
        &self,
        queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        self.cluster.fetch_on(Some(self.node), queue, timeout).await
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.cluster.get_on(Some(self.node), id).await
    }

    pub async fn ack(&self, id: &JobId) -> Result<(), QueueError> {
        self.cluster.ack_on(Some(self.node), id).await
    }

    /// Explicitly end the scope.
    pub fn unchain(self) {}
}
