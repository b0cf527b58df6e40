//! `relayq` is an async client for a replicated delayed-job queue paired
//! with an independent in-memory lock quorum. Producers enqueue jobs for
//! delivery at a chosen time; consumers fetch, lock, execute and
//! acknowledge them with at-most-once *successful* execution per job, even
//! when many consumer processes race on the same delivery.
//!
//! ## Highlights
//! - Per-job distributed mutual exclusion over a quorum of lock members,
//!   with a drift-adjusted validity window and opt-in auto-renewal.
//! - A visibility watchdog that keeps long-running jobs from being
//!   redelivered while their handler makes progress.
//! - Worker loops with graceful shutdown: an in-flight handler is never
//!   interrupted by [`Consumer::stop`].
//! - All durable state lives in the external clusters; the consumer itself
//!   is stateless across restarts.
//!
//! ## Core Concepts
//! - **Producer** – [`Producer`] connects to the queue cluster and adds,
//!   inspects and deletes jobs.
//! - **Consumer** – [`Consumer`] additionally connects to the lock cluster,
//!   owns processor registration and runs one worker loop per queue.
//! - **Processor** – [`Processor`] performs the work and decides, per job,
//!   whether its lock should auto-renew.
//! - **Distributed lock** – [`DistributedLock`] is also usable standalone
//!   for mutual exclusion on arbitrary keys.
//!
//! ## Example
//!
//! ```ignore
//! use async_trait::async_trait;
//! use relayq::{
//!     AddOptions, Consumer, ConsumerConfig, Job, LockClusterConfig, Processor,
//!     QueueClusterConfig,
//! };
//!
//! struct MailProcessor;
//!
//! #[async_trait]
//! impl Processor for MailProcessor {
//!     async fn process(&self, job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         println!("delivering {}", job.body);
//!         Ok(())
//!     }
//!
//!     fn should_auto_renew(&self, _job: &Job) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let consumer = Consumer::connect(
//!         QueueClusterConfig::new(["127.0.0.1:7711"]),
//!         LockClusterConfig::new(["127.0.0.1:7777", "127.0.0.1:7778", "127.0.0.1:7779"]),
//!         ConsumerConfig::default(),
//!     )
//!     .await?;
//!
//!     consumer.register("mail", MailProcessor);
//!     consumer.start_processing("mail");
//!
//!     // Producers can run in any process:
//!     consumer
//!         .add_job(&"mail".into(), "hello", chrono::Utc::now(), &AddOptions::default())
//!         .await?;
//!
//!     // ... later
//!     consumer.close().await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![cfg_attr(feature = "fail-on-warnings", deny(clippy::all))]
#![forbid(unsafe_code)]

mod config;
mod handle;
mod job;
mod lock;
mod processor;
mod queue;
mod registry;
mod watchdog;
mod worker;

pub mod error;

use chrono::{DateTime, Utc};
use tracing::instrument;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use config::*;
pub use job::{AddOptions, Job, JobId, QueueName};
pub use lock::{DistributedLock, LockCluster};
pub use processor::Processor;
pub use queue::{QueueChain, QueueCluster};

use error::*;
use registry::ProcessorRegistry;
use worker::QueueWorker;

/// Producer-side handle: adds, inspects and deletes jobs on the queue
/// cluster.
pub struct Producer {
    queue: QueueCluster,
}

impl Producer {
    /// Connect to the queue cluster.
    pub async fn connect(queue_config: QueueClusterConfig) -> Result<Self, QueueError> {
        let queue = QueueCluster::connect(&queue_config).await?;
        Ok(Self { queue })
    }

    /// Enqueue a job for delivery at `eta`.
    pub async fn add_job(
        &self,
        queue: &QueueName,
        body: &str,
        eta: DateTime<Utc>,
        options: &AddOptions,
    ) -> Result<Job, QueueError> {
        self.queue.add(queue, body, eta, options).await
    }

    /// Look a job up by id. `None` once the job is acknowledged, deleted or
    /// expired.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.queue.get(id).await
    }

    /// Remove a job from the queue cluster before it is delivered.
    pub async fn delete_job(&self, id: &JobId) -> Result<(), QueueError> {
        self.queue.ack(id).await
    }

    /// Drop the cluster connections.
    pub async fn close(self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Consumer-side handle: registers processors and runs one worker loop per
/// queue, each gated on the per-job distributed lock.
pub struct Consumer {
    queue: QueueCluster,
    locks: LockCluster,
    registry: Arc<ProcessorRegistry>,
    config: ConsumerConfig,
    instance_id: uuid::Uuid,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    workers: Mutex<Vec<handle::OwnedTaskHandle>>,
    active: Arc<AtomicUsize>,
}

impl Consumer {
    /// Connect to both clusters.
    pub async fn connect(
        queue_config: QueueClusterConfig,
        lock_config: LockClusterConfig,
        config: ConsumerConfig,
    ) -> Result<Self, ProcessError> {
        let queue = QueueCluster::connect(&queue_config).await?;
        let locks = LockCluster::connect(&lock_config).await?;
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        Ok(Self {
            queue,
            locks,
            registry: Arc::new(ProcessorRegistry::new()),
            config,
            instance_id: uuid::Uuid::now_v7(),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Register a [`Processor`] for a queue. Last writer wins; takes effect
    /// on the next delivery even while the queue is already being worked.
    pub fn register(&self, queue: impl Into<QueueName>, processor: impl Processor) {
        self.registry.register(queue.into(), Arc::new(processor));
    }

    /// Begin a worker loop for `queue`. May be called for any number of
    /// queues; each loop runs until [`stop`](Self::stop) or
    /// [`close`](Self::close).
    #[instrument(name = "consumer.start_processing", skip(self), fields(consumer_id = %self.instance_id))]
    pub fn start_processing(&self, queue: impl Into<QueueName> + std::fmt::Debug) {
        let worker = QueueWorker::new(
            self.queue.clone(),
            self.locks.clone(),
            Arc::clone(&self.registry),
            self.config.clone(),
            self.instance_id,
        );
        let handle = worker.spawn(
            queue.into(),
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.active),
        );
        self.workers
            .lock()
            .expect("Couldn't lock worker set")
            .push(handle);
    }

    /// Whether at least one worker loop is currently running.
    pub fn is_processing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Signal every worker loop to stop. Fire-and-forget: loops observe the
    /// signal at the top of their next iteration, within at most one
    /// blocking-fetch timeout. An in-flight handler finishes first.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Stop processing, wait for the workers to wind down, and drop both
    /// cluster connections.
    #[instrument(name = "consumer.close", skip(self), fields(consumer_id = %self.instance_id), err)]
    pub async fn close(self) -> Result<(), ProcessError> {
        self.stop();
        let workers = self
            .workers
            .into_inner()
            .expect("Couldn't lock worker set");
        let grace = self.config.fetch_timeout + std::time::Duration::from_secs(1);
        let mut failures = Vec::new();
        for worker in workers {
            match tokio::time::timeout(grace, worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(_) => failures.push("worker did not stop within grace period".to_string()),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProcessError::Shutdown(failures.join("; ")))
        }
    }

    /// Producer passthrough: enqueue a job for delivery at `eta`.
    pub async fn add_job(
        &self,
        queue: &QueueName,
        body: &str,
        eta: DateTime<Utc>,
        options: &AddOptions,
    ) -> Result<Job, QueueError> {
        self.queue.add(queue, body, eta, options).await
    }

    /// Producer passthrough: look a job up by id.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.queue.get(id).await
    }

    /// Producer passthrough: remove a job before it is delivered.
    pub async fn delete_job(&self, id: &JobId) -> Result<(), QueueError> {
        self.queue.ack(id).await
    }
}
