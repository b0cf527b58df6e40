//! The per-queue processing loop.
//!
//! One worker serves one queue: it fetches a delivery, routes it to the
//! registered processor, takes the per-job distributed lock, keeps the
//! job's visibility extended while the processor runs, acknowledges, and
//! releases the lock. Anything that goes wrong leaves the job to the
//! queue's redelivery machinery rather than crashing the loop; only a
//! processor panic propagates.

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tracing::instrument;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::{
    config::ConsumerConfig,
    error::ProcessError,
    handle::OwnedTaskHandle,
    job::{Job, QueueName},
    lock::{DistributedLock, LockCluster},
    queue::{QueueChain, QueueCluster},
    registry::ProcessorRegistry,
    watchdog::VisibilityWatchdog,
};

/// Counts a worker as active for as long as its loop runs.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct QueueWorker {
    queue: QueueCluster,
    locks: LockCluster,
    registry: Arc<ProcessorRegistry>,
    config: ConsumerConfig,
    instance_id: uuid::Uuid,
}

impl QueueWorker {
    pub fn new(
        queue: QueueCluster,
        locks: LockCluster,
        registry: Arc<ProcessorRegistry>,
        config: ConsumerConfig,
        instance_id: uuid::Uuid,
    ) -> Self {
        Self {
            queue,
            locks,
            registry,
            config,
            instance_id,
        }
    }

    pub fn spawn(
        self,
        queue_name: QueueName,
        shutdown_rx: broadcast::Receiver<()>,
        active: Arc<AtomicUsize>,
    ) -> OwnedTaskHandle {
        OwnedTaskHandle::new(tokio::spawn(self.run(queue_name, shutdown_rx, active)))
    }

    async fn run(
        self,
        queue_name: QueueName,
        mut shutdown_rx: broadcast::Receiver<()>,
        active: Arc<AtomicUsize>,
    ) {
        let _guard = ActiveGuard::new(active);
        let mut failures: u32 = 0;
        loop {
            match shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }
            let chain = self.queue.chain();
            let stop = tokio::select! {
                biased;

                _ = shutdown_rx.recv() => true,
                fetched = chain.fetch(&queue_name, self.config.fetch_timeout) => {
                    match fetched {
                        Ok(Some(job)) => {
                            failures = 0;
                            match self.process_one(&chain, &queue_name, job).await {
                                Ok(()) => {}
                                Err(e) if e.is_job_scoped() => {
                                    tracing::warn!(queue = %queue_name, error = %e, "job abandoned");
                                }
                                Err(e) => {
                                    tracing::error!(queue = %queue_name, error = %e, "job processing error");
                                }
                            }
                        }
                        Ok(None) => failures = 0,
                        Err(e) => {
                            failures += 1;
                            tracing::error!(queue = %queue_name, error = %e, failures, "queue fetch failed");
                            tokio::time::sleep(Duration::from_millis(50 << failures.min(6))).await;
                        }
                    }
                    false
                }
            };
            chain.unchain();
            if stop {
                break;
            }
        }
    }

    #[instrument(
        name = "worker.process_job",
        skip_all,
        fields(worker_id = %self.instance_id, queue = %queue_name, job_id = %job.id)
    )]
    async fn process_one(
        &self,
        chain: &QueueChain<'_>,
        queue_name: &QueueName,
        job: Job,
    ) -> Result<(), ProcessError> {
        let Some(processor) = self.registry.lookup(queue_name) else {
            tracing::debug!(queue = %queue_name, "no processor registered, leaving job for redelivery");
            return Ok(());
        };
        // The delivery only carries the body; the retry window comes from
        // the node that handed the job out.
        let Some(job) = chain.get(&job.id).await? else {
            return Ok(());
        };

        let mut lock = DistributedLock::new(self.locks.clone(), job.id.as_str())
            .with_ttl(self.config.lock_ttl);
        if !lock.acquire(processor.should_auto_renew(&job)).await {
            // Another consumer holds the job. No ack: redelivery is gated
            // on the retry window.
            return Ok(());
        }
        let mut lost_rx = lock.subscribe_lost();

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let watchdog = VisibilityWatchdog::new(self.queue.clone(), &job, self.config.watchdog_tick)
            .spawn(stop_rx);
        tokio::pin!(watchdog);

        let handler = AssertUnwindSafe(processor.process(&job)).catch_unwind();
        tokio::pin!(handler);

        let handler_result = tokio::select! {
            result = &mut handler => result,
            watchdog_exit = &mut watchdog => {
                let error = match watchdog_exit {
                    Ok(Err(e)) => e,
                    _ => ProcessError::LockLost(job.id.clone()),
                };
                lock.release().await;
                return Err(error);
            }
            _ = async {
                while !*lost_rx.borrow_and_update() {
                    if lost_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                lock.release().await;
                return Err(ProcessError::LockLost(job.id.clone()));
            }
        };

        let _ = stop_tx.send(()).await;
        let _ = (&mut watchdog).await;

        let should_ack = match handler_result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job.id, error = %e, "processor returned error");
                self.config.ack_on_handler_error
            }
            Err(panic) => {
                lock.release().await;
                std::panic::resume_unwind(panic);
            }
        };

        if should_ack
            && let Err(e) = chain.ack(&job.id).await
        {
            // Non-fatal: the job will be redelivered once its retry window
            // expires, so a non-idempotent processor may run again.
            tracing::warn!(job_id = %job.id, error = %e, "ack failed, job may be redelivered");
        }

        // Released regardless of the ack outcome.
        if !lock.release().await {
            tracing::warn!(job_id = %job.id, "lock release not acknowledged, segments left to expire");
        }
        Ok(())
    }
}
