//! Visibility extension for a single in-flight job.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use std::time::{Duration, Instant};

use crate::{
    error::ProcessError,
    job::{Job, JobId},
    queue::QueueCluster,
};

/// Keeps the queue cluster from redelivering a job while its handler runs,
/// by refreshing the retry timer once half the window has elapsed.
///
/// The watchdog lives exactly as long as one handler invocation: it stops
/// when told to over its control channel (or when the sender is dropped),
/// and it resolves early with [`ProcessError::VisibilityExtendFailed`] when
/// an extension is refused, at which point the job must be abandoned.
pub(crate) struct VisibilityWatchdog {
    queue: QueueCluster,
    job_id: JobId,
    retry: Duration,
    tick: Duration,
}

impl VisibilityWatchdog {
    pub fn new(queue: QueueCluster, job: &Job, tick: Duration) -> Self {
        Self {
            queue,
            job_id: job.id.clone(),
            retry: job.retry,
            tick,
        }
    }

    pub fn spawn(self, mut stop_rx: mpsc::Receiver<()>) -> JoinHandle<Result<(), ProcessError>> {
        tokio::spawn(async move {
            let threshold = (self.retry / 2).max(self.tick);
            let mut last_extended = Instant::now();
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => return Ok(()),
                    _ = tokio::time::sleep(self.tick) => {
                        if last_extended.elapsed() < threshold {
                            continue;
                        }
                        match self.queue.wait(&self.job_id).await {
                            Ok(()) => last_extended = Instant::now(),
                            Err(e) => {
                                tracing::warn!(job_id = %self.job_id, error = %e, "visibility extension failed");
                                return Err(ProcessError::VisibilityExtendFailed(self.job_id.clone()));
                            }
                        }
                    }
                }
            }
        })
    }
}
