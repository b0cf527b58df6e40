//! Error types surfaced by the queue client, the lock quorum and the
//! consumer lifecycle.

use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("QueueError - Redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("QueueError - NoNodesConfigured")]
    NoNodesConfigured,
    #[error("QueueError - MalformedReply: {0}")]
    MalformedReply(String),
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("LockError - Redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("LockError - NoMembersConfigured")]
    NoMembersConfigured,
}

/// Failures observed while running the consumer side. The two lock-related
/// variants are expected control flow for a single job (the job is skipped
/// and left for redelivery); everything else indicates an infrastructure
/// problem.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("ProcessError - Queue: {0}")]
    Queue(#[from] QueueError),
    #[error("ProcessError - Lock: {0}")]
    Lock(#[from] LockError),
    #[error("ProcessError - lock lost while processing job {0}")]
    LockLost(JobId),
    #[error("ProcessError - visibility extension failed for job {0}")]
    VisibilityExtendFailed(JobId),
    #[error("ProcessError - workers did not shut down cleanly: {0}")]
    Shutdown(String),
}

impl ProcessError {
    /// Whether this error only affects the current job, as opposed to the
    /// worker or its connections.
    pub fn is_job_scoped(&self) -> bool {
        matches!(
            self,
            ProcessError::LockLost(_) | ProcessError::VisibilityExtendFailed(_)
        )
    }
}
