//! Trait implemented by job handlers.

use async_trait::async_trait;

use crate::job::Job;

#[async_trait]
/// User-provided logic executed once per delivered job, behind the per-job
/// distributed lock.
pub trait Processor: Send + Sync + 'static {
    /// Run the job. Errors are logged; by default the job is still
    /// acknowledged so that a poison job cannot cause a redelivery storm
    /// (see [`ConsumerConfig::ack_on_handler_error`](crate::ConsumerConfig)).
    /// A processor that wants retries should re-enqueue the work itself.
    async fn process(&self, job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Whether the per-job lock should be refreshed for as long as
    /// [`process`](Self::process) runs. Opt-in: without renewal a handler
    /// outliving the lock TTL fails fast by losing the lock.
    fn should_auto_renew(&self, _job: &Job) -> bool {
        false
    }
}
