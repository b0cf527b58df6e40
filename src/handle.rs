use tokio::task::{JoinError, JoinHandle};

/// Owns a spawned task for its whole lifetime. Dropping the handle aborts
/// the task; `join` waits for a natural exit instead, for tasks that
/// terminate on their own once signalled.
pub(crate) struct OwnedTaskHandle(Option<JoinHandle<()>>);

impl OwnedTaskHandle {
    pub fn new(inner: JoinHandle<()>) -> Self {
        Self(Some(inner))
    }

    pub async fn join(mut self) -> Result<(), JoinError> {
        let handle = self.0.take().expect("Only consumed once");
        handle.await
    }

    #[allow(dead_code)]
    pub async fn stop(mut self) {
        let handle = self.0.take().expect("Only consumed once");
        handle.abort();
        let _ = handle.await;
    }
}

impl Drop for OwnedTaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}
