//! Cancellable background tasks (health checks, config reloads).

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a spawned periodic loop.
///
/// The loop receives a shutdown receiver and must exit once it observes a change or the
/// sender closing. [`shutdown`](Self::shutdown) signals and joins; dropping the handle signals
/// without joining.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `run` on the current tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run(rx));
        tracing::info!(task = name, "background task started");
        Self { name, shutdown, handle: Some(handle) }
    }

    /// Task name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(task = self.name, error = %e, "background task ended abnormally");
            }
        }
        tracing::info!(task = self.name, "background task stopped");
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
