use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// Task handle for spawned channel and session tasks.
pub type TaskHandle<T> = JoinHandle<T>;

pub fn spawn_task<F>(future: F) -> TaskHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}

/// Session-wide cancellation flag. Once raised it stays raised.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is raised.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            // The sender lives as long as any clone of the flag
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        }
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Join a task, aborting it when it overruns `limit`. Returns `false` if the
/// task had to be aborted.
pub async fn join_with_timeout<T>(name: &str, handle: TaskHandle<T>, limit: Duration) -> bool {
    let abort = handle.abort_handle();
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) if e.is_cancelled() => true,
        Ok(Err(e)) => {
            warn!(task = name, "task panicked: {e}");
            true
        }
        Err(_) => {
            warn!(task = name, "task did not finish within {:?}, aborting", limit);
            abort.abort();
            false
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
