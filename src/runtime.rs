//! The bridge's own multi-threaded Tokio runtime, built on first use and
//! never torn down.

use spice_client::SpiceError;
use std::future::Future;
use std::sync::{mpsc, Mutex, OnceLock};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static BUILDING: Mutex<()> = Mutex::new(());

fn runtime() -> Result<&'static Runtime, SpiceError> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    // Only one thread builds; a runtime must never be dropped from async code
    let _building = BUILDING.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let rt = Builder::new_multi_thread()
        .enable_all()
        .thread_name("spice-bridge")
        .build()?;
    debug!("bridge runtime started");
    Ok(RUNTIME.get_or_init(|| rt))
}

/// Drive `fut` to completion from synchronous code.
///
/// Callers already inside some Tokio runtime cannot nest `block_on`, so the
/// future is spawned on the bridge runtime and the result waited for on a
/// plain channel instead.
pub fn run<F>(fut: F) -> Result<F::Output, SpiceError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let rt = runtime()?;
    if tokio::runtime::Handle::try_current().is_err() {
        return Ok(rt.block_on(fut));
    }

    let (tx, rx) = mpsc::channel();
    rt.spawn(async move {
        let _ = tx.send(fut.await);
    });
    rx.recv().map_err(|_| SpiceError::Cancelled)
}
