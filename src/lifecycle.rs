//! Asynchronous start of newly registered workers
//!
//! Add returns to its caller as soon as the handle is registered in `Starting`
//! state; the actual engine start runs here, fire-and-forget. A failed start
//! retracts the registry entry (by handle identity) and releases the engine
//! worker; the original caller is not notified and polls the list endpoint if
//! it needs confirmation. There is no cancellation or timeout of an in-flight
//! start: a start that never returns leaves the handle `Starting`.

use crate::registry::Registry;
use crate::worker::WorkerHandle;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Drive the engine start of a freshly inserted handle on its own task.
///
/// Returns the task handle; the registry discards it today, but the seam is
/// where a start timeout or cancellation would hook in.
pub(crate) fn spawn_start(
    registry: Arc<Registry>,
    handle: Arc<WorkerHandle>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match handle.engine_worker().start().await {
            Ok(()) => {
                if handle.mark_running() {
                    info!(fingerprint = %handle.fingerprint(), "worker started");
                } else {
                    // Replaced or removed while starting; whoever retired the
                    // handle owns its release.
                    debug!(
                        fingerprint = %handle.fingerprint(),
                        state = %handle.state(),
                        "start completed for a retired worker"
                    );
                }
            }
            Err(e) => {
                if handle.mark_failed() {
                    error!(
                        fingerprint = %handle.fingerprint(),
                        error = %e,
                        "worker failed to start, retracting"
                    );
                    registry.retract(&handle);
                    handle.release().await;
                    if let Some(ranges) = handle.port_ranges() {
                        info!(
                            fingerprint = %handle.fingerprint(),
                            ports = ?ranges,
                            "released ports of failed worker"
                        );
                    }
                } else {
                    debug!(
                        fingerprint = %handle.fingerprint(),
                        error = %e,
                        "start failure for a retired worker, ignoring"
                    );
                }
            }
        }
    })
}
