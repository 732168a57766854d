//! Worker handles and their lifecycle state machine
//!
//! A handle owns exactly one engine worker. Valid transitions:
//! `Starting -> Running | Failed`, `Starting | Running -> Stopped`. `Failed`
//! and `Stopped` are terminal; a fingerprint that reaches either must be
//! re-added through a fresh construct to run again.

use crate::document::PortRange;
use crate::engine::EngineWorker;
use crate::fingerprint::Fingerprint;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle state of a worker handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Engine worker constructed, asynchronous start in flight
    Starting,
    /// Start completed, worker is serving
    Running,
    /// Asynchronous start failed; the registry entry has been retracted
    Failed,
    /// Explicitly stopped via remove, replace or shutdown
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Failed => write!(f, "failed"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Registry-side tracking object for one engine worker.
///
/// The handle carries a unique id so retraction after a start failure can be
/// keyed by identity rather than fingerprint: a newer handle that has since
/// taken the same fingerprint must never be removed by a stale start task.
pub struct WorkerHandle {
    id: Uuid,
    fingerprint: Fingerprint,
    engine_worker: Arc<dyn EngineWorker>,
    state: Mutex<WorkerState>,
    released: AtomicBool,
    port_ranges: Option<Vec<PortRange>>,
}

impl WorkerHandle {
    pub fn new(
        fingerprint: Fingerprint,
        engine_worker: Arc<dyn EngineWorker>,
        port_ranges: Option<Vec<PortRange>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            fingerprint,
            engine_worker,
            state: Mutex::new(WorkerState::Starting),
            released: AtomicBool::new(false),
            port_ranges,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn engine_worker(&self) -> &Arc<dyn EngineWorker> {
        &self.engine_worker
    }

    /// Diagnostic port ranges extracted from the configuration, if any.
    pub fn port_ranges(&self) -> Option<&[PortRange]> {
        self.port_ranges.as_deref()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Whether the handle counts as live (`Starting` or `Running`).
    pub fn is_live(&self) -> bool {
        matches!(self.state(), WorkerState::Starting | WorkerState::Running)
    }

    /// `Starting -> Running`. Returns false if the handle was retired or
    /// failed in the meantime.
    pub fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if *state == WorkerState::Starting {
            *state = WorkerState::Running;
            true
        } else {
            false
        }
    }

    /// `Starting -> Failed`. Returns false unless the handle is still
    /// starting; a handle replaced mid-start stays `Stopped`.
    pub fn mark_failed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == WorkerState::Starting {
            *state = WorkerState::Failed;
            true
        } else {
            false
        }
    }

    /// Synchronously retire a live handle to `Stopped`.
    ///
    /// Called inside the registry's critical section so that at no instant do
    /// two live handles exist for one fingerprint. `Failed` stays `Failed`.
    pub fn retire(&self) {
        let mut state = self.state.lock();
        if matches!(*state, WorkerState::Starting | WorkerState::Running) {
            *state = WorkerState::Stopped;
        }
    }

    /// Invoke the engine worker's `stop()` exactly once across all callers.
    pub async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.engine_worker.stop().await;
        }
    }

    /// Retire and release: the full teardown used by remove and shutdown.
    pub async fn stop(&self) {
        self.retire();
        self.release().await;
    }
}
