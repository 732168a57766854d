//! The instance registry: fingerprint -> worker handle
//!
//! Invariants:
//! - at most one live handle exists per fingerprint at any instant;
//! - replacing an entry retires the previous handle inside the same critical
//!   section that installs the new one;
//! - every engine worker ever constructed receives exactly one `stop()`.
//!
//! The map is sharded (`DashMap`); the per-fingerprint entry lock is the
//! critical section for the check-then-act sequences of add and remove.
//! Operations on different fingerprints proceed fully in parallel. List and
//! describe are weakly-consistent snapshots taken in a single traversal.

use crate::document::{self, PortRange};
use crate::engine::{Engine, EngineError};
use crate::fingerprint::Fingerprint;
use crate::lifecycle;
use crate::worker::WorkerHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a successful add
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// No live worker existed for this fingerprint
    Registered,
    /// A live worker with the same fingerprint was retired and replaced
    Replaced,
}

/// Outcome of a remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// No entry for this fingerprint; a no-op, not an error
    NotFound,
}

/// Concurrent map from configuration fingerprint to running worker.
///
/// Constructed explicitly and injected into the control layer; tests build as
/// many independent registries as they need.
pub struct Registry {
    engine: Arc<dyn Engine>,
    workers: DashMap<Fingerprint, Arc<WorkerHandle>>,
}

impl Registry {
    /// Create a new registry backed by the given engine.
    ///
    /// Returns `Arc<Self>` because the registry is shared across the control
    /// layer and the start tasks the lifecycle coordinator spawns.
    pub fn new(engine: Arc<dyn Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            workers: DashMap::new(),
        })
    }

    /// Register a worker for a configuration document.
    ///
    /// Constructs the engine worker first: a construction failure surfaces to
    /// the caller with the registry untouched. The replace-then-insert runs
    /// under the fingerprint's entry lock, so no concurrent add or remove for
    /// the same fingerprint interleaves with it. The previous worker (if any)
    /// has its engine released before the successor's start is scheduled, so
    /// the successor can reuse its ports. Returns as soon as the new handle is
    /// registered in `Starting` state; start completion is asynchronous.
    pub async fn add(self: &Arc<Self>, document: &str) -> Result<AddOutcome, EngineError> {
        let fingerprint = Fingerprint::from_document(document);
        let port_ranges = document::extract_proxy_port_ranges(fingerprint.document());

        let engine_worker = self.engine.create(fingerprint.document()).map_err(|e| {
            warn!(fingerprint = %fingerprint, error = %e, "engine rejected configuration");
            e
        })?;

        let handle = Arc::new(WorkerHandle::new(
            fingerprint.clone(),
            engine_worker,
            port_ranges,
        ));

        let replaced = match self.workers.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(Arc::clone(&handle));
                if previous.is_live() {
                    // Retire inside the critical section so the
                    // one-live-handle invariant holds at every instant.
                    previous.retire();
                    Some(previous)
                } else {
                    // Failed residue awaiting retraction; its own failure
                    // path releases the engine worker.
                    None
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&handle));
                None
            }
        };

        let outcome = if let Some(previous) = replaced {
            info!(fingerprint = %fingerprint, "already running, replacing previous instance");
            previous.release().await;
            AddOutcome::Replaced
        } else {
            AddOutcome::Registered
        };

        if let Some(ranges) = handle.port_ranges() {
            info!(fingerprint = %fingerprint, ports = ?ranges, "registered proxy instance");
        } else {
            info!(fingerprint = %fingerprint, "registered proxy instance");
        }

        let _ = lifecycle::spawn_start(Arc::clone(self), handle);

        Ok(outcome)
    }

    /// Stop and delete the worker registered for a document, if any.
    pub async fn remove(&self, document: &str) -> RemoveOutcome {
        let fingerprint = Fingerprint::from_document(document);

        match self.workers.remove(&fingerprint) {
            Some((_, handle)) => {
                handle.stop().await;
                if let Some(ranges) = handle.port_ranges() {
                    info!(fingerprint = %fingerprint, ports = ?ranges, "removed proxy instance");
                } else {
                    info!(fingerprint = %fingerprint, "removed proxy instance");
                }
                RemoveOutcome::Removed
            }
            None => {
                debug!(fingerprint = %fingerprint, "no matching instance to remove");
                RemoveOutcome::NotFound
            }
        }
    }

    /// Remove an entry only if it still holds this exact handle.
    ///
    /// Used by the lifecycle coordinator after a start failure. Keyed by
    /// handle identity: if the fingerprint has since been replaced or removed,
    /// this is a no-op and the newer handle is untouched.
    pub(crate) fn retract(&self, handle: &WorkerHandle) -> bool {
        self.workers
            .remove_if(handle.fingerprint(), |_, current| current.id() == handle.id())
            .is_some()
    }

    /// Snapshot of all live fingerprints (weakly consistent).
    pub fn list(&self) -> Vec<Fingerprint> {
        self.workers
            .iter()
            .filter(|entry| entry.value().is_live())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot of the diagnostic port ranges of live workers.
    ///
    /// Workers whose configuration exposed no metadata are silently skipped.
    pub fn describe(&self) -> Vec<PortRange> {
        self.workers
            .iter()
            .filter(|entry| entry.value().is_live())
            .filter_map(|entry| entry.value().port_ranges().map(|r| r.to_vec()))
            .flatten()
            .collect()
    }

    /// Stop every worker and clear the map (process shutdown).
    pub async fn stop_all(&self) {
        let fingerprints: Vec<Fingerprint> =
            self.workers.iter().map(|entry| entry.key().clone()).collect();

        for fingerprint in fingerprints {
            if let Some((_, handle)) = self.workers.remove(&fingerprint) {
                handle.stop().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineWorker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Engine whose workers succeed or fail on demand, counting constructions
    /// and stops so tests can assert exactly-once release.
    struct ScriptedEngine {
        reject_create: std::sync::atomic::AtomicBool,
        fail_start: bool,
        fail_first_start_only: bool,
        start_delay: Duration,
        constructed: AtomicUsize,
        stops: Arc<AtomicUsize>,
    }

    impl ScriptedEngine {
        fn ok() -> Self {
            Self::with(false, false, Duration::ZERO)
        }

        fn with(reject_create: bool, fail_start: bool, start_delay: Duration) -> Self {
            Self {
                reject_create: std::sync::atomic::AtomicBool::new(reject_create),
                fail_start,
                fail_first_start_only: false,
                start_delay,
                constructed: AtomicUsize::new(0),
                stops: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn set_rejecting(&self, rejecting: bool) {
            self.reject_create.store(rejecting, Ordering::SeqCst);
        }

        fn first_start_fails(start_delay: Duration) -> Self {
            Self {
                fail_first_start_only: true,
                ..Self::with(false, false, start_delay)
            }
        }
    }

    impl Engine for ScriptedEngine {
        fn create(&self, _document: &str) -> Result<Arc<dyn EngineWorker>, EngineError> {
            if self.reject_create.load(Ordering::SeqCst) {
                return Err(EngineError::InvalidConfig("rejected by test".to_string()));
            }
            let index = self.constructed.fetch_add(1, Ordering::SeqCst);
            let fail_start = self.fail_start || (self.fail_first_start_only && index == 0);
            Ok(Arc::new(ScriptedWorker {
                fail_start,
                start_delay: self.start_delay,
                stops: Arc::clone(&self.stops),
            }))
        }
    }

    struct ScriptedWorker {
        fail_start: bool,
        start_delay: Duration,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EngineWorker for ScriptedWorker {
        async fn start(&self) -> Result<(), EngineError> {
            if !self.start_delay.is_zero() {
                tokio::time::sleep(self.start_delay).await;
            }
            if self.fail_start {
                Err(EngineError::Internal("start failed by test".to_string()))
            } else {
                Ok(())
            }
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    const DOC: &str = r#"{"inbounds":[{"tag":"proxy","port":10808}]}"#;

    #[tokio::test]
    async fn test_add_then_list_contains_fingerprint() {
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let outcome = registry.add(DOC).await.unwrap();
        assert_eq!(outcome, AddOutcome::Registered);
        assert!(registry.list().contains(&Fingerprint::from_document(DOC)));
    }

    #[tokio::test]
    async fn test_whitespace_variant_is_a_duplicate() {
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        registry.add(DOC).await.unwrap();
        let padded = format!("  {}\n", DOC);
        let outcome = registry.add(&padded).await.unwrap();
        assert_eq!(outcome, AddOutcome::Replaced);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_add_replaces_and_stops_previous_once() {
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        registry.add(DOC).await.unwrap();
        let outcome = registry.add(DOC).await.unwrap();

        assert_eq!(outcome, AddOutcome::Replaced);
        assert_eq!(registry.list().len(), 1);
        assert_eq!(engine.constructed.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_nonexistent_is_not_found() {
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        assert_eq!(registry.remove(DOC).await, RemoveOutcome::NotFound);
        assert!(registry.list().is_empty());
        assert_eq!(engine.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_stops_worker_exactly_once() {
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        registry.add(DOC).await.unwrap();
        assert_eq!(registry.remove(DOC).await, RemoveOutcome::Removed);
        assert!(registry.list().is_empty());
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);

        // Second remove observes the post-state.
        assert_eq!(registry.remove(DOC).await, RemoveOutcome::NotFound);
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_failure_leaves_registry_unchanged() {
        let engine = Arc::new(ScriptedEngine::with(true, false, Duration::ZERO));
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let err = registry.add(DOC).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert!(registry.list().is_empty());
        assert!(!registry.list().contains(&Fingerprint::from_document(DOC)));
    }

    #[tokio::test]
    async fn test_create_failure_keeps_existing_worker() {
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);
        registry.add(DOC).await.unwrap();

        engine.set_rejecting(true);
        registry.add(DOC).await.unwrap_err();

        // The running worker was neither replaced nor stopped.
        assert_eq!(registry.list().len(), 1);
        assert_eq!(engine.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_failure_retracts_entry() {
        let engine = Arc::new(ScriptedEngine::with(false, true, Duration::ZERO));
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        registry.add(DOC).await.unwrap();

        let registry_view = Arc::clone(&registry);
        assert!(
            wait_for(|| registry_view.list().is_empty(), Duration::from_secs(2)).await,
            "entry should be retracted after start failure"
        );
        // The failed worker's resources were released.
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_start_failure_does_not_remove_successor() {
        // First worker fails slowly; before its failure lands, a replacement
        // takes the fingerprint. The stale start task must not retract the
        // successor's entry.
        let engine = Arc::new(ScriptedEngine::first_start_fails(Duration::from_millis(200)));
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        registry.add(DOC).await.unwrap();
        let outcome = registry.add(DOC).await.unwrap();
        assert_eq!(outcome, AddOutcome::Replaced);

        // Give the first start task time to fail and attempt retraction.
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(registry.list().len(), 1, "successor must remain registered");
        assert_eq!(
            engine.stops.load(Ordering::SeqCst),
            1,
            "only the replaced worker is released"
        );
    }

    #[tokio::test]
    async fn test_concurrent_adds_leave_one_live_worker_and_no_leak() {
        const N: usize = 16;
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let mut tasks = Vec::new();
        for _ in 0..N {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.add(DOC).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.list().len(), 1);
        let constructed = engine.constructed.load(Ordering::SeqCst);
        assert_eq!(constructed, N);
        assert_eq!(engine.stops.load(Ordering::SeqCst), N - 1);

        // Removing the survivor accounts for every constructed worker.
        registry.remove(DOC).await;
        assert_eq!(engine.stops.load(Ordering::SeqCst), N);
    }

    #[tokio::test]
    async fn test_interleaved_add_remove_never_leaks() {
        const ROUNDS: usize = 32;
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let adder = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let _ = registry.add(DOC).await;
                }
            })
        };
        let remover = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let _ = registry.remove(DOC).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        adder.await.unwrap();
        remover.await.unwrap();

        assert!(registry.list().len() <= 1);
        registry.stop_all().await;

        let constructed = engine.constructed.load(Ordering::SeqCst);
        let engine_view = Arc::clone(&engine);
        assert!(
            wait_for(
                move || engine_view.stops.load(Ordering::SeqCst) == constructed,
                Duration::from_secs(2)
            )
            .await,
            "every constructed worker must be stopped exactly once"
        );
    }

    #[tokio::test]
    async fn test_describe_is_subset_of_list() {
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let with_meta = r#"{"inbounds":[{"tag":"proxy","port":"5000-5004"}]}"#;
        let without_meta = r#"{"inbounds":[{"tag":"api","port":6000}]}"#;
        registry.add(with_meta).await.unwrap();
        registry.add(without_meta).await.unwrap();

        assert_eq!(registry.list().len(), 2);
        let ranges = registry.describe();
        assert_eq!(ranges, vec![PortRange { from: 5000, to: 5004 }]);

        registry.remove(with_meta).await;
        assert!(registry.describe().is_empty());
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_are_independent() {
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        let doc_a = r#"{"inbounds":[{"tag":"proxy","port":7000}]}"#;
        let doc_b = r#"{"inbounds":[{"tag":"proxy","port":7001}]}"#;
        registry.add(doc_a).await.unwrap();
        registry.add(doc_b).await.unwrap();
        assert_eq!(registry.list().len(), 2);

        registry.remove(doc_a).await;
        assert_eq!(registry.list(), vec![Fingerprint::from_document(doc_b)]);
    }

    #[tokio::test]
    async fn test_stop_all_drains_registry() {
        let engine = Arc::new(ScriptedEngine::ok());
        let registry = Registry::new(Arc::clone(&engine) as Arc<dyn Engine>);

        registry.add(r#"{"inbounds":[{"tag":"proxy","port":1}]}"#).await.unwrap();
        registry.add(r#"{"inbounds":[{"tag":"proxy","port":2}]}"#).await.unwrap();

        registry.stop_all().await;
        assert!(registry.list().is_empty());
        assert_eq!(engine.stops.load(Ordering::SeqCst), 2);
    }
}
