//! The proxy engine seam and the built-in TCP listener engine
//!
//! The registry treats the proxy engine as an opaque collaborator: `create`
//! turns a raw configuration document into a worker, `start` brings the worker
//! up (may block, may fail) and `stop` releases everything it holds. The
//! built-in [`ListenerEngine`] implements the seam with plain TCP listeners so
//! the service runs self-contained; a full protocol engine plugs in behind the
//! same traits.

use crate::document::{self, PortRange};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors surfaced by an engine while constructing or starting a worker
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("engine failure: {0}")]
    Internal(String),
}

/// Factory for engine workers.
///
/// `create` parses and validates the document; it must be quick and must not
/// acquire listening sockets. Resource acquisition happens in
/// [`EngineWorker::start`].
pub trait Engine: Send + Sync {
    fn create(&self, document: &str) -> Result<Arc<dyn EngineWorker>, EngineError>;
}

/// One running instance of the engine, bound to a single configuration.
#[async_trait]
pub trait EngineWorker: Send + Sync {
    /// Bring the worker up. Idempotent-once: repeated calls after a
    /// successful start are no-ops. May block for non-trivial time and may
    /// fail (e.g. a port already in use).
    async fn start(&self) -> Result<(), EngineError>;

    /// Release every resource the worker holds. Safe to call whether or not
    /// `start` ever completed; callers guarantee it is invoked exactly once.
    async fn stop(&self);
}

/// Forwarding target for accepted connections
#[derive(Debug, Clone)]
struct ForwardTarget {
    address: String,
    port: u16,
}

/// One inbound of a worker: a port range plus an optional forward target
#[derive(Debug, Clone)]
struct InboundSpec {
    ports: PortRange,
    forward: Option<ForwardTarget>,
}

/// Built-in engine: binds each inbound's port range and relays accepted
/// connections to the inbound's `settings.address:port` target, or accepts and
/// closes them when no target is configured.
pub struct ListenerEngine {
    bind_host: IpAddr,
}

impl ListenerEngine {
    pub fn new() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Bind listeners on a specific host (loopback in tests).
    pub fn bound_to(bind_host: IpAddr) -> Self {
        Self { bind_host }
    }
}

impl Default for ListenerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for ListenerEngine {
    fn create(&self, raw: &str) -> Result<Arc<dyn EngineWorker>, EngineError> {
        let parsed =
            document::parse(raw).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        if parsed.inbounds.is_empty() {
            return Err(EngineError::InvalidConfig(
                "document declares no inbounds".to_string(),
            ));
        }

        let mut inbounds = Vec::with_capacity(parsed.inbounds.len());
        for inbound in &parsed.inbounds {
            let ports = inbound.port_range().ok_or_else(|| {
                EngineError::InvalidConfig(format!(
                    "inbound {:?} has a missing or malformed port",
                    inbound.tag.as_deref().unwrap_or("<untagged>")
                ))
            })?;

            let forward = match (&inbound.settings.address, inbound.settings.port) {
                (Some(address), Some(port)) => Some(ForwardTarget {
                    address: address.clone(),
                    port,
                }),
                _ => None,
            };

            inbounds.push(InboundSpec { ports, forward });
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(ListenerWorker {
            bind_host: self.bind_host,
            inbounds,
            shutdown,
            started: AtomicBool::new(false),
            accept_tasks: Mutex::new(Vec::new()),
        }))
    }
}

/// Worker of the built-in engine. Listeners live inside per-port accept tasks
/// that exit (and release their sockets) when the shutdown channel flips.
///
/// The async `accept_tasks` lock covers the whole bind-and-spawn phase of
/// `start`, so `stop` cannot observe an empty task list while listeners are
/// being acquired.
pub struct ListenerWorker {
    bind_host: IpAddr,
    inbounds: Vec<InboundSpec>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl EngineWorker for ListenerWorker {
    async fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = self.accept_tasks.lock().await;
        if *self.shutdown.borrow() {
            // Stopped before start got scheduled; acquire nothing.
            return Ok(());
        }

        let mut listeners = Vec::new();
        for spec in &self.inbounds {
            for port in spec.ports.from..=spec.ports.to {
                let addr = SocketAddr::new(self.bind_host, port);
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|source| EngineError::Bind { addr, source })?;
                debug!(%addr, "listener bound");
                listeners.push((listener, spec.forward.clone()));
            }
        }

        for (listener, forward) in listeners {
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(accept_loop(listener, forward, shutdown)));
        }

        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        // Taking the lock waits out any in-flight bind phase; awaiting the
        // tasks waits out their listeners. Callers rely on the ports being
        // free once stop returns.
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.accept_tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    forward: Option<ForwardTarget>,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        match &forward {
                            Some(target) => {
                                tokio::spawn(relay(stream, target.clone()));
                            }
                            None => {
                                // No outbound configured: accept and close.
                                debug!(%peer, "closed connection without forward target");
                                drop(stream);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn relay(mut inbound: TcpStream, target: ForwardTarget) {
    match TcpStream::connect((target.address.as_str(), target.port)).await {
        Ok(mut outbound) => {
            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
        }
        Err(e) => {
            debug!(address = %target.address, port = target.port, error = %e,
                "failed to reach forward target");
        }
    }
}
