//! HTTP control API
//!
//! Thin translation layer between HTTP requests and registry operations. All
//! lifecycle semantics live in the registry; this server only reads bodies,
//! computes nothing itself, and renders outcomes.

use crate::error::{json_error_response, ControlErrorCode};
use crate::registry::{AddOutcome, Registry, RemoveOutcome};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the control plane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Control API server translating HTTP requests into registry calls
pub struct ControlServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, registry).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    registry: Arc<Registry>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        async move { handle_control_request(req, registry).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

/// Read the request body as a configuration document.
///
/// Documents are text by contract; a body that is not valid UTF-8 yields
/// `None` and is rejected before it reaches the registry.
async fn read_document(
    req: Request<hyper::body::Incoming>,
) -> Result<Option<String>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8(body.to_vec()).ok())
}

async fn handle_control_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<Registry>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Control API request");

    let response = match (&method, path.as_str()) {
        // Health check for the control API itself
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Register a worker: POST /add, body = raw configuration document
        (&Method::POST, "/add") => match read_document(req).await? {
            None => json_error_response(
                ControlErrorCode::InvalidDocument,
                "request body is not valid UTF-8",
            ),
            Some(document) if document.trim().is_empty() => {
                json_error_response(ControlErrorCode::InvalidDocument, "empty request body")
            }
            Some(document) => match registry.add(&document).await {
                Ok(AddOutcome::Registered) => response(StatusCode::OK, "succ"),
                Ok(AddOutcome::Replaced) => response(
                    StatusCode::OK,
                    "already running, replacing previous instance",
                ),
                Err(e) => {
                    json_error_response(ControlErrorCode::EngineCreateFailed, e.to_string())
                }
            },
        },

        // Tear down a worker: POST /delete, body = the document used in /add
        (&Method::POST, "/delete") => match read_document(req).await? {
            None => json_error_response(
                ControlErrorCode::InvalidDocument,
                "request body is not valid UTF-8",
            ),
            Some(document) => match registry.remove(&document).await {
                RemoveOutcome::Removed => response(StatusCode::OK, "removed instance"),
                RemoveOutcome::NotFound => response(StatusCode::OK, "no matching instance"),
            },
        },

        // List live fingerprints (the raw documents that are the key material)
        (&Method::GET | &Method::POST, "/get") => {
            let instances: Vec<String> = registry
                .list()
                .iter()
                .map(|fp| fp.document().to_string())
                .collect();
            let body = serde_json::json!({
                "instances": instances,
                "count": instances.len(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Diagnostic port usage of live workers
        (&Method::GET | &Method::POST, "/usingport") => {
            let ranges = registry.describe();
            let body = serde_json::json!({ "using_ports": ranges });
            json_response(StatusCode::OK, body.to_string())
        }

        // Wrong method on a known endpoint
        (_, "/add" | "/delete" | "/get" | "/usingport") => {
            json_error_response(
                ControlErrorCode::MethodNotAllowed,
                "method not allowed for this endpoint",
            )
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
