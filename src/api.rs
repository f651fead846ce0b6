//! Control-plane HTTP API
//!
//! A small loopback HTTP server for operators to spawn and stop containers
//! out of band. It shares the provisioning primitives with the gatekeeper
//! but deliberately none of its state: containers spawned here are not
//! registered for reuse and are not rate limited.

use crate::docker::{ProvisionSpec, SharedEngine};
use crate::ports;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Deserialize)]
struct SpawnRequest {
    image: Option<String>,
    container_port: Option<u16>,
    host_port: Option<u16>,
    name: Option<String>,
    cmd: Option<Vec<String>>,
    pids_limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    id: Option<String>,
}

/// Helper to create a JSON response - infallible with valid StatusCode
fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

fn bad_request(message: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({ "ok": false, "error": message }),
    )
}

/// Control-plane API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    engine: SharedEngine,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(bind_addr: SocketAddr, engine: SharedEngine, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            engine,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control-plane API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let engine = Arc::clone(&engine);
                                    async move { handle_request(req, engine).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control-plane API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    engine: SharedEngine,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Control-plane request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, serde_json::json!({ "ok": true })),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        ),

        (&Method::POST, "/spawn") => {
            let body = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<SpawnRequest>(&body) {
                Ok(spawn) => handle_spawn(spawn, &engine).await,
                Err(e) => bad_request(&format!("invalid JSON body: {}", e)),
            }
        }

        (&Method::POST, "/stop") => {
            let body = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<StopRequest>(&body) {
                Ok(stop) => handle_stop(stop, &engine).await,
                Err(e) => bad_request(&format!("invalid JSON body: {}", e)),
            }
        }

        _ => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "ok": false, "error": "not found" }),
        ),
    };

    Ok(response)
}

async fn handle_spawn(spawn: SpawnRequest, engine: &SharedEngine) -> Response<Full<Bytes>> {
    let image = match spawn.image {
        Some(ref image) if !image.is_empty() => image.clone(),
        _ => return bad_request("image is required"),
    };

    // bind to an allocated loopback port unless the caller chose one
    let host_port = match (spawn.container_port, spawn.host_port) {
        (Some(_), None) => match ports::allocate().await {
            Ok(port) => Some(port),
            Err(e) => {
                error!(error = %e, "Port allocation failed");
                return json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "ok": false, "error": e.to_string() }),
                );
            }
        },
        (_, host_port) => host_port,
    };

    let spec = ProvisionSpec {
        image: image.clone(),
        container_port: spawn.container_port,
        host_port,
        pids_limit: spawn.pids_limit,
        name: spawn.name,
        cmd: spawn.cmd,
    };

    match engine.provision(&spec).await {
        Ok(provisioned) => json_response(
            StatusCode::CREATED,
            serde_json::json!({
                "ok": true,
                "container": {
                    "id": provisioned.container_id,
                    "short_id": provisioned.short_id,
                    "image": image,
                    "host_port": provisioned.host_port,
                }
            }),
        ),
        Err(e) => {
            warn!(image, error = %e, "Spawn failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "ok": false, "error": e.to_string() }),
            )
        }
    }
}

async fn handle_stop(stop: StopRequest, engine: &SharedEngine) -> Response<Full<Bytes>> {
    let id = match stop.id {
        Some(ref id) if !id.is_empty() => id.clone(),
        _ => return bad_request("id is required"),
    };

    // teardown is best effort and never reports failure
    engine.teardown(&id).await;
    json_response(StatusCode::OK, serde_json::json!({ "ok": true, "id": id }))
}
