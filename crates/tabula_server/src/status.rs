//! Minimal HTTP status endpoint.
//!
//! Serves JSON on:
//! - `GET /health` liveness, 200 while the process is up
//! - `GET /ready` readiness, 503 once shutdown has begun
//! - `GET /status` cell health per bundle, chunk count and balancer state
//!
//! Raw TCP on tokio; no HTTP framework.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tabula_balancer::TabletBalancer;
use tabula_cluster::Cluster;

pub struct StatusState {
    start_time: Instant,
    ready: AtomicBool,
    cluster: Arc<Cluster>,
    balancer: Arc<TabletBalancer>,
}

impl StatusState {
    pub fn new(cluster: Arc<Cluster>, balancer: Arc<TabletBalancer>) -> Self {
        Self {
            start_time: Instant::now(),
            ready: AtomicBool::new(true),
            cluster,
            balancer,
        }
    }

    /// Not-ready makes `/ready` answer 503 so clients drain.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn bundles(&self) -> Value {
        let mut bundles = serde_json::Map::new();
        for bundle in self.cluster.bundles() {
            let cells: Vec<Value> = self
                .cluster
                .cells(&bundle)
                .into_iter()
                .map(|cell| {
                    let health = self
                        .cluster
                        .cell_health(cell)
                        .map(|h| h.name().to_string())
                        .unwrap_or_else(|e| e.to_string());
                    json!({ "id": cell.to_string(), "health": health })
                })
                .collect();
            bundles.insert(bundle, json!({ "cells": cells }));
        }
        Value::Object(bundles)
    }

    /// Status line and JSON body for `path`.
    pub fn respond(&self, path: &str) -> (&'static str, Value) {
        match path {
            "/health" | "/healthz" => (
                "200 OK",
                json!({ "status": "ok", "uptime_secs": self.uptime_secs() }),
            ),
            "/ready" | "/readyz" => {
                if self.is_ready() {
                    ("200 OK", json!({ "ready": true, "uptime_secs": self.uptime_secs() }))
                } else {
                    (
                        "503 Service Unavailable",
                        json!({ "ready": false, "reason": "shutting down" }),
                    )
                }
            }
            "/status" => (
                "200 OK",
                json!({
                    "status": "ok",
                    "uptime_secs": self.uptime_secs(),
                    "ready": self.is_ready(),
                    "timestamp": self.cluster.current_timestamp().0,
                    "bundles": self.bundles(),
                    "chunk_count": self.cluster.chunks().chunk_ids().len(),
                    "tablet_balancer": self.balancer.orchid(),
                }),
            ),
            _ => ("404 Not Found", json!({ "error": "not found" })),
        }
    }
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn run_status_server(
    addr: &str,
    state: Arc<StatusState>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => {
            tracing::info!(addr, "status server listening");
            l
        }
        Err(e) => {
            tracing::error!(addr, error = %e, "cannot bind status server");
            return;
        }
    };
    serve(listener, state, shutdown).await;
}

pub async fn serve(listener: TcpListener, state: Arc<StatusState>, shutdown: impl std::future::Future<Output = ()>) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(stream, &state).await {
                                tracing::debug!(error = %e, "status request failed");
                            }
                        });
                    }
                    Err(e) => tracing::debug!(error = %e, "status accept failed"),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("status server shutting down");
                break;
            }
        }
    }
}

async fn handle_request(mut stream: TcpStream, state: &StatusState) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    let request = String::from_utf8_lossy(&buf[..n]);
    // "GET /path HTTP/1.x"
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    // Cluster calls take blocking locks.
    let (status, body) = tokio::task::block_in_place(|| state.respond(path));
    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
