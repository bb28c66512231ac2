use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderValue};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{error, info, warn};

use evoarena::arena::{self, Stage};
use evoarena::worker::{run_worker, WorkerRequest};

const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_BIND_PORT: u16 = 8087;
const PORT_FALLBACK_ATTEMPTS: u16 = 16;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .compact()
        .init();

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/stages", get(stages))
        .route("/api/run/ws", get(ws_run_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // Shared-memory pose buffers on the browser side need
        // cross-origin isolation.
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("cross-origin-opener-policy"),
            HeaderValue::from_static("same-origin"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("cross-origin-embedder-policy"),
            HeaderValue::from_static("require-corp"),
        ));

    let bind_port = resolve_bind_port();
    let (listener, addr) = match bind_listener(DEFAULT_BIND_HOST, bind_port).await {
        Ok(bound) => bound,
        Err(message) => {
            error!("{message}");
            return;
        }
    };
    info!("evoarena listening on http://{addr}");
    if let Err(err) = axum::serve(listener, app).await {
        error!("server exited unexpectedly: {err}");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn stages() -> Json<Vec<Stage>> {
    let stages = arena::stage_ids()
        .into_iter()
        .filter_map(arena::stage_by_id)
        .collect();
    Json(stages)
}

async fn ws_run_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_run_socket)
}

/// One worker per connection. Inbound frames are worker requests, outbound
/// frames are the worker's event stream; closing the socket aborts whatever
/// run is still in flight.
async fn handle_run_socket(socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, mut response_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(run_worker(request_rx, response_tx));

    let forward = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            let text = match serde_json::to_string(&response) {
                Ok(text) => text,
                Err(err) => {
                    error!("failed serializing worker response: {err}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<WorkerRequest>(&text) {
                Ok(mut request) => {
                    if let WorkerRequest::Start { id, payload } = &mut request {
                        // Seed zero means "pick one for me".
                        if payload.seed == 0 {
                            payload.seed = rand::rng().random::<u32>().max(1);
                            info!(run = %id, seed = payload.seed, "assigned random seed");
                        }
                    }
                    if request_tx.send(request).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("ignoring invalid worker request: {err}");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    drop(request_tx);
    let _ = worker.await;
    let _ = forward.await;
}

fn resolve_bind_port() -> u16 {
    const ENV_VAR: &str = "EVOARENA_PORT";
    if let Ok(raw_value) = std::env::var(ENV_VAR) {
        match raw_value.parse::<u16>() {
            Ok(parsed) if parsed > 0 => return parsed,
            _ => warn!(
                "{ENV_VAR} must be an integer in range 1-65535; got '{raw_value}'. Using default {DEFAULT_BIND_PORT}"
            ),
        }
    }
    DEFAULT_BIND_PORT
}

async fn bind_listener(
    host: &str,
    desired_port: u16,
) -> Result<(tokio::net::TcpListener, SocketAddr), String> {
    match tokio::net::TcpListener::bind((host, desired_port)).await {
        Ok(listener) => {
            let addr = listener
                .local_addr()
                .map_err(|err| format!("bound listener but failed reading local address: {err}"))?;
            Ok((listener, addr))
        }
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            for offset in 1..=PORT_FALLBACK_ATTEMPTS {
                let Some(candidate_port) = desired_port.checked_add(offset) else {
                    break;
                };
                if let Ok(listener) = tokio::net::TcpListener::bind((host, candidate_port)).await {
                    let addr = listener.local_addr().map_err(|bind_err| {
                        format!(
                            "bound listener on fallback port but failed reading local address: {bind_err}"
                        )
                    })?;
                    warn!(
                        "port {desired_port} is in use, falling back to http://{addr}; set EVOARENA_PORT to choose a fixed port"
                    );
                    return Ok((listener, addr));
                }
            }
            Err(format!(
                "port {desired_port} is in use on {host} and no fallback port in range {}-{} is free; stop the existing process or set EVOARENA_PORT",
                desired_port + 1,
                desired_port + PORT_FALLBACK_ATTEMPTS
            ))
        }
        Err(err) => Err(format!(
            "failed to bind socket on {host}:{desired_port}: {err}"
        )),
    }
}
