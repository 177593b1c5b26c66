//! Connection handlers.
//!
//! One WebSocket carries one session: the socket reader feeds decoded
//! envelopes into [`Session::dispatch`], the writer drains the session's
//! outbound queue, and a kick from the engine closes the connection.

use crate::config::Config;
use crate::metrics::{self, SessionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use banter_core::{codes, Authenticator, BasicAuthenticator, Hub, MemStore, Session};
use banter_proto::{codec, ServerCtrl, ServerMsg};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: Config,
}

/// Run the HTTP/WebSocket server until shutdown.
///
/// # Errors
///
/// Returns an error if the server fails to bind or serve.
pub async fn run_server(config: Config) -> Result<()> {
    let store = Arc::new(MemStore::new());
    let hub = Hub::new(store, config.engine_config());
    let authenticator: Arc<dyn Authenticator> = Arc::new(BasicAuthenticator::new());

    let state = Arc::new(AppState {
        hub: hub.clone(),
        authenticator,
        config: config.clone(),
    });

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("banter listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining topics");
    hub.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "topics": state.hub.topic_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Drive one WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = SessionMetricsGuard::new();

    let (mut session, mut out_rx) = Session::new(state.hub.clone(), state.authenticator.clone());
    let handle = session.handle();
    let sid = session.sid().to_string();
    debug!(session = %sid, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let max_message_size = state.config.limits.max_message_size;

    loop {
        tokio::select! {
            biased;

            // Outbound: frames queued by topics and the session itself.
            out = out_rx.recv() => {
                let Some(frame) = out else { break };
                match codec::encode(&frame) {
                    Ok(data) => {
                        metrics::record_message(data.len(), "outbound");
                        let text = String::from_utf8_lossy(&data).into_owned();
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(session = %sid, error = %e, "Outbound encode failed");
                        metrics::record_error("encode");
                    }
                }
            }

            // The engine declared this session slow or dead.
            () = handle.kicked() => {
                warn!(session = %sid, "Session kicked, closing socket");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // Inbound from the socket.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_payload(&mut session, text.as_bytes(), max_message_size).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_payload(&mut session, &data, max_message_size).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs.
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %sid, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %sid, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %sid, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    session.close().await;
    metrics::set_active_topics(state.hub.topic_count());
    debug!(session = %sid, "WebSocket disconnected");
}

/// Decode one inbound payload and dispatch it.
async fn handle_payload(session: &mut Session, data: &[u8], max_size: usize) {
    let handle = session.handle();

    if data.len() > max_size {
        metrics::record_error("oversize");
        let _ = handle.try_queue(reject_ctrl(codes::TOO_LARGE, "payload too large"));
        return;
    }

    match codec::decode(data) {
        Ok(msg) => {
            metrics::record_message(data.len(), "inbound");
            let start = Instant::now();
            session.dispatch(msg).await;
            metrics::record_dispatch(start.elapsed().as_secs_f64());
        }
        Err(e) => {
            debug!(error = %e, "Malformed envelope");
            metrics::record_error("decode");
            let _ = handle.try_queue(reject_ctrl(codes::BAD_REQUEST, "malformed envelope"));
        }
    }
}

fn reject_ctrl(code: u16, text: &str) -> ServerMsg {
    ServerMsg::Ctrl(ServerCtrl {
        id: String::new(),
        topic: String::new(),
        code,
        text: text.to_string(),
        params: None,
        ts: banter_core::types::now_ms(),
    })
}
