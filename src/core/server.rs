//! WebSocket Server
//!
//! axum transport for the engine. One route upgrades to a WebSocket; each
//! connection gets a writer task draining its outbound queue, and a reader
//! loop that feeds text frames to the engine and re-sends unacknowledged
//! messages. The session supervisor runs alongside on its own interval.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::broadcast::Outbound;
use crate::core::engine::Engine;

const RESEND_TICK: Duration = Duration::from_secs(1);
const WRITER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind: SocketAddr,
    /// Route the WebSocket endpoint is mounted on
    pub path: String,
    pub sweep_interval: Duration,
}

struct ServerState {
    engine: Arc<Engine>,
    shutdown: watch::Receiver<bool>,
}

/// WebSocket front end for one engine
pub struct SyncServer {
    engine: Arc<Engine>,
    options: ServerOptions,
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Fires when the serve task exits, dropped unsent if it panics or is aborted
    exit_rx: Option<oneshot::Receiver<std::io::Result<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncServer {
    pub fn new(engine: Arc<Engine>, options: ServerOptions) -> Self {
        Self {
            engine,
            options,
            shutdown_tx: None,
            exit_rx: None,
            tasks: Vec::new(),
        }
    }

    /// Bind and start serving. Returns the bound address (useful with port 0).
    pub async fn start(&mut self) -> std::io::Result<SocketAddr> {
        if self.shutdown_tx.is_some() {
            return Err(std::io::Error::new(std::io::ErrorKind::AlreadyExists, "Server already running"));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::net::TcpListener::bind(self.options.bind).await?;
        let addr = listener.local_addr()?;

        let app = router(self.engine.clone(), &self.options.path, shutdown_rx.clone());

        let mut server_shutdown = shutdown_rx.clone();
        let (exit_tx, exit_rx) = oneshot::channel();
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Encounter sync server listening on ws://{}", addr);
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                    tracing::info!("Encounter sync server shutting down");
                })
                .await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Server terminated with error");
            }
            let _ = exit_tx.send(result);
        }));

        let supervisor = self.engine.supervisor().clone();
        self.tasks.push(tokio::spawn(supervisor.run(self.options.sweep_interval, shutdown_rx)));

        self.shutdown_tx = Some(shutdown_tx);
        self.exit_rx = Some(exit_rx);
        Ok(addr)
    }

    /// Resolve once the listener has stopped serving.
    ///
    /// Yields the serve error, or an error when the serve task died without
    /// reporting. Returns immediately when the server was never started.
    /// Cancel safe, so it can sit in a `select!` next to a shutdown signal.
    pub async fn terminated(&mut self) -> std::io::Result<()> {
        let Some(exit) = self.exit_rx.as_mut() else {
            return Ok(());
        };
        let result = exit
            .await
            .unwrap_or_else(|_| Err(std::io::Error::other("Server task ended without reporting")));
        self.exit_rx = None;
        result
    }

    /// Stop accepting connections, close the open ones and wait for the tasks
    pub async fn stop(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Server task ended abnormally");
            }
        }
        self.engine.flush_persistence().await;
        tracing::info!("Encounter sync server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }
}

fn router(engine: Arc<Engine>, path: &str, shutdown: watch::Receiver<bool>) -> Router {
    let state = Arc::new(ServerState { engine, shutdown });
    Router::new()
        .route(path, get(ws_handler))
        .route("/health", get(health_check))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// HTTP Handlers
// ============================================================================

async fn health_check(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.engine.broadcaster().connection_count(),
        "encounters": state.engine.registry().len(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(state, socket))
}

// ============================================================================
// Connection Loop
// ============================================================================

async fn serve_connection(state: Arc<ServerState>, socket: WebSocket) {
    let engine = state.engine.clone();
    let mut shutdown = state.shutdown.clone();
    let (handle, outbound) = engine.connect();
    let connection_id = handle.id().to_string();

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_outbound(sink, outbound, connection_id.clone()));
    let mut writer_done = false;

    let mut resend = tokio::time::interval(RESEND_TICK);
    resend.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => engine.handle_text(&connection_id, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!(connection_id = %connection_id, "Ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket read failed");
                    break;
                }
            },
            _ = resend.tick() => {
                let resent = handle.resend_due(Instant::now());
                if resent > 0 {
                    tracing::debug!(connection_id = %connection_id, resent, "Re-sent unacknowledged messages");
                }
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                handle.close("Server shutting down");
                break;
            }
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break;
            }
        }

        if !handle.is_open() {
            break;
        }
    }

    engine.disconnect(&connection_id);
    drop(handle);
    if !writer_done && tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn write_outbound(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    connection_id: String,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Message(message) => {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(connection_id = %connection_id, error = %e, "Failed to serialize message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { reason } => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}
