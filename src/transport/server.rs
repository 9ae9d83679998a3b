//! HTTP and websocket surface of the relay.
//!
//! ## Endpoints
//!
//! - `GET /health`: liveness check
//! - `GET /ws`: one voice session per websocket connection
//!
//! Each socket gets a writer task draining the session's outbound queue
//! and a reader loop feeding a bounded inbound queue. The [`Session`]
//! itself runs as a separate task and owns every upstream connection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, ServerConfig};
use crate::credentials::EngineCredentials;
use crate::error::{RelayError, Result};
use crate::session::Session;
use crate::session::engines::EngineFactory;
use crate::transport::client_channel;
use crate::transport::protocol::Inbound;

/// Name reported by the health endpoint.
pub const SERVICE_NAME: &str = "voxrelay";

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct AppState {
    config: Arc<RelayConfig>,
    factory: Arc<dyn EngineFactory>,
    credentials: EngineCredentials,
}

impl AppState {
    /// Build state from configuration, an engine factory and the server's
    /// default credentials.
    pub fn new(
        config: Arc<RelayConfig>,
        factory: Arc<dyn EngineFactory>,
        credentials: EngineCredentials,
    ) -> Self {
        Self {
            config,
            factory,
            credentials,
        }
    }
}

/// Build the relay's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(voice_socket))
        .with_state(state)
}

/// A running relay server.
pub struct RelayServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl RelayServer {
    /// Bind the configured address and serve in a background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot bind.
    pub async fn start(state: AppState, server: &ServerConfig) -> Result<Self> {
        let bind_addr = server.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| RelayError::Transport(format!("relay bind failed on {bind_addr}: {e}")))?;
        let addr = listener.local_addr()?;

        info!("voice relay listening on ws://{addr}/ws");

        let app = router(state);
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("relay server error: {e}");
            }
        });

        Ok(Self { addr, handle })
    }

    /// Address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port the server is listening on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Wait until the server task exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the server task panicked.
    pub async fn wait(mut self) -> Result<()> {
        (&mut self.handle)
            .await
            .map_err(|e| RelayError::Transport(format!("relay server task failed: {e}")))
    }

    /// Abort the server task.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
    }))
}

async fn voice_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = client_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(state.config.session.inbound_capacity.max(1));
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(control) = control_rx.recv() => control,
                outbound = client_rx.recv() => match outbound {
                    Some(outbound) => match outbound.to_json() {
                        Ok(text) => Message::Text(text.into()),
                        Err(e) => {
                            warn!("dropping unserializable message: {e}");
                            continue;
                        }
                    },
                    None => break,
                },
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let session = Session::new(
        Arc::clone(&state.config),
        Arc::clone(&state.factory),
        state.credentials.clone(),
        client_tx,
    );
    let session_id = session.id().to_owned();
    info!(session_id = %session_id, "client connected");
    let session_task = tokio::spawn(session.run(inbound_rx));

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %session_id, "client socket receive error: {e}");
                break;
            }
        };

        let inbound = match message {
            Message::Binary(data) => Inbound::Audio(data),
            Message::Text(text) => Inbound::Text(text.as_str().to_owned()),
            Message::Close(_) => break,
            Message::Ping(payload) => {
                let _ = control_tx.send(Message::Pong(payload));
                continue;
            }
            Message::Pong(_) => continue,
        };
        if inbound_tx.send(inbound).await.is_err() {
            debug!(session_id = %session_id, "session ended before socket");
            break;
        }
    }

    drop(inbound_tx);
    if let Err(e) = session_task.await {
        warn!(session_id = %session_id, "session task failed: {e}");
    }
    drop(control_tx);
    let _ = writer.await;
    info!(session_id = %session_id, "client disconnected");
}
