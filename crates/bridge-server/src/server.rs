//! Bridge WebSocket server.
//!
//! Listens on a TCP port, upgrades to WebSocket, and serves a single
//! browser client at a time. A new connection replaces a live or stale
//! one — a page refresh must be able to take the session over.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use chromabridge_protocol::constants::{DEFAULT_PORT, WS_MAX_MESSAGE_SIZE};

use crate::ServerError;
use crate::connection::{self, ClientConnection};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

/// The bridge WebSocket server.
///
/// Manages a single client connection at a time and dispatches requests
/// to the provided [`Handler`].
pub struct BridgeServer<H: Handler> {
    port: u16,
    handler: Arc<H>,
    client_conn: Mutex<Option<ClientConnection>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> BridgeServer<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            port: config.port,
            handler: Arc::new(handler),
            client_conn: Mutex::new(None),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Returns `true` if a client is currently connected and alive.
    pub async fn has_client(&self) -> bool {
        let lock = self.client_conn.lock().await;
        match lock.as_ref() {
            Some(conn) => conn.sender().is_connected(),
            None => false,
        }
    }

    /// Returns the sender for the current client connection, if any.
    ///
    /// The device-management component uses this to deliver push events.
    pub async fn client_sender(&self) -> Option<connection::Sender> {
        self.client_conn.lock().await.as_ref().map(|c| c.sender())
    }

    /// Closes the current client connection (if any).
    pub async fn disconnect_client(&self) {
        let mut lock = self.client_conn.lock().await;
        if let Some(conn) = lock.take() {
            conn.close();
        }
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([127, 0, 0, 1], self.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("bridge server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.disconnect_client().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles a single TCP connection: upgrades to WS and installs the
    /// client session.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // Take the old connection (if any) and wait for its read pump +
        // on_client_disconnected to finish before accepting the new one.
        // Prevents a race where the old disconnect hook tears down state
        // the new connection just set up.
        {
            let old = self.client_conn.lock().await.take();
            if let Some(conn) = old {
                if conn.sender().is_connected() {
                    tracing::info!(%peer_addr, "replacing active client connection");
                } else {
                    tracing::info!("clearing stale client connection");
                }
                conn.close_and_wait().await;
            }
        }

        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
        tracing::info!(%peer_addr, "WebSocket connection established");

        let conn =
            connection::spawn_connection(ws_stream, Arc::clone(&self.handler), self.cancel.clone());
        let sender = conn.sender();

        // Store the connection.
        {
            let mut lock = self.client_conn.lock().await;
            // Double-check: another task may have connected between our
            // check and now.
            if lock.as_ref().is_some_and(|c| c.sender().is_connected()) {
                conn.close();
                return Err(ServerError::ClientAlreadyConnected);
            }
            *lock = Some(conn);
        }

        self.handler.on_client_connected(sender).await;
        Ok(())
    }
}
