//! WebSocket server for the bridge process.
//!
//! Accepts a single browser client at a time, dispatches the catalog's
//! client-bound requests to a [`Handler`], and gives the device-management
//! component a [`Sender`] for responses and hardware-triggered push events.
//! The instrument driver itself lives behind the [`Handler`] seam.

mod connection;
mod handler;
mod server;

pub use connection::{ClientConnection, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{BridgeServer, ServerConfig};

/// Errors produced by the bridge server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("client already connected")]
    ClientAlreadyConnected,
}
