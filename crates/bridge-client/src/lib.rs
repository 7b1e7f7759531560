//! Bridge client for the browser side of the device bridge protocol.
//!
//! Provides transport negotiation with secure/plain fallback, backed-off
//! reconnection with not-installed detection, request/response correlation
//! over the asynchronous socket, a typed event bus for push notifications,
//! and the device/calibration/measurement state machine.

mod dispatcher;
pub mod manager;
mod negotiator;
pub(crate) mod pumps;
pub(crate) mod reconnection;
pub mod session;
pub mod state;
pub mod types;

pub use dispatcher::{EventBus, Listener, ListenerId};
pub use manager::BridgeClient;
pub use session::RequestHandle;
pub use state::{
    BridgeSnapshot, BridgeState, CalibrationState, DeviceState, MeasurementState, StateEvent,
};
pub use types::{BackoffSchedule, BridgeConfig, BridgeEvent, Endpoint};

use chromabridge_protocol::constants::MessageKind;
use chromabridge_protocol::messages::ProtocolError;
use tokio_tungstenite::tungstenite;

/// Errors from the bridge client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("endpoint list is empty")]
    NoEndpoints,

    #[error("not connected to bridge")]
    NotConnected,

    #[error("connection attempt timed out")]
    AttemptTimeout,

    #[error("all endpoints failed")]
    AllEndpointsFailed,

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("bridge error: {0}")]
    Bridge(String),

    #[error("unexpected response kind: {0:?}")]
    UnexpectedResponse(MessageKind),
}
