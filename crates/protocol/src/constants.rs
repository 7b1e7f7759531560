use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default TCP port the bridge process listens on.
pub const DEFAULT_PORT: u16 = 9876;

/// Time allowed for a single connection attempt (per candidate URL).
///
/// Each attempt races the WebSocket open against this timeout; whichever
/// resolves first wins and the loser is dropped.
pub const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for request/response operations.
///
/// Sized for measurements: a strip swipe can take tens of seconds between
/// trigger and result. The same budget applies uniformly to every request
/// kind.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry delays after an unexpected disconnect, indexed by attempt count.
/// Once exhausted the last entry applies forever — never unbounded growth.
pub const RECONNECT_BACKOFF_SECS: [u64; 6] = [1, 2, 4, 8, 16, 30];

/// Consecutive failed connection cycles (every candidate URL exhausted)
/// before the client raises the not-installed signal.
///
/// A heuristic: it cannot tell "no bridge process" from "persistent
/// network failure", and deliberately does not try to.
pub const NOT_INSTALLED_AFTER_CYCLES: u32 = 3;

/// Remediation URL included in the not-installed signal payload.
pub const BRIDGE_DOWNLOAD_URL: &str = "https://chromabridge.app/download";

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if *nothing* arrives within this window the
/// connection is considered dead and the reconnection scheduler takes over.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(30);

/// How often to send keepalive pings (must be well under [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(10);

/// Maximum message size in bytes (1 MB).
///
/// Spectral payloads are small; anything larger is malformed.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Send buffer capacity for the outbound message channel.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Message kind identifier.
///
/// Covers the closed wire catalog plus the two reserved local-only kinds
/// (`connection`, `bridge:not-installed`) synthesized by the client's
/// transport layer, so event subscribers have a single key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    // Requests from client to bridge
    #[serde(rename = "device:status")]
    DeviceStatus,
    #[serde(rename = "calibration:start")]
    CalibrationStart,
    #[serde(rename = "measurement:trigger")]
    MeasurementTrigger,

    // Responses from bridge to client
    #[serde(rename = "device:status:response")]
    DeviceStatusResponse,
    #[serde(rename = "calibration:complete")]
    CalibrationComplete,
    #[serde(rename = "calibration:error")]
    CalibrationError,
    #[serde(rename = "measurement:result")]
    MeasurementResult,
    #[serde(rename = "measurement:error")]
    MeasurementError,
    #[serde(rename = "error")]
    Error,

    // Push events from bridge to client (unsolicited)
    #[serde(rename = "device:connected")]
    DeviceConnected,
    #[serde(rename = "device:disconnected")]
    DeviceDisconnected,
    #[serde(rename = "measurement:completed")]
    MeasurementCompleted,

    // Local-only synthetic events (never on the wire)
    #[serde(rename = "connection")]
    Connection,
    #[serde(rename = "bridge:not-installed")]
    BridgeNotInstalled,
}

impl MessageKind {
    /// Resolves a wire `type` string to a kind, if it is in the catalog.
    ///
    /// The local-only kinds are excluded: a bridge sending
    /// `"connection"` over the wire is not speaking this protocol.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "device:status" => Some(Self::DeviceStatus),
            "device:status:response" => Some(Self::DeviceStatusResponse),
            "device:connected" => Some(Self::DeviceConnected),
            "device:disconnected" => Some(Self::DeviceDisconnected),
            "calibration:start" => Some(Self::CalibrationStart),
            "calibration:complete" => Some(Self::CalibrationComplete),
            "calibration:error" => Some(Self::CalibrationError),
            "measurement:trigger" => Some(Self::MeasurementTrigger),
            "measurement:result" => Some(Self::MeasurementResult),
            "measurement:error" => Some(Self::MeasurementError),
            "measurement:completed" => Some(Self::MeasurementCompleted),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns `true` for the error-marked kinds.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::CalibrationError | Self::MeasurementError | Self::Error
        )
    }
}
