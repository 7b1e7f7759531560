//! The closed wire catalog.
//!
//! Every message is a single JSON object with a required `type` tag, an
//! optional `requestId` correlation token (present on request/response
//! pairs, absent on push events), and a type-specific payload inlined at
//! the top level.

use serde::{Deserialize, Serialize};

use crate::constants::MessageKind;
use crate::types::{
    CalibrationResult, DeviceInfo, DeviceSerial, DeviceSnapshot, MeasurementType, Readings,
};

/// Errors from the decode boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no type field")]
    MissingType,
}

/// A wire message, tagged by its `type` field.
///
/// The catalog is closed: decoding validates shape per kind, so consumers
/// pattern-match exhaustively instead of probing optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    /// Client polls the current device/calibration snapshot.
    #[serde(rename = "device:status")]
    DeviceStatus {
        #[serde(rename = "requestId")]
        request_id: String,
    },

    /// Bridge answers a status poll.
    #[serde(rename = "device:status:response")]
    DeviceStatusResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        device: DeviceSnapshot,
    },

    /// Unsolicited attach notification.
    #[serde(rename = "device:connected")]
    DeviceConnected { device: DeviceInfo },

    /// Unsolicited detach notification.
    #[serde(rename = "device:disconnected")]
    DeviceDisconnected,

    /// Client begins a calibration.
    #[serde(rename = "calibration:start")]
    CalibrationStart {
        #[serde(rename = "requestId")]
        request_id: String,
    },

    /// Bridge reports a successful calibration.
    #[serde(rename = "calibration:complete")]
    CalibrationComplete {
        #[serde(rename = "requestId")]
        request_id: String,
        calibration: CalibrationResult,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<DeviceSerial>,
    },

    /// Bridge reports a failed calibration.
    #[serde(rename = "calibration:error")]
    CalibrationError {
        /// Absent when the failure was not tied to a specific request
        /// (e.g. the instrument aborted on its own).
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },

    /// Client triggers a measurement.
    #[serde(rename = "measurement:trigger")]
    MeasurementTrigger {
        #[serde(rename = "requestId")]
        request_id: String,
        modes: Vec<String>,
        #[serde(rename = "measurementType")]
        measurement_type: MeasurementType,
    },

    /// Bridge delivers the result of a triggered measurement.
    #[serde(rename = "measurement:result")]
    MeasurementResult {
        #[serde(rename = "requestId")]
        request_id: String,
        result: Readings,
    },

    /// Bridge reports a failed measurement.
    #[serde(rename = "measurement:error")]
    MeasurementError {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },

    /// Hardware-triggered result (button press on the instrument), not
    /// solicited by any client request.
    #[serde(rename = "measurement:completed")]
    MeasurementCompleted { result: Readings },

    /// Generic error, optionally tied to a request.
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },
}

impl BridgeMessage {
    /// Returns this message's kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::DeviceStatus { .. } => MessageKind::DeviceStatus,
            Self::DeviceStatusResponse { .. } => MessageKind::DeviceStatusResponse,
            Self::DeviceConnected { .. } => MessageKind::DeviceConnected,
            Self::DeviceDisconnected => MessageKind::DeviceDisconnected,
            Self::CalibrationStart { .. } => MessageKind::CalibrationStart,
            Self::CalibrationComplete { .. } => MessageKind::CalibrationComplete,
            Self::CalibrationError { .. } => MessageKind::CalibrationError,
            Self::MeasurementTrigger { .. } => MessageKind::MeasurementTrigger,
            Self::MeasurementResult { .. } => MessageKind::MeasurementResult,
            Self::MeasurementError { .. } => MessageKind::MeasurementError,
            Self::MeasurementCompleted { .. } => MessageKind::MeasurementCompleted,
            Self::Error { .. } => MessageKind::Error,
        }
    }

    /// Returns the correlation token, if this message carries one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::DeviceStatus { request_id }
            | Self::DeviceStatusResponse { request_id, .. }
            | Self::CalibrationStart { request_id }
            | Self::CalibrationComplete { request_id, .. }
            | Self::MeasurementTrigger { request_id, .. }
            | Self::MeasurementResult { request_id, .. } => Some(request_id),
            Self::CalibrationError { request_id, .. }
            | Self::MeasurementError { request_id, .. }
            | Self::Error { request_id, .. } => request_id.as_deref(),
            Self::DeviceConnected { .. }
            | Self::DeviceDisconnected
            | Self::MeasurementCompleted { .. } => None,
        }
    }

    /// Returns the error text when this is an error-marked message.
    pub fn error_text(&self) -> Option<&str> {
        match self {
            Self::CalibrationError { error, .. }
            | Self::MeasurementError { error, .. }
            | Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Serializes this message to its wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decodes a wire message.
///
/// Returns `Ok(None)` for a well-formed object whose `type` is not in the
/// catalog — unknown kinds are tolerated for protocol evolution, not
/// rejected. Malformed JSON or a known kind with a bad shape is an error.
pub fn decode(text: &str) -> Result<Option<BridgeMessage>, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?;
    if MessageKind::from_wire(tag).is_none() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}
