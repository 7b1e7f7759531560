//! The device/calibration/measurement state machine.
//!
//! All four state groups are mutated through the single [`reduce`] entry
//! point, driven by dispatched events — never directly by application
//! code — so the layering invariants live in one place.

use chrono::{DateTime, Utc};
use chromabridge_protocol::messages::BridgeMessage;
use chromabridge_protocol::types::{DeviceInfo, DeviceSnapshot, Readings};

/// Bridge-process connectivity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeState {
    pub connected: bool,
    /// Heuristic: repeated full connection cycles failed. Only meaningful
    /// while `connected` is false.
    pub not_installed: bool,
    pub consecutive_cycle_failures: u32,
}

/// Instrument attachment. Valid only while the bridge is up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub connected: bool,
    /// Present iff `connected`.
    pub info: Option<DeviceInfo>,
}

/// Calibration axis. Valid only while a device is attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationState {
    pub calibrated: bool,
    /// True only between a calibration request and its terminal response.
    pub calibrating: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Measurement axis. Valid only while calibrated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementState {
    /// True only between a measurement request and its terminal response.
    pub measuring: bool,
    /// Survives disconnects; late consumers decide relevance themselves.
    pub last_result: Option<Readings>,
}

/// The externally visible device lifecycle, all axes.
///
/// Initial state on process start: Down / NoDevice / Uncalibrated / Idle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeSnapshot {
    pub bridge: BridgeState,
    pub device: DeviceState,
    pub calibration: CalibrationState,
    pub measurement: MeasurementState,
}

/// An input to the state machine.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// A socket reached the open state.
    BridgeUp,
    /// The session closed (expectedly or not).
    BridgeDown,
    /// Every candidate URL failed once.
    CycleFailed,
    /// The cycle-failure threshold was crossed.
    NotInstalled,
    /// A manual reconnect was requested: clear the heuristic before any
    /// new attempt begins.
    ManualReset,
    /// A `device:status:response` snapshot arrived.
    StatusReported(DeviceSnapshot),
    /// Unsolicited attach push.
    DeviceAttached(DeviceInfo),
    /// Unsolicited detach push.
    DeviceDetached,
    /// A calibration request was sent.
    CalibrationStarted,
    /// Calibration finished successfully.
    CalibrationCompleted {
        expires_at: Option<DateTime<Utc>>,
        serial_number: Option<String>,
    },
    /// Calibration terminated with an error (or timed out).
    CalibrationFailed,
    /// A measurement request was sent.
    MeasurementStarted,
    /// A result arrived — triggered or hardware-initiated.
    MeasurementSucceeded(Readings),
    /// Measurement terminated with an error (or timed out).
    MeasurementFailed,
}

/// Applies one event to the snapshot.
pub fn reduce(s: &mut BridgeSnapshot, event: StateEvent) {
    match event {
        StateEvent::BridgeUp => {
            s.bridge.connected = true;
            s.bridge.not_installed = false;
            s.bridge.consecutive_cycle_failures = 0;
        }
        StateEvent::BridgeDown => {
            s.bridge.connected = false;
            // Lower axes are only valid while the bridge is up.
            s.device = DeviceState::default();
            s.calibration = CalibrationState::default();
            s.measurement.measuring = false;
        }
        StateEvent::CycleFailed => {
            s.bridge.consecutive_cycle_failures =
                s.bridge.consecutive_cycle_failures.saturating_add(1);
        }
        StateEvent::NotInstalled => {
            // Never true while connected.
            if !s.bridge.connected {
                s.bridge.not_installed = true;
            }
        }
        StateEvent::ManualReset => {
            s.bridge.not_installed = false;
            s.bridge.consecutive_cycle_failures = 0;
        }
        StateEvent::StatusReported(snap) => {
            if snap.connected {
                s.device.connected = true;
                s.device.info = snap.info();
                s.calibration.calibrating = false;
                match &snap.calibration {
                    Some(c) => {
                        s.calibration.calibrated = c.calibrated;
                        s.calibration.expires_at = c.expires_at;
                    }
                    None => {
                        s.calibration.calibrated = false;
                        s.calibration.expires_at = None;
                    }
                }
            } else {
                s.device = DeviceState::default();
                s.calibration = CalibrationState::default();
                s.measurement.measuring = false;
            }
        }
        StateEvent::DeviceAttached(info) => {
            s.device.connected = true;
            s.device.info = Some(info);
            // A freshly attached instrument starts uncalibrated.
            s.calibration = CalibrationState::default();
        }
        StateEvent::DeviceDetached => {
            s.device = DeviceState::default();
            // Detach forces the calibration axis back regardless of prior
            // state, including an in-flight calibration.
            s.calibration = CalibrationState::default();
            s.measurement.measuring = false;
        }
        StateEvent::CalibrationStarted => {
            s.calibration.calibrating = true;
            s.calibration.calibrated = false;
        }
        StateEvent::CalibrationCompleted {
            expires_at,
            serial_number,
        } => {
            s.calibration.calibrating = false;
            s.calibration.calibrated = true;
            s.calibration.expires_at = expires_at;
            if let (Some(serial), Some(info)) = (serial_number, s.device.info.as_mut()) {
                info.serial_number = serial;
            }
        }
        StateEvent::CalibrationFailed => {
            s.calibration.calibrating = false;
            s.calibration.calibrated = false;
        }
        StateEvent::MeasurementStarted => {
            s.measurement.measuring = true;
        }
        StateEvent::MeasurementSucceeded(readings) => {
            s.measurement.measuring = false;
            s.measurement.last_result = Some(readings);
        }
        StateEvent::MeasurementFailed => {
            s.measurement.measuring = false;
        }
    }
}

/// Maps an inbound wire message to its state machine input, if it has one.
pub(crate) fn wire_event(msg: &BridgeMessage) -> Option<StateEvent> {
    match msg {
        BridgeMessage::DeviceStatusResponse { device, .. } => {
            Some(StateEvent::StatusReported(device.clone()))
        }
        BridgeMessage::DeviceConnected { device } => {
            Some(StateEvent::DeviceAttached(device.clone()))
        }
        BridgeMessage::DeviceDisconnected => Some(StateEvent::DeviceDetached),
        BridgeMessage::CalibrationComplete {
            calibration,
            device,
            ..
        } => Some(StateEvent::CalibrationCompleted {
            expires_at: calibration.expires_at,
            serial_number: device.as_ref().map(|d| d.serial_number.clone()),
        }),
        BridgeMessage::CalibrationError { .. } => Some(StateEvent::CalibrationFailed),
        BridgeMessage::MeasurementResult { result, .. }
        | BridgeMessage::MeasurementCompleted { result } => {
            Some(StateEvent::MeasurementSucceeded(result.clone()))
        }
        BridgeMessage::MeasurementError { .. } => Some(StateEvent::MeasurementFailed),
        // Client-bound requests and the generic error leave state alone.
        BridgeMessage::DeviceStatus { .. }
        | BridgeMessage::CalibrationStart { .. }
        | BridgeMessage::MeasurementTrigger { .. }
        | BridgeMessage::Error { .. } => None,
    }
}
