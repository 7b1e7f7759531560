//! Wire protocol shared by the bridge process and its browser client.
//!
//! One JSON object per message, tagged by `type`, correlated by an
//! optional `requestId`. The catalog is closed; unknown types decode to
//! `None` and are ignored by both sides.

pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageKind;
pub use messages::{BridgeMessage, ProtocolError, decode};
pub use types::{
    CalibrationResult, CalibrationStatus, DeviceInfo, DeviceSerial, DeviceSnapshot, LabColor,
    MeasurementType, ModeReading, Readings,
};
