use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an attached instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub make: String,
    pub model: String,
    pub serial_number: String,
}

/// Calibration portion of a device status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationStatus {
    pub calibrated: bool,
    /// `None` when uncalibrated or the instrument does not report expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Device snapshot carried by `device:status:response`.
///
/// The identity and calibration fields are present iff `connected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationStatus>,
}

impl DeviceSnapshot {
    /// Snapshot for the no-device case.
    pub fn detached() -> Self {
        Self {
            connected: false,
            make: None,
            model: None,
            serial_number: None,
            calibration: None,
        }
    }

    /// Extracts the identity fields, if all are present.
    pub fn info(&self) -> Option<DeviceInfo> {
        match (&self.make, &self.model, &self.serial_number) {
            (Some(make), Some(model), Some(serial)) => Some(DeviceInfo {
                make: make.clone(),
                model: model.clone(),
                serial_number: serial.clone(),
            }),
            _ => None,
        }
    }
}

/// Calibration outcome carried by `calibration:complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Refreshed device identity optionally attached to `calibration:complete`.
///
/// Some instruments only expose their serial number reliably after a white
/// reference calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSerial {
    pub serial_number: String,
}

/// Measurement geometry requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementType {
    #[serde(rename = "spot")]
    Spot,
    #[serde(rename = "strip")]
    Strip,
    #[serde(rename = "multi-spot")]
    MultiSpot,
}

/// CIE Lab triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabColor {
    #[serde(rename = "L")]
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

/// A single reading for one measurement mode (M0/M1/M2/M3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeReading {
    /// Spectral reflectance curve, typically 380..730 nm at 10 nm steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectral: Option<Vec<f64>>,
    #[serde(rename = "Lab", default, skip_serializing_if = "Option::is_none")]
    pub lab: Option<LabColor>,
}

/// Measurement payload: one reading per requested mode.
pub type Readings = HashMap<String, ModeReading>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snapshot_detached_has_no_identity() {
        let snap = DeviceSnapshot::detached();
        assert!(!snap.connected);
        assert!(snap.info().is_none());
        let json = serde_json::to_string(&snap).unwrap();
        assert_eq!(json, r#"{"connected":false}"#);
    }

    #[test]
    fn snapshot_info_requires_all_fields() {
        let mut snap = DeviceSnapshot::detached();
        snap.connected = true;
        snap.make = Some("X-Rite".into());
        snap.model = Some("i1Pro3".into());
        assert!(snap.info().is_none());

        snap.serial_number = Some("10021776".into());
        let info = snap.info().unwrap();
        assert_eq!(info.make, "X-Rite");
        assert_eq!(info.serial_number, "10021776");
    }

    #[test]
    fn snapshot_wire_field_names() {
        let snap = DeviceSnapshot {
            connected: true,
            make: Some("Techkon".into()),
            model: Some("SpectroDens".into()),
            serial_number: Some("SD-4411".into()),
            calibration: Some(CalibrationStatus {
                calibrated: true,
                expires_at: Some(Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap()),
            }),
        };
        let json: serde_json::Value = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["serialNumber"], "SD-4411");
        assert_eq!(json["calibration"]["calibrated"], true);
        assert!(json["calibration"]["expiresAt"].is_string());
    }

    #[test]
    fn measurement_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MeasurementType::MultiSpot).unwrap(),
            "\"multi-spot\""
        );
        let parsed: MeasurementType = serde_json::from_str("\"strip\"").unwrap();
        assert_eq!(parsed, MeasurementType::Strip);
    }

    #[test]
    fn mode_reading_lab_rename() {
        let reading = ModeReading {
            spectral: None,
            lab: Some(LabColor {
                l: 52.3,
                a: 71.1,
                b: 48.9,
            }),
        };
        let json: serde_json::Value = serde_json::to_value(&reading).unwrap();
        assert!(json.get("spectral").is_none());
        assert_eq!(json["Lab"]["L"], 52.3);
        assert_eq!(json["Lab"]["a"], 71.1);
    }
}
