//! Handler trait for client requests.
//!
//! Implementors wrap the device-management component that actually talks
//! to the instrument; the server framework handles connection management,
//! decoding, and routing.

use std::future::Future;
use std::pin::Pin;

use chromabridge_protocol::messages::BridgeMessage;
use chromabridge_protocol::types::MeasurementType;

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling requests from the connected client.
///
/// Each method receives a `sender` for the reply (and for any push events
/// the operation provokes) plus the request correlation token. Responses
/// must echo `request_id` or the client will time the request out.
///
/// `on_device_status` is required — every bridge must answer the status
/// probe the client issues after connecting. Calibration and measurement
/// default to the matching error reply so a bridge for a capability-poor
/// instrument only overrides what it supports.
pub trait Handler: Send + Sync + 'static {
    /// Called when a client connection is established.
    ///
    /// A good place to start forwarding instrument attach/detach events
    /// through the sender.
    fn on_client_connected(&self, sender: Sender) -> HandlerFuture<'_> {
        let _ = sender;
        Box::pin(async {})
    }

    /// Called for `device:status`.
    fn on_device_status(&self, sender: Sender, request_id: String) -> HandlerFuture<'_>;

    /// Called for `calibration:start`.
    fn on_calibration_start(&self, sender: Sender, request_id: String) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_msg(&BridgeMessage::CalibrationError {
                request_id: Some(request_id),
                error: "calibration not supported".into(),
            });
        })
    }

    /// Called for `measurement:trigger`.
    fn on_measurement_trigger(
        &self,
        sender: Sender,
        request_id: String,
        modes: Vec<String>,
        measurement_type: MeasurementType,
    ) -> HandlerFuture<'_> {
        let _ = (modes, measurement_type);
        Box::pin(async move {
            let _ = sender.send_msg(&BridgeMessage::MeasurementError {
                request_id: Some(request_id),
                error: "measurement not supported".into(),
            });
        })
    }

    /// Called when the client disconnects (cleanup hook).
    fn on_client_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}
