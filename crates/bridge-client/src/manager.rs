//! The public client facade.
//!
//! [`BridgeClient`] owns the negotiated session, the event bus and the
//! state snapshot, and exposes the request operations. It is plain
//! dependency-injected state: construct as many as you need, each with
//! its own configuration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chromabridge_protocol::constants::MessageKind;
use chromabridge_protocol::messages::BridgeMessage;
use chromabridge_protocol::types::{
    CalibrationResult, DeviceSnapshot, MeasurementType, Readings,
};

use crate::ClientError;
use crate::dispatcher::{EventBus, Listener, ListenerId};
use crate::reconnection::{
    ClientContext, apply, cancel_pending_retry, establish_session, retry_loop,
};
use crate::session::RequestHandle;
use crate::state::{BridgeSnapshot, StateEvent, wire_event};
use crate::types::{BridgeConfig, BridgeEvent};

/// Client side of the bridge connection.
pub struct BridgeClient {
    ctx: ClientContext,
}

impl BridgeClient {
    /// Creates a client from the given configuration. Does not connect.
    pub fn new(config: BridgeConfig) -> Result<Arc<Self>, ClientError> {
        if config.endpoints.is_empty() {
            return Err(ClientError::NoEndpoints);
        }

        let ctx = ClientContext {
            config: Arc::new(config),
            bus: Arc::new(EventBus::new()),
            session: Arc::new(Mutex::new(None)),
            state: Arc::new(std::sync::RwLock::new(BridgeSnapshot::default())),
            cached_url: Arc::new(Mutex::new(None)),
            retry_cancel: Arc::new(std::sync::Mutex::new(None)),
            manual_close: Arc::new(AtomicBool::new(false)),
        };

        // Fold the wire traffic into the snapshot. Unsolicited pushes and
        // correlated responses go through the same reducer, so listeners
        // and request callers always observe a consistent snapshot.
        let state_kinds = [
            MessageKind::DeviceStatusResponse,
            MessageKind::DeviceConnected,
            MessageKind::DeviceDisconnected,
            MessageKind::CalibrationComplete,
            MessageKind::CalibrationError,
            MessageKind::MeasurementResult,
            MessageKind::MeasurementError,
            MessageKind::MeasurementCompleted,
        ];
        for kind in state_kinds {
            let state = ctx.state.clone();
            ctx.bus.on(
                kind,
                Box::new(move |ev| {
                    if let BridgeEvent::Wire(msg) = ev
                        && let Some(state_ev) = wire_event(msg)
                    {
                        apply(&state, state_ev);
                    }
                }),
            );
        }

        Ok(Arc::new(Self { ctx }))
    }

    /// Connects to the bridge, walking the candidate list.
    ///
    /// On failure the retry loop is started before the error returns, so
    /// a single `connect` call is enough to eventually reach a bridge
    /// that comes up later. Calling again while connected is a no-op.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_connected().await {
            debug!("already connected");
            return Ok(());
        }

        // A retry scheduled by an earlier failed connect would fire into
        // whatever session this call establishes; disarm it first.
        cancel_pending_retry(&self.ctx.retry_cancel);
        self.ctx.manual_close.store(false, Ordering::Relaxed);

        match establish_session(&self.ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let cancel = CancellationToken::new();
                cancel_pending_retry(&self.ctx.retry_cancel);
                if let Ok(mut guard) = self.ctx.retry_cancel.lock() {
                    *guard = Some(cancel.clone());
                }
                tokio::spawn(retry_loop(self.ctx.clone(), cancel));
                Err(e)
            }
        }
    }

    /// Disconnects and stops any scheduled retry.
    pub async fn disconnect(&self) {
        self.ctx.manual_close.store(true, Ordering::Relaxed);
        cancel_pending_retry(&self.ctx.retry_cancel);

        let session = self.ctx.session.lock().await.take();
        if let Some(session) = session {
            let was_open = session.is_open();
            session.close(true).await;
            if was_open {
                apply(&self.ctx.state, StateEvent::BridgeDown);
                self.ctx
                    .bus
                    .emit(&BridgeEvent::Connection { connected: false });
            }
        }
        info!("disconnected");
    }

    /// Tears everything down and reconnects from a clean slate.
    ///
    /// Clears the cached URL, the failure counters and the not-installed
    /// latch, then walks the candidate list from the top. Outstanding
    /// requests settle as closed.
    pub async fn force_reconnect(&self) -> Result<(), ClientError> {
        info!("forcing reconnect");
        cancel_pending_retry(&self.ctx.retry_cancel);

        let session = self.ctx.session.lock().await.take();
        let was_open = match session {
            Some(session) => {
                let open = session.is_open();
                session.close(true).await;
                open
            }
            None => false,
        };

        *self.ctx.cached_url.lock().await = None;
        if was_open {
            apply(&self.ctx.state, StateEvent::BridgeDown);
            self.ctx
                .bus
                .emit(&BridgeEvent::Connection { connected: false });
        }
        apply(&self.ctx.state, StateEvent::ManualReset);
        self.ctx.manual_close.store(false, Ordering::Relaxed);

        match establish_session(&self.ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let cancel = CancellationToken::new();
                cancel_pending_retry(&self.ctx.retry_cancel);
                if let Ok(mut guard) = self.ctx.retry_cancel.lock() {
                    *guard = Some(cancel.clone());
                }
                tokio::spawn(retry_loop(self.ctx.clone(), cancel));
                Err(e)
            }
        }
    }

    /// Queries the bridge for the current device state.
    pub async fn device_status(&self) -> Result<DeviceSnapshot, ClientError> {
        let handle = self.request_handle().await?;
        let resp = handle
            .send_request(|id| BridgeMessage::DeviceStatus { request_id: id })
            .await?;
        match resp {
            BridgeMessage::DeviceStatusResponse { device, .. } => Ok(device),
            other => Err(ClientError::UnexpectedResponse(other.kind())),
        }
    }

    /// Runs a calibration sequence on the attached device.
    pub async fn start_calibration(&self) -> Result<CalibrationResult, ClientError> {
        let handle = self.request_handle().await?;
        apply(&self.ctx.state, StateEvent::CalibrationStarted);

        let result = handle
            .send_request(|id| BridgeMessage::CalibrationStart { request_id: id })
            .await;

        match result {
            Ok(BridgeMessage::CalibrationComplete { calibration, .. }) => Ok(calibration),
            Ok(other) => {
                apply(&self.ctx.state, StateEvent::CalibrationFailed);
                Err(ClientError::UnexpectedResponse(other.kind()))
            }
            Err(e) => {
                apply(&self.ctx.state, StateEvent::CalibrationFailed);
                Err(e)
            }
        }
    }

    /// Triggers a measurement and waits for its readings.
    pub async fn trigger_measurement(
        &self,
        modes: Vec<String>,
        measurement_type: MeasurementType,
    ) -> Result<Readings, ClientError> {
        let handle = self.request_handle().await?;
        apply(&self.ctx.state, StateEvent::MeasurementStarted);

        let result = handle
            .send_request(|id| BridgeMessage::MeasurementTrigger {
                request_id: id,
                modes,
                measurement_type,
            })
            .await;

        match result {
            Ok(BridgeMessage::MeasurementResult { result, .. }) => Ok(result),
            Ok(other) => {
                apply(&self.ctx.state, StateEvent::MeasurementFailed);
                Err(ClientError::UnexpectedResponse(other.kind()))
            }
            Err(e) => {
                apply(&self.ctx.state, StateEvent::MeasurementFailed);
                Err(e)
            }
        }
    }

    /// Subscribes a listener to an event kind.
    pub fn on(&self, kind: MessageKind, listener: Listener) -> ListenerId {
        self.ctx.bus.on(kind, listener)
    }

    /// Removes a previously registered listener.
    pub fn off(&self, kind: MessageKind, id: ListenerId) {
        self.ctx.bus.off(kind, id);
    }

    /// Returns a copy of the current state snapshot.
    pub fn snapshot(&self) -> BridgeSnapshot {
        self.ctx
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Whether a live session is currently open.
    pub async fn is_connected(&self) -> bool {
        self.ctx
            .session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.is_open())
    }

    /// The URL of the last successful connection, if any.
    pub async fn connected_url(&self) -> Option<String> {
        self.ctx
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.connected_url().to_string())
    }

    // Extracts a request handle under a short-lived lock, so requests
    // await their responses without holding the session slot.
    async fn request_handle(&self) -> Result<RequestHandle, ClientError> {
        let guard = self.ctx.session.lock().await;
        match guard.as_ref() {
            Some(session) if session.is_open() => Ok(session.request_handle()),
            _ => Err(ClientError::NotConnected),
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        cancel_pending_retry(&self.ctx.retry_cancel);
    }
}
