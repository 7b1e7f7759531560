//! A single open WebSocket session to the bridge.
//!
//! Implements the request/response correlator with per-request timeouts,
//! and feeds every inbound message to the event bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use chromabridge_protocol::messages::BridgeMessage;

use crate::ClientError;
use crate::dispatcher::EventBus;

/// The negotiated socket type (plain or TLS, behind `MaybeTlsStream`).
pub(crate) type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Callback invoked when the session's read pump exits.
pub(crate) type DisconnectCallback = Arc<Mutex<Option<Box<dyn Fn() + Send + Sync>>>>;

/// Table of in-flight requests awaiting their correlated response.
pub(crate) type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<BridgeMessage>>>>;

/// Cheap cloneable handle for issuing requests on a session.
///
/// Requests run concurrently; completion order is decided by the matching
/// token, never by send order.
#[derive(Clone)]
pub struct RequestHandle {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingTable,
    request_timeout: Duration,
}

impl RequestHandle {
    /// Sends a request and waits for the correlated response.
    ///
    /// `build` receives the generated token and produces the outbound
    /// message carrying it. The result settles exactly once: matching
    /// response, timeout, or connection loss — and the pending entry is
    /// removed on every exit path.
    pub async fn send_request(
        &self,
        build: impl FnOnce(String) -> BridgeMessage,
    ) -> Result<BridgeMessage, ClientError> {
        if self.write_tx.is_closed() {
            return Err(ClientError::NotConnected);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let msg = build(id.clone());
        debug_assert_eq!(msg.request_id(), Some(id.as_str()));
        let json = msg.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(self.request_timeout, rx).await;

        // Clean up the pending entry on any exit path. On the response
        // path the read pump already removed it; on timeout this removal
        // is what closes the race against a same-instant response.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => match resp.error_text() {
                Some(text) => Err(ClientError::Bridge(text.to_string())),
                None => Ok(resp),
            },
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Number of in-flight requests.
    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// A live session on one candidate URL.
pub struct WsSession {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingTable,
    on_disconnect: DisconnectCallback,
    /// Set before a requested teardown so the disconnect callback can
    /// tell an intentional close from a lost socket.
    intentional_close: Arc<AtomicBool>,
    request_timeout: Duration,
    url: String,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
}

impl WsSession {
    /// Attaches the pumps to an opened socket and returns the session.
    pub(crate) fn start(
        ws_stream: WsStream,
        url: String,
        bus: Arc<EventBus>,
        request_timeout: Duration,
    ) -> Self {
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let on_disconnect: DisconnectCallback = Arc::new(Mutex::new(None));
        let intentional_close = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let pending = pending.clone();
            let on_disconnect = on_disconnect.clone();
            let cancel = cancel.clone();
            let write_tx = write_tx.clone();
            tokio::spawn(crate::pumps::read::read_pump(
                read,
                pending,
                bus,
                on_disconnect,
                write_tx,
                cancel,
            ))
        };

        let ping_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::ping::ping_pump(write_tx, cancel))
        };

        Self {
            write_tx,
            pending,
            on_disconnect,
            intentional_close,
            request_timeout,
            url,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
        }
    }

    /// The candidate URL this session connected on.
    pub fn connected_url(&self) -> &str {
        &self.url
    }

    /// Returns `true` while the socket is usable.
    pub fn is_open(&self) -> bool {
        !self.write_tx.is_closed()
    }

    /// Returns a handle for issuing correlated requests.
    pub fn request_handle(&self) -> RequestHandle {
        RequestHandle {
            write_tx: self.write_tx.clone(),
            pending: self.pending.clone(),
            request_timeout: self.request_timeout,
        }
    }

    /// Sets the callback fired when the read pump exits.
    pub(crate) async fn set_disconnect_callback(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.on_disconnect.lock().await = Some(cb);
    }

    /// Shared flag the disconnect callback reads to suppress reconnection.
    pub(crate) fn intentional_close_flag(&self) -> Arc<AtomicBool> {
        self.intentional_close.clone()
    }

    /// Closes the session.
    ///
    /// `intentional` marks an operator-requested teardown (explicit
    /// disconnect or a forced reconnect) so the scheduler stays quiet.
    /// The pending table is drained, settling every outstanding request
    /// with [`ClientError::Closed`] immediately rather than letting it
    /// ride out its timeout.
    pub async fn close(&self, intentional: bool) {
        if intentional {
            self.intentional_close.store(true, Ordering::Relaxed);
        }
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        self.cancel.cancel();
        self.pending.lock().await.clear();
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.intentional_close.store(true, Ordering::Relaxed);
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromabridge_protocol::types::MeasurementType;

    fn handle_with_timeout(
        timeout: Duration,
    ) -> (
        RequestHandle,
        mpsc::Receiver<tungstenite::Message>,
        PendingTable,
    ) {
        let (write_tx, write_rx) = mpsc::channel(16);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let handle = RequestHandle {
            write_tx,
            pending: pending.clone(),
            request_timeout: timeout,
        };
        (handle, write_rx, pending)
    }

    #[tokio::test]
    async fn request_carries_generated_token() {
        let (handle, mut write_rx, _pending) = handle_with_timeout(Duration::from_secs(5));

        let send = tokio::spawn(async move {
            let _ = handle
                .send_request(|id| BridgeMessage::DeviceStatus { request_id: id })
                .await;
        });

        let frame = write_rx.recv().await.unwrap();
        let tungstenite::Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let msg = chromabridge_protocol::messages::decode(&text)
            .unwrap()
            .unwrap();
        let id = msg.request_id().unwrap();
        assert!(!id.is_empty());

        send.abort();
    }

    #[tokio::test]
    async fn timeout_rejects_and_drains_pending_table() {
        tokio::time::pause();
        let (handle, _write_rx, pending) = handle_with_timeout(Duration::from_secs(61));

        let h = handle.clone();
        let send = tokio::spawn(async move {
            h.send_request(|id| BridgeMessage::MeasurementTrigger {
                request_id: id,
                modes: vec!["M0".into()],
                measurement_type: MeasurementType::Spot,
            })
            .await
        });

        // Let the request register, then pass the budget.
        tokio::task::yield_now().await;
        assert_eq!(pending.lock().await.len(), 1);
        tokio::time::advance(Duration::from_secs(62)).await;

        let result = send.await.unwrap();
        assert!(matches!(result, Err(ClientError::Timeout)));
        // The table returns to its pre-send size.
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn response_resolves_with_matching_payload() {
        let (handle, mut write_rx, pending) = handle_with_timeout(Duration::from_secs(5));

        let send = tokio::spawn(async move {
            handle
                .send_request(|id| BridgeMessage::DeviceStatus { request_id: id })
                .await
        });

        let tungstenite::Message::Text(text) = write_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let sent = chromabridge_protocol::messages::decode(&text)
            .unwrap()
            .unwrap();
        let id = sent.request_id().unwrap().to_string();

        // Simulate the read pump resolving the pending entry.
        let tx = pending.lock().await.remove(&id).unwrap();
        tx.send(BridgeMessage::DeviceStatusResponse {
            request_id: id.clone(),
            device: chromabridge_protocol::types::DeviceSnapshot::detached(),
        })
        .unwrap();

        let resp = send.await.unwrap().unwrap();
        assert_eq!(resp.request_id(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn error_marked_response_rejects() {
        let (handle, mut write_rx, pending) = handle_with_timeout(Duration::from_secs(5));

        let send = tokio::spawn(async move {
            handle
                .send_request(|id| BridgeMessage::CalibrationStart { request_id: id })
                .await
        });

        let tungstenite::Message::Text(text) = write_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let id = chromabridge_protocol::messages::decode(&text)
            .unwrap()
            .unwrap()
            .request_id()
            .unwrap()
            .to_string();

        let tx = pending.lock().await.remove(&id).unwrap();
        tx.send(BridgeMessage::CalibrationError {
            request_id: Some(id),
            error: "white tile missing".into(),
        })
        .unwrap();

        let result = send.await.unwrap();
        match result {
            Err(ClientError::Bridge(text)) => assert_eq!(text, "white tile missing"),
            other => panic!("expected bridge error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_settles_outstanding_requests_immediately() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept but never answer, so the request stays outstanding.
            if let Ok((stream, _)) = listener.accept().await {
                let _ws = tokio_tungstenite::accept_async(stream).await;
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });

        let url = format!("ws://127.0.0.1:{port}");
        let (stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let session = WsSession::start(
            stream,
            url,
            Arc::new(EventBus::new()),
            Duration::from_secs(60),
        );

        let handle = session.request_handle();
        let task = tokio::spawn(async move {
            handle
                .send_request(|id| BridgeMessage::DeviceStatus { request_id: id })
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.close(true).await;

        // Settles right away, not after the 60 s request budget.
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("request should settle on close")
            .unwrap();
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn closed_channel_rejects_without_pending_entry() {
        let (handle, write_rx, pending) = handle_with_timeout(Duration::from_secs(5));
        drop(write_rx);

        let result = handle
            .send_request(|id| BridgeMessage::DeviceStatus { request_id: id })
            .await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert!(pending.lock().await.is_empty());
    }
}
