//! Client connection management: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;

use chromabridge_protocol::constants::{
    SEND_BUFFER_SIZE, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use chromabridge_protocol::messages::{self, BridgeMessage};
use chromabridge_protocol::types::{DeviceInfo, Readings};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::handler::Handler;

/// Handle for sending messages to the connected client.
///
/// Cloneable and cheap — wraps an `mpsc::Sender`. The device-management
/// component keeps one to deliver push events (attach/detach,
/// button-triggered measurements) outside any request context.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol message as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the client disconnected.
    pub fn send_msg(&self, msg: &BridgeMessage) -> Result<(), SendError> {
        let json = msg.encode().map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends a generic error reply for the given request token.
    pub fn send_error(&self, request_id: Option<String>, message: &str) -> Result<(), SendError> {
        self.send_msg(&BridgeMessage::Error {
            request_id,
            error: message.into(),
        })
    }

    /// Pushes an unsolicited attach notification.
    pub fn push_device_connected(&self, device: DeviceInfo) -> Result<(), SendError> {
        self.send_msg(&BridgeMessage::DeviceConnected { device })
    }

    /// Pushes an unsolicited detach notification.
    pub fn push_device_disconnected(&self) -> Result<(), SendError> {
        self.send_msg(&BridgeMessage::DeviceDisconnected)
    }

    /// Pushes a hardware-triggered measurement result.
    pub fn push_measurement_completed(&self, result: Readings) -> Result<(), SendError> {
        self.send_msg(&BridgeMessage::MeasurementCompleted { result })
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a client.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct ClientConnection {
    sender: Sender,
    cancel: CancellationToken,
    read_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClientConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals shutdown without waiting.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Signals shutdown and waits for the read pump (and the handler's
    /// disconnect hook) to finish.
    pub async fn close_and_wait(&self) {
        self.cancel.cancel();
        let handle = self.read_handle.lock().await.take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// Returns the [`ClientConnection`] handle. The pumps run as background
/// tokio tasks and stop when the connection closes or the cancel token
/// fires.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ClientConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let (ws_sink, ws_read) = ws_stream.split();

    // Write pump.
    let write_cancel = cancel.clone();
    tokio::spawn(write_pump(ws_sink, rx, write_cancel));

    // Read pump.
    let read_cancel = cancel.clone();
    let read_handler = handler.clone();
    let read_sender = sender.clone();
    let read_handle = tokio::spawn(async move {
        read_pump(ws_read, read_sender, read_handler, read_cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        read_cancel.cancel();
        handler.on_client_disconnected().await;
        tracing::info!("client disconnected");
    });

    ClientConnection {
        sender,
        cancel,
        read_handle: Mutex::new(Some(read_handle)),
    }
}

/// Write pump: drains the send channel and sends keepalive pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches to the handler.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    // Any incoming frame resets the deadline; silence past WS_PONG_WAIT
    // means the client is gone.
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                tracing::warn!("pong timeout, closing connection");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("message exceeds max size ({} > {WS_MAX_MESSAGE_SIZE})", text.len());
                                    continue;
                                }
                                dispatch_text(&handler, &sender, &text);
                            }
                            WsMessage::Pong(_) => {
                                tracing::trace!("received pong");
                            }
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::info!("received close frame");
                                break;
                            }
                            _ => {} // Binary and raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Dispatches a decoded text message to the appropriate handler method.
///
/// Each invocation runs as its own task: the read pump must keep
/// draining frames (and feeding the pong deadline) while a slow
/// operation — a strip measurement can take tens of seconds — is still
/// in flight, and concurrent requests must be free to complete in any
/// order. Replies go through the `Sender` channel, which does not care
/// who finishes first.
fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg = match messages::decode(text) {
        Ok(Some(m)) => m,
        Ok(None) => {
            tracing::debug!("ignoring message with unknown type");
            return;
        }
        Err(e) => {
            tracing::error!("invalid message: {e}");
            return;
        }
    };

    let s = sender.clone();
    let h = Arc::clone(handler);
    match msg {
        BridgeMessage::DeviceStatus { request_id } => {
            tokio::spawn(async move { h.on_device_status(s, request_id).await });
        }
        BridgeMessage::CalibrationStart { request_id } => {
            tokio::spawn(async move { h.on_calibration_start(s, request_id).await });
        }
        BridgeMessage::MeasurementTrigger {
            request_id,
            modes,
            measurement_type,
        } => {
            tokio::spawn(async move {
                h.on_measurement_trigger(s, request_id, modes, measurement_type)
                    .await;
            });
        }
        other => {
            // Bridge-bound direction only carries the three requests above;
            // anything else in the catalog is ignored, not rejected.
            tracing::warn!(kind = ?other.kind(), "unexpected bridge-bound message");
        }
    }
}
