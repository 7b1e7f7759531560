//! WebSocket read pump — resolves pending requests and broadcasts events.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use chromabridge_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use chromabridge_protocol::messages;

use crate::dispatcher::EventBus;
use crate::session::{DisconnectCallback, PendingTable};
use crate::types::BridgeEvent;

/// Reads messages from the WebSocket, settles pending requests and
/// broadcasts every decoded message on the event bus.
///
/// Uses a pong deadline to detect dead connections: if nothing arrives
/// within [`WS_PONG_WAIT`] the connection is considered dead and the
/// loop exits (triggering the disconnect callback).
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingTable,
    bus: Arc<EventBus>,
    on_disconnect: DisconnectCallback,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    // Any incoming frame resets the deadline, not just Pong.
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout — connection dead, closing");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending, &bus).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {} // Binary — ignore
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Settle every outstanding request with a closed error now; the
    // responses they are waiting for can no longer arrive.
    pending.lock().await.clear();

    if let Some(cb) = on_disconnect.lock().await.as_ref() {
        cb();
    }
}

/// Handles a text frame from the bridge.
///
/// A message carrying a known request token settles that request; the
/// message is then broadcast on the bus regardless, so subscribers see
/// the full wire traffic, not just unsolicited pushes.
async fn handle_text_message(text: &str, pending: &PendingTable, bus: &Arc<EventBus>) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg = match messages::decode(text) {
        Ok(Some(m)) => m,
        Ok(None) => {
            debug!("unknown message type, ignoring");
            return;
        }
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(kind = ?msg.kind(), request_id = ?msg.request_id(), "received message");

    if let Some(id) = msg.request_id() {
        let mut map = pending.lock().await;
        if let Some(tx) = map.remove(id) {
            let _ = tx.send(msg.clone());
        }
    }

    bus.emit(&BridgeEvent::Wire(msg));
}
