//! Transport negotiation — picks a working candidate URL.
//!
//! Candidates are tried strictly in order, secure transport first, with
//! a bounded per-attempt budget so a hung handshake cannot stall the
//! cycle. A previously successful URL is probed once before the full
//! list is walked again.

use std::time::Duration;

use tracing::{debug, warn};

use chromabridge_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ClientError;
use crate::session::WsStream;
use crate::types::Endpoint;

/// Opens a WebSocket to a single candidate URL within `attempt_timeout`.
pub(crate) async fn attempt(url: &str, attempt_timeout: Duration) -> Result<WsStream, ClientError> {
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);

    let connect = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false);
    match tokio::time::timeout(attempt_timeout, connect).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(ClientError::Ws(e)),
        Err(_) => Err(ClientError::AttemptTimeout),
    }
}

/// Runs one full negotiation cycle over the candidate list.
///
/// If `cached` names a URL that worked before, it is tried first; on
/// failure the cycle falls through to the full ordered list, so a
/// stale cache costs one attempt, never a dead end.
pub(crate) async fn run_cycle(
    endpoints: &[Endpoint],
    cached: Option<&str>,
    attempt_timeout: Duration,
) -> Result<(WsStream, String), ClientError> {
    if endpoints.is_empty() {
        return Err(ClientError::NoEndpoints);
    }

    if let Some(url) = cached {
        debug!(%url, "trying cached URL first");
        match attempt(url, attempt_timeout).await {
            Ok(stream) => return Ok((stream, url.to_string())),
            Err(e) => debug!(%url, "cached URL failed: {e}"),
        }
    }

    for endpoint in endpoints {
        debug!(url = %endpoint.url, secure = endpoint.secure, "trying candidate");
        match attempt(&endpoint.url, attempt_timeout).await {
            Ok(stream) => return Ok((stream, endpoint.url.clone())),
            Err(e) => warn!(url = %endpoint.url, "candidate failed: {e}"),
        }
    }

    Err(ClientError::AllEndpointsFailed)
}
