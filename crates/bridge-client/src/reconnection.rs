//! Reconnection scheduling after an unexpected disconnect.
//!
//! Contains the shared [`ClientContext`], the session callback setup,
//! and the backoff-driven retry loop. Retries are an explicit loop with
//! a cancellation token, so a forced reconnect or shutdown can always
//! stop a scheduled attempt before it fires.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chromabridge_protocol::messages::BridgeMessage;

use crate::dispatcher::EventBus;
use crate::negotiator;
use crate::session::WsSession;
use crate::state::{self, BridgeSnapshot, StateEvent};
use crate::types::{BridgeConfig, BridgeEvent};

/// Shared state passed to free functions for session callback setup and
/// reconnection. Avoids threading seven separate Arc parameters.
#[derive(Clone)]
pub(crate) struct ClientContext {
    pub(crate) config: Arc<BridgeConfig>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) session: Arc<Mutex<Option<WsSession>>>,
    pub(crate) state: Arc<std::sync::RwLock<BridgeSnapshot>>,
    pub(crate) cached_url: Arc<Mutex<Option<String>>>,
    pub(crate) retry_cancel: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    pub(crate) manual_close: Arc<AtomicBool>,
}

/// Runs one event through the state machine. The write lock is the
/// single mutation path for the snapshot; a poisoned lock is recovered,
/// not skipped — a panicking reader must not make the machine start
/// dropping transitions.
pub(crate) fn apply(state: &std::sync::RwLock<BridgeSnapshot>, event: StateEvent) {
    let mut s = state
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    state::reduce(&mut s, event);
}

/// Cancels any pending retry and drops its token.
pub(crate) fn cancel_pending_retry(
    retry_cancel: &std::sync::Mutex<Option<CancellationToken>>,
) {
    if let Ok(mut guard) = retry_cancel.lock()
        && let Some(token) = guard.take()
    {
        token.cancel();
    }
}

/// Runs one full negotiation cycle and, on success, installs the new
/// session.
///
/// A failed cycle bumps the consecutive-failure count; crossing the
/// configured threshold raises the not-installed signal exactly once
/// (the flag stays latched until a successful connection clears it).
pub(crate) async fn establish_session(ctx: &ClientContext) -> Result<(), crate::ClientError> {
    // Only one session may exist at a time. A stale caller (a retry that
    // lost a race with a direct connect) must not open a second socket
    // over a live one.
    {
        let guard = ctx.session.lock().await;
        if guard.as_ref().is_some_and(|s| s.is_open()) {
            debug!("session already open, skipping connection cycle");
            return Ok(());
        }
    }

    let cached = ctx.cached_url.lock().await.clone();
    let result = negotiator::run_cycle(
        &ctx.config.endpoints,
        cached.as_deref(),
        ctx.config.attempt_timeout,
    )
    .await;

    match result {
        Ok((stream, url)) => {
            let session = WsSession::start(
                stream,
                url.clone(),
                ctx.bus.clone(),
                ctx.config.request_timeout,
            );
            setup_session_callbacks(&session, ctx.clone()).await;

            *ctx.cached_url.lock().await = Some(url.clone());
            *ctx.session.lock().await = Some(session);

            apply(&ctx.state, StateEvent::BridgeUp);
            ctx.bus.emit(&BridgeEvent::Connection { connected: true });
            info!(%url, "bridge connected");

            // Seed the device axis without waiting for the first push.
            tokio::spawn(issue_status_probe(ctx.clone()));
            Ok(())
        }
        Err(e) => {
            let raise = {
                let mut s = ctx
                    .state
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state::reduce(&mut s, StateEvent::CycleFailed);
                s.bridge.consecutive_cycle_failures >= ctx.config.not_installed_after
                    && !s.bridge.not_installed
            };
            if raise {
                apply(&ctx.state, StateEvent::NotInstalled);
                ctx.bus.emit(&BridgeEvent::NotInstalled {
                    download_url: ctx.config.download_url.clone(),
                });
                warn!("bridge looks not installed, raised signal");
            }
            Err(e)
        }
    }
}

/// Queries device status on a fresh connection and folds the answer
/// into the snapshot.
async fn issue_status_probe(ctx: ClientContext) {
    let handle = {
        let guard = ctx.session.lock().await;
        match guard.as_ref() {
            Some(session) => session.request_handle(),
            None => return,
        }
    };

    match handle
        .send_request(|id| BridgeMessage::DeviceStatus { request_id: id })
        .await
    {
        Ok(BridgeMessage::DeviceStatusResponse { device, .. }) => {
            apply(&ctx.state, StateEvent::StatusReported(device));
        }
        Ok(other) => warn!(kind = ?other.kind(), "unexpected status probe response"),
        Err(e) => debug!("status probe failed: {e}"),
    }
}

/// Sets up the disconnect callback on a new session.
///
/// An intentional close (explicit disconnect or forced reconnect) is a
/// no-op here; the initiator already updated the state. An unexpected
/// drop marks the bridge down and spawns the retry loop.
pub(crate) async fn setup_session_callbacks(session: &WsSession, ctx: ClientContext) {
    let intentional = session.intentional_close_flag();
    session
        .set_disconnect_callback(Box::new(move || {
            if intentional.load(Ordering::Relaxed) || ctx.manual_close.load(Ordering::Relaxed) {
                debug!("session closed intentionally");
                return;
            }

            apply(&ctx.state, StateEvent::BridgeDown);
            ctx.bus.emit(&BridgeEvent::Connection { connected: false });

            // Drop the dead session if nothing else holds the slot.
            if let Ok(mut guard) = ctx.session.try_lock() {
                *guard = None;
            }

            let cancel = CancellationToken::new();
            cancel_pending_retry(&ctx.retry_cancel);
            if let Ok(mut guard) = ctx.retry_cancel.lock() {
                *guard = Some(cancel.clone());
            }

            tokio::spawn(retry_loop(ctx.clone(), cancel));
        }))
        .await;
}

/// Retry loop over the backoff schedule.
///
/// Returns a boxed future to break the recursive type cycle with
/// `setup_session_callbacks` (which spawns this function from its
/// disconnect callback). Runs until a session is established or the
/// token is cancelled; the schedule clamps to its last step, so the
/// loop never gives up on its own.
pub(crate) fn retry_loop(
    ctx: ClientContext,
    cancel: CancellationToken,
) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            let delay = ctx.config.backoff.delay_for_attempt(attempt);

            info!(
                attempt,
                delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
                "reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("retry loop cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match establish_session(&ctx).await {
                Ok(()) => {
                    info!(attempt, "reconnected successfully");
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }

            if cancel.is_cancelled() {
                return;
            }
        }

        // Clean up the token when this loop finished on its own. Every
        // replacement site cancels first, so a live token here is ours.
        if !cancel.is_cancelled()
            && let Ok(mut guard) = ctx.retry_cancel.lock()
        {
            *guard = None;
        }
    })
}
