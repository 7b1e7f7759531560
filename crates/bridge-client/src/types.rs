//! Public types for the bridge client.

use std::time::Duration;

use chromabridge_protocol::constants::{
    BRIDGE_DOWNLOAD_URL, CONNECT_ATTEMPT_TIMEOUT, DEFAULT_PORT, MessageKind,
    NOT_INSTALLED_AFTER_CYCLES, RECONNECT_BACKOFF_SECS, REQUEST_TIMEOUT,
};
use chromabridge_protocol::messages::BridgeMessage;

/// A candidate bridge endpoint: URL plus its transport security.
///
/// The list order is the fallback order on a cold start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub secure: bool,
}

impl Endpoint {
    /// Secure-transport candidate (`wss://`).
    pub fn secure(host: &str, port: u16) -> Self {
        Self {
            url: format!("wss://{host}:{port}"),
            secure: true,
        }
    }

    /// Plain-transport candidate (`ws://`), for local development contexts.
    pub fn plain(host: &str, port: u16) -> Self {
        Self {
            url: format!("ws://{host}:{port}"),
            secure: false,
        }
    }
}

/// Retry delay schedule after an unexpected disconnect.
///
/// Indexed by attempt count and clamped to the last entry once exhausted —
/// never unbounded growth.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            steps: RECONNECT_BACKOFF_SECS
                .iter()
                .map(|&s| Duration::from_secs(s))
                .collect(),
        }
    }
}

impl BackoffSchedule {
    /// Builds a schedule from explicit steps. An empty list falls back to
    /// the default table.
    pub fn new(steps: Vec<Duration>) -> Self {
        if steps.is_empty() {
            Self::default()
        } else {
            Self { steps }
        }
    }

    /// Returns the delay for a given attempt number (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.steps.len() - 1);
        self.steps[idx]
    }
}

/// Client configuration.
///
/// The timing and threshold numbers are policy defaults from the protocol
/// constants, not load-bearing behavior; override them per deployment.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Candidate endpoints, tried in order on a cold start.
    pub endpoints: Vec<Endpoint>,
    /// Per-candidate connection attempt budget.
    pub attempt_timeout: Duration,
    /// Per-request response budget, applied uniformly to all request kinds.
    pub request_timeout: Duration,
    /// Retry schedule after an unexpected disconnect.
    pub backoff: BackoffSchedule,
    /// Consecutive failed connection cycles before the not-installed
    /// signal is raised.
    pub not_installed_after: u32,
    /// Remediation URL carried by the not-installed signal.
    pub download_url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            // Secure first (for pages on a secure origin), plain fallback.
            endpoints: vec![
                Endpoint::secure("localhost", DEFAULT_PORT),
                Endpoint::plain("localhost", DEFAULT_PORT),
            ],
            attempt_timeout: CONNECT_ATTEMPT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            backoff: BackoffSchedule::default(),
            not_installed_after: NOT_INSTALLED_AFTER_CYCLES,
            download_url: BRIDGE_DOWNLOAD_URL.into(),
        }
    }
}

/// An event delivered to bus subscribers.
///
/// Wire messages and the locally synthesized connection/not-installed
/// transitions share one delivery path, so subscribers need no separate
/// notification mechanism.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// An inbound wire message (responses included — correlation and
    /// broadcast are not mutually exclusive).
    Wire(BridgeMessage),
    /// The socket came up or went down.
    Connection { connected: bool },
    /// Repeated full connection cycles failed; the bridge process is
    /// probably not installed.
    NotInstalled { download_url: String },
}

impl BridgeEvent {
    /// Returns the subscription key for this event.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Wire(msg) => msg.kind(),
            Self::Connection { .. } => MessageKind::Connection,
            Self::NotInstalled { .. } => MessageKind::BridgeNotInstalled,
        }
    }
}
