use thiserror::Error;

/// Top-level error type for the `flumirror-api` crate.
///
/// Covers every failure mode across both transports: the upstream
/// manager link and the pub/sub broker link. `flumirror-core` maps these
/// into its own domain taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// The manager accepted the socket but refused the session
    /// (bad credentials, permission denied).
    #[error("Manager refused connection: {message}")]
    ConnectionRefused { message: String },

    /// The transport could not be established or broke during the handshake.
    #[error("Connection to manager failed: {message}")]
    ConnectionFailed { message: String },

    /// The upstream link is gone; outstanding requests are abandoned.
    #[error("Upstream disconnected")]
    Disconnected,

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Remote operations ───────────────────────────────────────────
    /// The manager executed the request and reported a failure.
    #[error("Remote call '{method}' failed: {message}")]
    Remote { method: String, message: String },

    /// The remote returned something other than what the call promises
    /// (e.g. a scalar where a state node was expected).
    #[error("Unexpected reply to '{method}': {message}")]
    UnexpectedReply { method: String, message: String },

    // ── Broker ──────────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// The broker link is down; the frame was not queued.
    #[error("Broker unavailable")]
    BrokerUnavailable,

    /// The broker answered with a STOMP `ERROR` frame.
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// A STOMP frame could not be parsed.
    #[error("Malformed frame: {0}")]
    Frame(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// JSON serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which way an initial connection attempt failed.
///
/// Only connection failures are classified; every other error is
/// reported as [`ConnectFailureKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureKind {
    Refused,
    TransportFailed,
    Other,
}

impl Error {
    pub fn connect_failure_kind(&self) -> ConnectFailureKind {
        match self {
            Self::ConnectionRefused { .. } => ConnectFailureKind::Refused,
            Self::ConnectionFailed { .. } | Self::WebSocketConnect(_) | Self::Timeout { .. } => {
                ConnectFailureKind::TransportFailed
            }
            _ => ConnectFailureKind::Other,
        }
    }

    /// Returns `true` if this error means the link itself is gone, as
    /// opposed to one operation failing.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::WebSocketClosed { .. } | Self::BrokerUnavailable
        )
    }
}
