// ── Core error types ──
//
// Domain errors from flumirror-core. Transport errors from flumirror-api
// are translated by the `From<flumirror_api::Error>` impl so callers
// never match on wire details.

use flumirror_api::ConnectFailureKind;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Manager refused connection. Check your user and password. ({message})")]
    ConnectionRefused { message: String },

    #[error("Connection to manager failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Manager request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Not connected to the manager")]
    NotConnected,

    #[error("Already connected or connecting")]
    AlreadyConnected,

    #[error("Lost connection to the manager")]
    UpstreamLost,

    // ── Mirror errors ────────────────────────────────────────────────
    #[error("Component not found: {name}")]
    ComponentNotFound { name: String },

    #[error("Detail subscription for {name} was released while it was being fetched")]
    DetailReleased { name: String },

    #[error("Command rejected: {0}")]
    Rejected(#[from] RouteError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    // ── Remote and broker errors ─────────────────────────────────────
    #[error("Remote call '{method}' failed: {message}")]
    Remote { method: String, message: String },

    #[error("Broker error: {message}")]
    Broker { message: String },

    // ── Misc ─────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Bridge has shut down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Classify a failed connection attempt for the operator.
    pub fn connect_failure_kind(&self) -> ConnectFailureKind {
        match self {
            Self::ConnectionRefused { .. } => ConnectFailureKind::Refused,
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => ConnectFailureKind::TransportFailed,
            _ => ConnectFailureKind::Other,
        }
    }
}

impl From<flumirror_api::Error> for CoreError {
    fn from(err: flumirror_api::Error) -> Self {
        use flumirror_api::Error as Api;

        match err {
            Api::ConnectionRefused { message } => Self::ConnectionRefused { message },
            Api::ConnectionFailed { message } | Api::WebSocketConnect(message) => {
                Self::ConnectionFailed { reason: message }
            }
            Api::Timeout { timeout_secs } => Self::Timeout { timeout_secs },
            Api::Disconnected | Api::WebSocketClosed { .. } => Self::UpstreamLost,
            Api::InvalidUrl(e) => Self::Config {
                message: e.to_string(),
            },
            Api::Remote { method, message } | Api::UnexpectedReply { method, message } => {
                Self::Remote { method, message }
            }
            Api::BrokerUnavailable => Self::Broker {
                message: "broker unavailable".into(),
            },
            Api::Broker { message } | Api::Frame(message) => Self::Broker { message },
            Api::Deserialization { message, .. } => Self::Internal(message),
            Api::Serialization(e) => Self::Internal(e.to_string()),
        }
    }
}

/// A command message that fails validation. No remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{command}' requires '{field}'")]
    MissingField { command: String, field: &'static str },

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("component not found: {0}")]
    ComponentNotFound(String),

    #[error("selector matched no components")]
    NoMatch,

    #[error("not connected")]
    NotConnected,
}

/// A remote value with no JSON projection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("'{key}' holds a nested state node")]
    NestedNode { key: String },
}
