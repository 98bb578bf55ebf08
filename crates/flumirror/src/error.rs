//! CLI error types with miette diagnostics.
//!
//! Maps core and config errors into user-facing errors with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use flumirror_config::ConfigError;
use flumirror_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const UPSTREAM_LOST: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not connect to manager at {url}")]
    #[diagnostic(
        code(flumirror::connection_failed),
        help(
            "Check that the manager is running and reachable.\n\
             Reason: {reason}"
        )
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("Manager connection lost")]
    #[diagnostic(
        code(flumirror::upstream_lost),
        help("Pass --reconnect-after <SECS> to keep running across manager restarts.")
    )]
    UpstreamLost,

    // ── Authentication ───────────────────────────────────────────────

    #[error("Manager refused the connection for profile '{profile}'")]
    #[diagnostic(
        code(flumirror::auth_failed),
        help(
            "Check your user and password.\n\
             Manager said: {message}\n\
             Run: flumirror config set-password --profile {profile}"
        )
    )]
    AuthFailed { profile: String, message: String },

    #[error("No manager password configured for profile '{profile}'")]
    #[diagnostic(
        code(flumirror::no_credentials),
        help(
            "Store one with: flumirror config set-password --profile {profile}\n\
             Or set FLUMIRROR_PASSWORD."
        )
    )]
    NoCredentials { profile: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(flumirror::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Or pass --manager and --broker to run without a profile."
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Configuration file not found")]
    #[diagnostic(
        code(flumirror::no_config),
        help(
            "Pass --manager and --broker, or create a profile.\n\
             Expected at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(flumirror::validation))]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(code(flumirror::config))]
    Config(ConfigError),

    // ── Bridge ───────────────────────────────────────────────────────

    #[error("Bridge error: {0}")]
    #[diagnostic(code(flumirror::bridge))]
    Bridge(CoreError),

    // ── IO ───────────────────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::UpstreamLost => exit_code::UPSTREAM_LOST,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::ProfileNotFound { .. } | Self::NoConfig { .. } | Self::Validation { .. } => {
                exit_code::USAGE
            }
            Self::Config(_) | Self::Bridge(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }

    /// Classify a failed connect to the manager at `url`.
    pub fn from_connect(err: CoreError, profile: &str, url: &str) -> Self {
        match err {
            CoreError::ConnectionRefused { message } => Self::AuthFailed {
                profile: profile.into(),
                message,
            },
            CoreError::ConnectionFailed { reason } => Self::ConnectionFailed {
                url: url.into(),
                reason,
            },
            CoreError::Timeout { timeout_secs } => Self::ConnectionFailed {
                url: url.into(),
                reason: format!("no answer within {timeout_secs}s"),
            },
            CoreError::UpstreamLost => Self::UpstreamLost,
            other => Self::Bridge(other),
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::NoCredentials { profile } => Self::NoCredentials { profile },
            ConfigError::UnknownProfile { name } => Self::ProfileNotFound {
                name,
                available: String::new(),
            },
            ConfigError::Io(e) => Self::Io(e),
            other => Self::Config(other),
        }
    }
}
