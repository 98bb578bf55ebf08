//! Configuration for the flumirror bridge.
//!
//! TOML profiles, credential resolution (env + keyring + plaintext), and
//! translation into the runtime configs the transports and the bridge
//! take. The binary layers its command-line overrides on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use flumirror_api::{BrokerConfig, ManagerConfig, ReconnectConfig};
use flumirror_core::{BridgeConfig, DetailRelease, FlowSelection, Mood};

/// Service name under which secrets are stored in the system keyring.
pub const KEYRING_SERVICE: &str = "flumirror";

/// Overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "FLUMIRROR_CONFIG";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found")]
    UnknownProfile { name: String },

    #[error("no manager password configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named on the command line.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named manager/broker pairs.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<(String, &Profile), ConfigError> {
        let name = name
            .map(str::to_owned)
            .or_else(|| self.default_profile.clone())
            .unwrap_or_else(|| "default".into());
        self.profiles
            .get(&name)
            .map(|profile| (name.clone(), profile))
            .ok_or(ConfigError::UnknownProfile { name })
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Destination prefix for every outbound frame.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Seconds between full snapshots. Zero publishes only on connect.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// Manager request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            snapshot_interval: default_snapshot_interval(),
            timeout: default_timeout(),
        }
    }
}

fn default_prefix() -> String {
    "/flumotion".into()
}
fn default_snapshot_interval() -> u64 {
    5
}
fn default_timeout() -> u64 {
    30
}

/// A named manager/broker pair.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Manager websocket endpoint (e.g., "ws://localhost:7531/manager").
    pub manager: String,

    #[serde(default = "default_username")]
    pub username: String,

    /// Manager password (plaintext; prefer keyring or env var).
    pub password: Option<String>,

    /// Environment variable name containing the manager password.
    pub password_env: Option<String>,

    /// STOMP broker websocket endpoint (e.g., "ws://localhost:61614/stomp").
    pub broker: String,

    pub broker_login: Option<String>,

    /// Broker passcode (plaintext; prefer keyring or env var).
    pub broker_passcode: Option<String>,

    pub broker_passcode_env: Option<String>,

    /// Override the destination prefix.
    pub prefix: Option<String>,

    /// Flow to mirror. Defaults to "default".
    pub flow: Option<String>,

    /// Mirror nothing while the named flow is absent instead of falling
    /// back to the first flow.
    #[serde(default)]
    pub strict_flow: bool,

    pub snapshot_interval: Option<u64>,

    /// Moods that drop a component's detail subscription. Empty means any
    /// unhappy mood; `["never"]` keeps subscriptions regardless of mood.
    #[serde(default)]
    pub release_on: Vec<String>,

    pub translate_messages: Option<bool>,

    pub timeout: Option<u64>,
}

fn default_username() -> String {
    "user".into()
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path: `FLUMIRROR_CONFIG`, then platform
/// conventions.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    ProjectDirs::from("org", "flumotion", "flumirror").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("flumirror");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` with the `FLUMIRROR_` environment overlay. A missing
/// file yields the defaults.
///
/// Nested keys use a double underscore:
/// `FLUMIRROR_PROFILES__LAB__MANAGER=ws://...`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("FLUMIRROR_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(&config_path(), cfg)
}

pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

fn keyring_entry(profile_name: &str, secret: &str) -> Result<keyring::Entry, ConfigError> {
    Ok(keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/{secret}"))?)
}

/// Resolve a secret: named env var, then keyring, then plaintext.
fn resolve_secret(
    env_name: Option<&str>,
    profile_name: &str,
    secret: &str,
    plaintext: Option<&str>,
) -> Option<SecretString> {
    if let Some(val) = env_name.and_then(|name| std::env::var(name).ok()) {
        return Some(SecretString::from(val));
    }

    if let Ok(pw) = keyring_entry(profile_name, secret).and_then(|entry| entry.get_password().map_err(ConfigError::from)) {
        return Some(SecretString::from(pw));
    }

    plaintext.map(|pw| SecretString::from(pw.to_owned()))
}

/// Resolve the manager password from the credential chain.
pub fn resolve_password(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    resolve_secret(
        profile.password_env.as_deref(),
        profile_name,
        "password",
        profile.password.as_deref(),
    )
    .ok_or_else(|| ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Resolve the broker passcode. Brokers may allow anonymous access, so
/// absence is not an error.
pub fn resolve_broker_passcode(profile: &Profile, profile_name: &str) -> Option<SecretString> {
    resolve_secret(
        profile.broker_passcode_env.as_deref(),
        profile_name,
        "broker-passcode",
        profile.broker_passcode.as_deref(),
    )
}

/// Store the manager password for `profile_name` in the system keyring.
pub fn store_password(profile_name: &str, password: &str) -> Result<(), ConfigError> {
    keyring_entry(profile_name, "password")?.set_password(password)?;
    Ok(())
}

// ── Translation into runtime configs ────────────────────────────────

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL: {raw}"),
    })
}

/// Build a `ManagerConfig` from a profile.
pub fn profile_to_manager_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
) -> Result<ManagerConfig, ConfigError> {
    Ok(ManagerConfig {
        url: parse_url("manager", &profile.manager)?,
        username: profile.username.clone(),
        password: resolve_password(profile, profile_name)?,
        timeout: Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout)),
    })
}

/// Build a `BrokerConfig` subscribed to `bridge`'s inbound destinations.
pub fn profile_to_broker_config(
    profile: &Profile,
    profile_name: &str,
    bridge: &BridgeConfig,
) -> Result<BrokerConfig, ConfigError> {
    Ok(BrokerConfig {
        url: parse_url("broker", &profile.broker)?,
        host: None,
        login: profile.broker_login.clone(),
        passcode: resolve_broker_passcode(profile, profile_name),
        subscriptions: bridge.inbound_destinations(),
        reconnect: ReconnectConfig::default(),
    })
}

/// Build the bridge's runtime config from a profile.
pub fn profile_to_bridge_config(profile: &Profile, defaults: &Defaults) -> Result<BridgeConfig, ConfigError> {
    let prefix = profile.prefix.as_deref().unwrap_or(&defaults.prefix);
    if !prefix.starts_with('/') {
        return Err(ConfigError::Validation {
            field: "prefix".into(),
            reason: format!("destination prefix must start with '/', got '{prefix}'"),
        });
    }

    let mut bridge = BridgeConfig::with_prefix(prefix);
    let flow = profile.flow.clone().unwrap_or_else(|| "default".into());
    bridge.flow = if profile.strict_flow {
        FlowSelection::Named(flow)
    } else {
        FlowSelection::NamedOrFirst(flow)
    };
    bridge.snapshot_interval =
        Duration::from_secs(profile.snapshot_interval.unwrap_or(defaults.snapshot_interval));
    bridge.detail_release = parse_release(&profile.release_on)?;
    if let Some(translate) = profile.translate_messages {
        bridge.translate_messages = translate;
    }
    Ok(bridge)
}

fn parse_release(moods: &[String]) -> Result<DetailRelease, ConfigError> {
    match moods {
        [] => Ok(DetailRelease::AnyUnhappy),
        [only] if only.eq_ignore_ascii_case("never") => Ok(DetailRelease::Never),
        moods => moods
            .iter()
            .map(|raw| {
                raw.parse::<Mood>().map_err(|_| ConfigError::Validation {
                    field: "release_on".into(),
                    reason: format!("unknown mood '{raw}'"),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(DetailRelease::Moods),
    }
}
