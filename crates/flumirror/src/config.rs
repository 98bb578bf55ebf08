//! Command-line overrides on top of the shared config crate.
//!
//! The bridge and the transports only ever see the runtime configs built
//! here.

use secrecy::SecretString;

use flumirror_api::{BrokerConfig, ManagerConfig};
use flumirror_config::{self as cfg, Config, Profile};
use flumirror_core::BridgeConfig;

use crate::cli::RunArgs;
use crate::error::CliError;

/// Everything `run` needs, resolved.
pub struct RunSettings {
    pub profile: String,
    pub manager: ManagerConfig,
    pub broker: BrokerConfig,
    pub bridge: BridgeConfig,
}

/// Resolve the active profile name from flags and config.
fn active_profile_name(args: &RunArgs, config: &Config) -> String {
    args.profile
        .clone()
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// Merge the config file, the selected profile and command-line flags.
pub fn resolve_run_settings(args: &RunArgs) -> Result<RunSettings, CliError> {
    let config = cfg::load_config()?;
    let name = active_profile_name(args, &config);

    let mut profile = match config.profiles.get(&name) {
        Some(profile) => profile.clone(),
        // An explicitly named profile must exist.
        None if args.profile.is_some() => {
            let mut available: Vec<&str> = config.profiles.keys().map(String::as_str).collect();
            available.sort_unstable();
            return Err(CliError::ProfileNotFound {
                name,
                available: if available.is_empty() {
                    "(none)".into()
                } else {
                    available.join(", ")
                },
            });
        }
        None => {
            if args.manager.is_none() || args.broker.is_none() {
                return Err(CliError::NoConfig {
                    path: cfg::config_path().display().to_string(),
                });
            }
            Profile {
                username: "user".into(),
                ..Profile::default()
            }
        }
    };
    apply_overrides(&mut profile, args);

    let bridge = cfg::profile_to_bridge_config(&profile, &config.defaults)?;
    let mut manager = cfg::profile_to_manager_config(&profile, &name, &config.defaults)?;
    if let Some(ref password) = args.password {
        manager.password = SecretString::from(password.clone());
    }
    let broker = cfg::profile_to_broker_config(&profile, &name, &bridge)?;

    Ok(RunSettings {
        profile: name,
        manager,
        broker,
        bridge,
    })
}

fn apply_overrides(profile: &mut Profile, args: &RunArgs) {
    if let Some(ref manager) = args.manager {
        profile.manager.clone_from(manager);
    }
    if let Some(ref broker) = args.broker {
        profile.broker.clone_from(broker);
    }
    if let Some(ref user) = args.user {
        profile.username.clone_from(user);
    }
    // Replaced by the flag after translation.
    if args.password.is_some() && profile.password.is_none() {
        profile.password.clone_from(&args.password);
    }
    if args.prefix.is_some() {
        profile.prefix.clone_from(&args.prefix);
    }
    if args.flow.is_some() {
        profile.flow.clone_from(&args.flow);
    }
    if args.strict_flow {
        profile.strict_flow = true;
    }
    if args.snapshot_interval.is_some() {
        profile.snapshot_interval = args.snapshot_interval;
    }
}
