//! Config subcommand handlers.

use std::fmt::Write as _;
use std::io::BufRead;

use flumirror_config::{self as cfg, Config};

use crate::cli::{ConfigArgs, ConfigCommand};
use crate::error::CliError;

/// Format config for display, masking secrets.
fn format_config_redacted(config: &Config) -> String {
    let mut out = String::new();

    if let Some(ref default) = config.default_profile {
        let _ = writeln!(out, "default_profile = \"{default}\"");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[defaults]");
    let _ = writeln!(out, "prefix = \"{}\"", config.defaults.prefix);
    let _ = writeln!(out, "snapshot_interval = {}", config.defaults.snapshot_interval);
    let _ = writeln!(out, "timeout = {}", config.defaults.timeout);

    let mut names: Vec<_> = config.profiles.keys().collect();
    names.sort();
    for name in names {
        let p = &config.profiles[name];
        let _ = writeln!(out);
        let _ = writeln!(out, "[profiles.{name}]");
        let _ = writeln!(out, "manager = \"{}\"", p.manager);
        let _ = writeln!(out, "username = \"{}\"", p.username);
        if p.password.is_some() {
            let _ = writeln!(out, "password = \"****\"");
        }
        if let Some(ref env) = p.password_env {
            let _ = writeln!(out, "password_env = \"{env}\"");
        }
        let _ = writeln!(out, "broker = \"{}\"", p.broker);
        if let Some(ref login) = p.broker_login {
            let _ = writeln!(out, "broker_login = \"{login}\"");
        }
        if p.broker_passcode.is_some() {
            let _ = writeln!(out, "broker_passcode = \"****\"");
        }
        if let Some(ref env) = p.broker_passcode_env {
            let _ = writeln!(out, "broker_passcode_env = \"{env}\"");
        }
        if let Some(ref prefix) = p.prefix {
            let _ = writeln!(out, "prefix = \"{prefix}\"");
        }
        if let Some(ref flow) = p.flow {
            let _ = writeln!(out, "flow = \"{flow}\"");
        }
        if p.strict_flow {
            let _ = writeln!(out, "strict_flow = true");
        }
        if let Some(interval) = p.snapshot_interval {
            let _ = writeln!(out, "snapshot_interval = {interval}");
        }
        if !p.release_on.is_empty() {
            let moods: Vec<String> = p.release_on.iter().map(|m| format!("\"{m}\"")).collect();
            let _ = writeln!(out, "release_on = [{}]", moods.join(", "));
        }
        if let Some(translate) = p.translate_messages {
            let _ = writeln!(out, "translate_messages = {translate}");
        }
        if let Some(timeout) = p.timeout {
            let _ = writeln!(out, "timeout = {timeout}");
        }
    }

    out
}

fn read_password(from_stdin: bool) -> Result<String, CliError> {
    let password = if from_stdin {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        line.trim_end_matches(['\r', '\n']).to_owned()
    } else {
        rpassword::prompt_password("Manager password: ")?
    };

    if password.is_empty() {
        return Err(CliError::Validation {
            field: "password".into(),
            reason: "password cannot be empty".into(),
        });
    }
    Ok(password)
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            println!("{}", cfg::config_path().display());
            Ok(())
        }

        ConfigCommand::Show => {
            let config = cfg::load_config()?;
            print!("{}", format_config_redacted(&config));
            Ok(())
        }

        ConfigCommand::SetPassword { profile, stdin } => {
            let password = read_password(stdin)?;
            cfg::store_password(&profile, &password)?;
            eprintln!("Password for profile '{profile}' stored in system keyring");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use flumirror_config::{Defaults, Profile};

    use super::*;

    #[test]
    fn secrets_are_masked() {
        let config = Config {
            default_profile: Some("lab".into()),
            defaults: Defaults::default(),
            profiles: HashMap::from([(
                "lab".to_owned(),
                Profile {
                    manager: "ws://m:7531/manager".into(),
                    username: "admin".into(),
                    password: Some("hunter2".into()),
                    broker: "ws://b:61614/stomp".into(),
                    broker_passcode: Some("s3cret".into()),
                    release_on: vec!["sad".into()],
                    ..Profile::default()
                },
            )]),
        };

        let shown = format_config_redacted(&config);
        assert!(shown.contains("[profiles.lab]"));
        assert!(shown.contains("password = \"****\""));
        assert!(shown.contains("release_on = [\"sad\"]"));
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("s3cret"));
    }
}
