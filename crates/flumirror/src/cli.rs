//! Clap derive structures for the `flumirror` CLI.

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// flumirror -- mirror streaming-server component state onto STOMP
#[derive(Debug, Parser)]
#[command(
    name = "flumirror",
    version,
    about = "Mirror a streaming-server manager's component state onto a STOMP broker",
    long_about = "Connects to a streaming-server manager, keeps a live copy of the\n\
        components of one flow, and publishes snapshots, change events and\n\
        per-component detail state to a STOMP broker. Poll requests and\n\
        component commands arriving on the broker are routed back upstream.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, env = "FLUMIRROR_LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge until interrupted or the manager connection is lost
    Run(RunArgs),

    /// Inspect and edit the configuration
    #[command(alias = "cfg")]
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Run ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Profile to use
    #[arg(long, short = 'p', env = "FLUMIRROR_PROFILE")]
    pub profile: Option<String>,

    /// Manager websocket URL (overrides profile)
    #[arg(long, short = 'm', env = "FLUMIRROR_MANAGER")]
    pub manager: Option<String>,

    /// Broker websocket URL (overrides profile)
    #[arg(long, short = 'b', env = "FLUMIRROR_BROKER")]
    pub broker: Option<String>,

    /// Manager username (overrides profile)
    #[arg(long, short = 'u', env = "FLUMIRROR_USER")]
    pub user: Option<String>,

    /// Manager password
    #[arg(long, env = "FLUMIRROR_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Destination prefix (e.g. /flumotion)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Flow to mirror
    #[arg(long)]
    pub flow: Option<String>,

    /// Mirror nothing while the flow is absent instead of falling back to the first flow
    #[arg(long)]
    pub strict_flow: bool,

    /// Seconds between full snapshots (0: only on connect)
    #[arg(long)]
    pub snapshot_interval: Option<u64>,

    /// Reconnect to the manager this many seconds after losing it,
    /// instead of exiting
    #[arg(long, value_name = "SECS")]
    pub reconnect_after: Option<u64>,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the configuration with secrets masked
    Show,

    /// Store a profile's manager password in the system keyring
    SetPassword {
        /// Profile to store the password for
        #[arg(long, short = 'p', default_value = "default")]
        profile: String,

        /// Read the password from stdin instead of prompting
        #[arg(long)]
        stdin: bool,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
