use clap::{Parser, Subcommand};

pub fn get_version() -> &'static str {
    const BASE_VERSION: &str = env!("CARGO_PKG_VERSION");

    // Tagged release builds report just the tag
    if let Some(tag) = option_env!("NEWTSVC_GIT_TAG") {
        return tag;
    }

    let commit = option_env!("NEWTSVC_GIT_COMMIT").unwrap_or("unknown");

    // Leaked once at startup for clap's &'static str
    let version = format!("v{}-{}", BASE_VERSION, commit);
    Box::leak(version.into_boxed_str())
}

#[derive(Parser)]
#[command(name = "newtsvc")]
#[command(about = "Keeps the Newt tunnel client running and up to date")]
#[command(version = get_version(), propagate_version = true)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Increase verbosity (use multiple times for more detail)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Reduce output to errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Finish a staged self-update: wait for PID, then install into DIR
    #[arg(long, num_args = 2, value_names = ["DIR", "PID"], hide = true)]
    pub apply_update: Option<Vec<String>>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Supervise the Newt client until stopped (default)
    Run,

    /// Show installed versions, configuration and paths
    Status,

    /// Check for Newt and newtsvc updates
    Check {
        /// Consider prerelease builds of Newt
        #[arg(long)]
        prerelease: bool,
    },

    /// Download and install the latest Newt client
    UpdateClient {
        /// Consider prerelease builds
        #[arg(long)]
        prerelease: bool,
        /// Reinstall even when the installed tag is current
        #[arg(long)]
        force: bool,
    },

    /// Update newtsvc itself to the latest release
    SelfUpdate,

    /// Manage newtsvc's configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the current version
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigAction {
    /// Get a configuration setting
    Get {
        /// Key to get (if omitted, shows all settings)
        key: Option<String>,
    },
    /// Set a configuration setting
    Set {
        /// Key and value (e.g., 'check-interval-secs=30' or 'endpoint https://pangolin.example.com')
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
    },
    /// Reset a configuration setting to its default
    Unset {
        /// Key to unset (e.g., 'secret')
        key: String,
    },
    /// Show full configuration (secret redacted)
    Show {
        /// Output format (json, yaml, plain)
        #[arg(long, default_value = "json")]
        format: String,
    },
}
