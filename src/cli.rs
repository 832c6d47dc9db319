use crate::versions::Dimension;
use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "comfy-launcher",
    about = "Launch, supervise and update a ComfyUI server",
    version
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the server in the foreground and stop it on Ctrl-C
    Run,
    /// Start the server and detach once it is running
    Start,
    /// Stop the server, including instances started elsewhere
    Stop,
    /// Start the server if idle, stop it if running
    Toggle,
    /// Show whether the server is running
    Status,
    /// Show version facts
    Versions {
        /// Limit the refresh to these dimensions
        #[arg(long = "only", value_name = "DIMENSION")]
        only: Vec<Dimension>,
    },
    /// Fast-forward the ComfyUI checkout to the latest upstream commit
    Update {
        #[arg(short, long)]
        yes: bool,
        /// Also upgrade the frontend package
        #[arg(long)]
        frontend: bool,
        /// Also upgrade the workflow templates package
        #[arg(long)]
        templates: bool,
    },
    /// Check out a specific commit (detaches HEAD)
    Checkout {
        hash: String,
        #[arg(short, long)]
        yes: bool,
    },
    /// List recent commits
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Show which git executable is in use
    Git {
        /// Resolve again instead of using the cached result
        #[arg(long)]
        refresh: bool,
    },
    /// Install or upgrade a package in the server's interpreter
    Upgrade {
        package: String,
        /// Package index URL, overriding the configured mirror
        #[arg(long)]
        index: Option<String>,
    },
    /// Inspect or change the launcher configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Open the interactive dashboard
    #[command(visible_alias = "tui")]
    Dashboard,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Set `section.key` to a value
    Set { key: String, value: String },
    /// Print the configuration file path
    Path,
}
