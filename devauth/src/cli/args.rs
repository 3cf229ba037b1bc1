//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Authenticate with an OAuth2 device code and call the API.
///
/// devauth logs in without a browser redirect: it prints a verification
/// page and a code, waits while you approve it elsewhere, then keeps the
/// tokens fresh for every call.
#[derive(Parser, Debug)]
#[command(name = "devauth")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to an alternative configuration file.
    #[arg(short, long, global = true, env = "DEVAUTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in with a device code.
    ///
    /// Prints a verification URL and code, then waits until the code is
    /// approved. Press Ctrl-C to stop waiting.
    Login {
        /// Skip opening the browser automatically.
        #[arg(long)]
        no_browser: bool,
    },

    /// Log out and remove stored credentials.
    Logout,

    /// Show current authentication status.
    Status,

    /// Call a remote API method.
    ///
    /// Parameters are given as key=value pairs.
    Call {
        /// Name of the remote method.
        method: String,

        /// Method parameters as key=value.
        #[arg(value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Print the raw HTTP status and body instead of the result.
        #[arg(long)]
        raw: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: ShellType,
    },
}

/// Shells supported for completion generation.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ShellType {
    Bash,
    Zsh,
    Fish,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}
