//! devauth CLI - device-code login and API calls from the terminal.

mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use devauth::config::settings::env;
use devauth::config::{load_config, load_config_from};
use devauth::Result;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(env::LOG_LEVEL).unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        if e.requires_reauth() {
            eprintln!("Run 'devauth login' to authenticate.");
        } else if e.is_retriable() {
            eprintln!("This looks temporary; run the command again.");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Commands::Login { no_browser } => cli::commands::handle_login(&config, no_browser).await,
        Commands::Logout => cli::commands::handle_logout(&config),
        Commands::Status => cli::commands::handle_status(&config),
        Commands::Call {
            method,
            params,
            raw,
        } => cli::commands::handle_call(&config, &method, params, raw).await,
        Commands::Completions { shell } => {
            cli::commands::handle_completions(shell);
            Ok(())
        },
    }
}
