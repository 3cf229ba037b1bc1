//! Authentication command handlers.

use chrono::Local;
use tokio_util::sync::CancellationToken;

use devauth::config::DevauthConfig;
use devauth::{AuthSession, DevauthError, Result, SessionState};

/// Handle the `devauth login` command.
pub async fn handle_login(config: &DevauthConfig, no_browser: bool) -> Result<()> {
    let mut session = config.session()?;

    let authorization = session.begin_authentication().await?;

    println!("To authenticate, please visit:");
    println!();
    println!("  {}", authorization.verification_url);
    println!();
    println!("And enter code: {}", authorization.device_code);
    println!();

    if !no_browser {
        match open::that(&authorization.verification_url) {
            Ok(()) => println!("Browser opened automatically."),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to open browser");
                println!("Could not open browser. Please visit the URL manually.");
            },
        }
        println!();
    }

    println!("Waiting for authorization... (press Ctrl-C to cancel)");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let outcome = await_approval(&mut session, &cancel).await;
    watcher.abort();
    outcome
}

/// Polls until approval; a cancelled wait surfaces as [`DevauthError::Cancelled`].
async fn await_approval(session: &mut AuthSession, cancel: &CancellationToken) -> Result<()> {
    match session.complete_authentication_with(cancel).await {
        Ok(()) => {
            println!();
            println!("Successfully logged in.");
            Ok(())
        },
        Err(DevauthError::Cancelled) => {
            println!();
            println!("Login cancelled.");
            Err(DevauthError::Cancelled)
        },
        Err(e) => Err(e),
    }
}

/// Handle the `devauth logout` command.
pub fn handle_logout(config: &DevauthConfig) -> Result<()> {
    let mut store = config.credential_store()?;

    if store.state()? == SessionState::Unauthenticated {
        println!("Not currently logged in.");
    } else {
        store.logout()?;
        println!("Successfully logged out.");
    }

    Ok(())
}

/// Handle the `devauth status` command.
pub fn handle_status(config: &DevauthConfig) -> Result<()> {
    let store = config.credential_store()?;
    let endpoints = config.endpoints()?;

    match store.state()? {
        SessionState::Authenticated => {
            println!("Logged in");
            println!();
            println!("  API endpoint: {}", endpoints.api);
            if let Some(expires_at) = store.access_token_expires_at()? {
                println!(
                    "  Token expires: {}",
                    expires_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
                );
            }
        },
        SessionState::Refreshing => {
            println!("Access token expired");
            println!();
            println!("  It will be refreshed on the next call.");
        },
        SessionState::Authenticating => {
            println!("Login in progress");
            println!();
            println!("Run 'devauth login' to start over.");
        },
        SessionState::Unauthenticated => {
            println!("Not logged in");
            println!();
            println!("Run 'devauth login' to authenticate.");
        },
    }

    Ok(())
}
