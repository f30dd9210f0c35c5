//! termgate - authenticated gateway for terminal and editor sessions.
//!
//! Usage:
//!   termgate set-password --username me     # Create the login credential
//!   termgate serve [--port 7680]            # Start the gateway

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use termgate::auth::{CredentialStore, Credentials};
use termgate::binaries::Binaries;
use termgate::config::{default_state_dir, GatewayConfig, ServeArgs};
use termgate::state::AppState;
use termgate::{http_server, persist};
use tracing::info;
use tracing_subscriber::EnvFilter;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "termgate")]
#[command(about = "Single-host gateway for terminal and editor sessions")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway
    Serve(ServeArgs),
    /// Create or replace the login credential
    SetPassword {
        #[arg(long)]
        username: String,

        /// Read from the environment or prompt when omitted
        #[arg(long, env = "TERMGATE_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        #[arg(long, env = "TERMGATE_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("termgate=info,tower_http=info")),
        )
        .init();

    match Args::parse().command {
        Commands::Serve(args) => serve(args).await,
        Commands::SetPassword {
            username,
            password,
            state_dir,
        } => set_password(username, password, state_dir).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = GatewayConfig::from_args(args)?;
    info!(state_dir = %config.state_dir.display(), "Starting termgate");

    let credentials = CredentialStore::load(&config.credentials_path())
        .await
        .context("cannot serve without a credential record")?;
    let binaries = Arc::new(Binaries::discover());
    let state = AppState::new(config, credentials, binaries).await?;

    state.processes.recover(&state.registry, &state.tools).await;
    http_server::run_server(state).await
}

async fn set_password(
    username: String,
    password: Option<String>,
    state_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let username = username.trim().to_string();
    if username.is_empty() {
        anyhow::bail!("username must not be empty");
    }
    let password = match password {
        Some(password) => password,
        None => {
            let first = prompt_hidden("Password: ")?;
            let second = prompt_hidden("Confirm password: ")?;
            if first != second {
                anyhow::bail!("passwords do not match");
            }
            first
        }
    };
    if password.chars().count() < MIN_PASSWORD_LEN {
        anyhow::bail!("password must be at least {MIN_PASSWORD_LEN} characters");
    }

    let state_dir = match state_dir {
        Some(dir) => dir,
        None => default_state_dir()?,
    };
    let path = state_dir.join("credentials.json");
    let record = tokio::task::spawn_blocking(move || Credentials::create(&username, &password))
        .await
        .context("password hashing task failed")??;
    persist::write_json(&path, &record)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Credentials written to {}", path.display());
    Ok(())
}

/// Read one line from stdin with terminal echo disabled when stdin is a tty.
fn prompt_hidden(prompt: &str) -> anyhow::Result<String> {
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let stdin = std::io::stdin();
    let original = tcgetattr(&stdin).ok();
    if let Some(original) = &original {
        let mut silent = original.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&stdin, SetArg::TCSANOW, &silent)?;
    }

    let mut line = String::new();
    let read = stdin.lock().read_line(&mut line);

    if let Some(original) = &original {
        tcsetattr(&stdin, SetArg::TCSANOW, original)?;
        eprintln!();
    }
    read?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
