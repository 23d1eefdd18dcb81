//! diagramsync command line
//!
//! Runs the authority over TCP, mints participant credentials and checks
//! configuration files.

use crate::authority::Authority;
use crate::config::Config;
use crate::identity::SignedTokenProvider;
use crate::observability::telemetry::{init_tracing, init_tracing_with_filter, LogFormat};
use crate::server::{self, ConnectionHub};
use crate::store;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "diagramsync")]
#[command(about = "Real-time collaboration authority for shared diagram editing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact")]
    log_format: LogFormat,

    /// Verbose mode (info-level logs even without RUST_LOG)
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collaboration authority
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(short, long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Issue a signed participant credential as JSON
    IssueToken {
        /// Participant id
        participant: String,
        /// Display name shown to other participants
        display_name: String,
        /// Lifetime in seconds (defaults to identity.token_ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose && std::env::var("RUST_LOG").is_err() {
        init_tracing_with_filter("diagramsync=info", cli.log_format);
    } else {
        init_tracing(cli.log_format);
    }

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => serve(config, bind).await,
        Commands::IssueToken {
            participant,
            display_name,
            ttl,
        } => issue_token(&config, &participant, &display_name, ttl),
        Commands::CheckConfig => check_config(&config),
    }
}

async fn serve(mut config: Config, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    config.validate_for_serving()?;

    let store = store::from_config(&config.store)?;
    let tokens = token_provider(&config, None)?;
    let hub = Arc::new(ConnectionHub::with_config(&config.server));
    let authority = Authority::new(hub.clone(), store, Arc::new(tokens), config.authority.clone());

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(
        bind = %config.server.bind,
        store = %config.store.kind,
        retain_empty = config.authority.retain_empty_documents,
        "diagramsync authority starting"
    );

    server::serve(listener, authority, hub, server::shutdown_signal()).await?;
    info!("diagramsync authority stopped");
    Ok(())
}

fn issue_token(config: &Config, participant: &str, display_name: &str, ttl: Option<u64>) -> Result<()> {
    let tokens = token_provider(config, ttl)?;
    let credential = tokens.issue(participant, display_name);
    println!("{}", serde_json::to_string_pretty(&credential)?);
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    config.validate()?;
    println!("{}", toml::to_string_pretty(config).context("Failed to render config")?);
    if config.identity.secret.is_none() {
        eprintln!("warning: identity.secret is not set; `serve` will refuse to start");
    }
    Ok(())
}

fn token_provider(config: &Config, ttl: Option<u64>) -> Result<SignedTokenProvider> {
    let secret = config
        .identity
        .secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            crate::errors::SyncError::Config("identity.secret (or DIAGRAMSYNC_SECRET) is required".into())
        })?;
    let ttl_secs = ttl.unwrap_or(config.identity.token_ttl_secs);
    let ttl_secs = i64::try_from(ttl_secs).context("token ttl is too large")?;
    Ok(SignedTokenProvider::new(secret, chrono::Duration::seconds(ttl_secs)))
}
