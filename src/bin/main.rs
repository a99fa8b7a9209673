//! wsgate-client CLI
//!
//! Listens on local TCP ports and tunnels every connection to a WebSocket
//! upstream, as described by a mapping file.
//!
//! # Usage
//!
//! ```bash
//! wsgate-client --map map.txt
//! ```
//!
//! where `map.txt` holds one `listen,upstream` pair per line:
//!
//! ```text
//! # ssh to the bastion
//! 127.0.0.1:2222,https://gate.example.com/proxy/bastion:22
//! ```
//!
//! # Example
//!
//! ```bash
//! # Self-signed JWT
//! wsgate-client --map map.txt --private-key key.pem --private-key-user alice
//!
//! # Behind Identity-Aware Proxy
//! wsgate-client --map map.txt --iap-credential sa.json --iap-client-id 1234-abc
//!
//! # Extra handshake headers
//! wsgate-client --map map.txt -H 'X-Team: infra' -H 'X-Env: prod'
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use wsgate_client::config::DEFAULT_PRIVATE_KEY_USER;
use wsgate_client::{parse_headers, read_mapping_file, AuthConfig, ListenerOptions, Orchestrator};

/// wsgate-client - Tunnel local TCP ports over WebSocket
#[derive(Parser, Debug)]
#[command(name = "wsgate-client")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen port and upstream url mapping file.
    #[arg(long, value_name = "FILE")]
    map: PathBuf,

    /// Timeout of the WebSocket handshake with the upstream.
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    connect_timeout: Duration,

    /// How long to wait for in-flight connections on shutdown.
    #[arg(long, default_value = "86400s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    /// Header added to the upstream handshake, as `Key: Value`. Repeatable.
    #[arg(short = 'H', long = "headers", value_name = "HEADER")]
    headers: Vec<String>,

    /// Private key (PEM) for signing the JWT auth header.
    #[arg(long, value_name = "FILE")]
    private_key: Option<PathBuf>,

    /// User id used as subject in the JWT payload.
    #[arg(long, default_value = DEFAULT_PRIVATE_KEY_USER)]
    private_key_user: String,

    /// Service account JSON for an upstream behind Identity-Aware Proxy.
    #[arg(long, value_name = "FILE")]
    iap_credential: Option<PathBuf>,

    /// OAuth2 client id of the Identity-Aware Proxy.
    #[arg(long, env = "WSGATE_IAP_CLIENT_ID")]
    iap_client_id: Option<String>,

    /// Path to a PEM file containing a root CA certificate to trust.
    ///
    /// When specified, this CA will be trusted in addition to the default
    /// root certificates for `wss://` upstreams.
    #[arg(long)]
    trust_ca: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install crypto provider"))?;

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let auth = AuthConfig::resolve(
        args.private_key,
        Some(args.private_key_user),
        args.iap_credential,
        args.iap_client_id,
    )?;
    let headers = parse_headers(args.headers.as_slice())?;
    let mappings = read_mapping_file(&args.map)
        .with_context(|| format!("Failed to load mapping file {:?}", args.map))?;

    let mut options = ListenerOptions::default()
        .with_connect_timeout(args.connect_timeout)
        .with_shutdown_timeout(args.shutdown_timeout);
    if let Some(ca_path) = args.trust_ca {
        options = options.with_trust_ca(ca_path);
    }

    let orchestrator = Orchestrator::from_auth(&mappings, headers, &auth, options)
        .await
        .context("Failed to start tunnels")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    orchestrator
        .run(cancel)
        .await
        .context("Tunnel stopped with an error")?;

    info!("All listeners drained");
    Ok(())
}

/// Cancels `cancel` on SIGTERM or Ctrl-C.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
