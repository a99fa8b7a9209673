//! wsgate Tunnel Client Library
//!
//! This library tunnels local TCP ports to WebSocket upstreams. Every
//! connection accepted on a local port opens its own WebSocket session to the
//! configured upstream and the raw bytes are relayed both ways as binary
//! messages.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐         ┌─────────────────┐         ┌─────────────────┐
//! │  Local Client   │◄───────►│  wsgate-client  │◄───────►│ wsgate server / │
//! │  (ssh, psql..)  │   TCP   │ (TunnelListener)│  WS(S)  │  IAP upstream   │
//! └─────────────────┘         └─────────────────┘         └─────────────────┘
//!                                      │
//!                                      ▼
//!                             ┌─────────────────┐
//!                             │ TokenGenerator  │
//!                             │ (Bearer token)  │
//!                             └─────────────────┘
//! ```
//!
//! - [`Orchestrator`]: one listener per mapping entry, shared cancellation
//! - [`TunnelListener`]: accept loop, upstream dial, bounded drain
//! - [`relay_connection`]: the byte relay for one connection
//! - [`TokenGenerator`]: `Authorization: Bearer` token with caching and
//!   background refresh
//!
//! # Example
//!
//! ```rust,no_run
//! use wsgate_client::{parse_headers, parse_mapping, AuthConfig, ListenerOptions, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mappings = parse_mapping("127.0.0.1:2222,https://gate.example.com/proxy/ssh\n".as_bytes())?;
//!     let headers = parse_headers(&["X-Team: infra"])?;
//!     let auth = AuthConfig::resolve(Some("key.pem".into()), Some("deploy".into()), None, None)?;
//!
//!     let orchestrator =
//!         Orchestrator::from_auth(&mappings, headers, &auth, ListenerOptions::default()).await?;
//!     orchestrator.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Credentials
//!
//! - No flag: no `Authorization` header
//! - Private key: a self-signed RS256 JWT valid for one minute, re-minted
//!   every ten seconds
//! - Service account: a JWT assertion exchanged for an OAuth2 token valid for
//!   one hour, re-exchanged every ten minutes

pub mod config;
pub mod error;
pub mod listener;
pub mod orchestrator;
pub mod relay;
pub mod token;

pub use config::{
    parse_headers, parse_mapping, read_mapping_file, AuthConfig, ListenerOptions, MappingEntry,
};
pub use error::TunnelError;
pub use listener::{TunnelListener, Upstream};
pub use orchestrator::Orchestrator;
pub use relay::{relay_connection, BufferPool, RelayStats};
pub use token::{
    build_generator, NoAuth, PrivateKeyGenerator, ServiceAccountGenerator, TokenGenerator,
};
