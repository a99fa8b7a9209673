//! Error types for the wsgate tunnel client.
//!
//! This module defines the error types that can occur while configuring and
//! running the tunnel:
//!
//! - [`TunnelError`]: The main error type encompassing all possible errors
//! - [`Result<T>`]: A convenience type alias for `std::result::Result<T, TunnelError>`
//!
//! Errors fall into three groups. Startup errors (mapping, headers, credential
//! files, bind, initial token) abort the process. Per-connection errors (dial,
//! token fetch, relay I/O, unexpected frames) end only the affected
//! connection. Accept errors other than transient ones end the listener.

use http::StatusCode;
use std::sync::Arc;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur when using the tunnel client.
///
/// This enum uses `Arc<str>` for string fields to make cloning cheap,
/// since errors are frequently cloned in async code paths.
///
/// # Stability
///
/// This enum is marked `#[non_exhaustive]`, meaning new variants may be added
/// in future versions without a breaking change. When matching on this enum,
/// always include a wildcard arm (`_`) to handle unknown variants.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TunnelError {
    /// Configuration error.
    ///
    /// The provided configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(Arc<str>),

    /// A line of the mapping file is not `listen,upstream`.
    #[error("Invalid line {line_no} in mapping file: {line}")]
    InvalidMapping {
        /// 1-based line number
        line_no: usize,
        /// The offending line
        line: Arc<str>,
    },

    /// A header flag is not `Key: Value`.
    #[error("Invalid header: {0}")]
    InvalidHeader(Arc<str>),

    /// Both a private key and a service-account credential were configured.
    #[error("--iap-credential and --private-key are exclusive")]
    ExclusiveCredentials,

    /// A service-account credential was configured without an IAP client id.
    #[error("--iap-client-id is required with --iap-credential")]
    MissingClientId,

    /// A credential file could not be read or parsed.
    #[error("Credential error: {0}")]
    CredentialError(Arc<str>),

    /// The listen address could not be resolved or bound.
    #[error("Could not listen on {addr}: {message}")]
    BindError {
        /// The listen address as configured
        addr: Arc<str>,
        /// Underlying error message
        message: Arc<str>,
    },

    /// JWT generation error.
    ///
    /// Failed to sign a JWT for authentication.
    #[error("JWT error: {0}")]
    JwtError(Arc<str>),

    /// The OAuth2 token endpoint rejected the assertion or returned garbage.
    #[error("Token exchange failed: {0}")]
    TokenExchange(Arc<str>),

    /// Failed to connect to the upstream.
    ///
    /// This can happen if:
    /// - The upstream is unreachable
    /// - TLS handshake failed
    /// - The handshake timed out
    #[error("Connection failed: {0}")]
    ConnectionFailed(Arc<str>),

    /// Authentication error.
    ///
    /// The upstream rejected the bearer token during the handshake.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(Arc<str>),

    /// Upstream returned an error response to the handshake.
    #[error("Server error: {status} - {message}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Error message from server
        message: Arc<str>,
    },

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(Arc<str>),

    /// Upstream sent a frame other than binary payload.
    #[error("Binary message required, got {0}")]
    UnexpectedFrame(Arc<str>),

    /// The accept loop hit an error it cannot recover from.
    #[error("Accept failed on {addr}: {message}")]
    AcceptFailed {
        /// The listen address as configured
        addr: Arc<str>,
        /// Underlying error message
        message: Arc<str>,
    },

    /// I/O error.
    ///
    /// An underlying I/O operation failed.
    #[error("I/O error: {0}")]
    IoError(Arc<str>),

    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,
}

impl TunnelError {
    /// Builds a configuration error from anything printable.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        TunnelError::ConfigError(Arc::from(msg.to_string()))
    }

    /// Builds a credential error from anything printable.
    pub fn credential(msg: impl std::fmt::Display) -> Self {
        TunnelError::CredentialError(Arc::from(msg.to_string()))
    }

    /// Returns `true` for errors that only affect a single connection attempt.
    pub fn is_per_connection(&self) -> bool {
        matches!(
            self,
            TunnelError::ConnectionFailed(_)
                | TunnelError::AuthenticationFailed(_)
                | TunnelError::ServerError { .. }
                | TunnelError::WebSocketError(_)
                | TunnelError::UnexpectedFrame(_)
                | TunnelError::JwtError(_)
                | TunnelError::TokenExchange(_)
                | TunnelError::IoError(_)
                | TunnelError::Timeout
        )
    }
}

/// Classifies an accept error as transient.
///
/// Transient errors are swallowed by the accept loop, which retries. They are
/// either about the one peer that was being accepted, or about momentary
/// resource exhaustion (`EMFILE`/`ENFILE`).
pub fn is_transient_accept(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) {
        return true;
    }
    // ENFILE / EMFILE
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

impl From<jsonwebtoken::errors::Error> for TunnelError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        TunnelError::JwtError(Arc::from(err.to_string()))
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::IoError(Arc::from(err.to_string()))
    }
}

impl From<reqwest::Error> for TunnelError {
    fn from(err: reqwest::Error) -> Self {
        TunnelError::TokenExchange(Arc::from(err.to_string()))
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::TokenExchange(Arc::from(format!("malformed response: {}", err)))
    }
}

impl From<url::ParseError> for TunnelError {
    fn from(err: url::ParseError) -> Self {
        TunnelError::ConfigError(Arc::from(format!("invalid upstream url: {}", err)))
    }
}

impl From<http::header::InvalidHeaderName> for TunnelError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        TunnelError::InvalidHeader(Arc::from(err.to_string()))
    }
}

impl From<http::header::InvalidHeaderValue> for TunnelError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        TunnelError::InvalidHeader(Arc::from(err.to_string()))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match &err {
            WsError::Http(res) => {
                let status = res.status();
                if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
                    return TunnelError::AuthenticationFailed(err.to_string().into());
                }
                TunnelError::ServerError {
                    status: status.as_u16(),
                    message: err.to_string().into(),
                }
            }
            WsError::Io(_) | WsError::Tls(_) | WsError::Url(_) | WsError::HttpFormat(_) => {
                TunnelError::ConnectionFailed(Arc::from(err.to_string()))
            }
            _ => TunnelError::WebSocketError(Arc::from(err.to_string())),
        }
    }
}
