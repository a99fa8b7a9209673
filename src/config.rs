//! Startup configuration: mapping file, header flags, credential selection
//! and per-listener options.
//!
//! Everything here is parsed once before any listener is bound. Every error
//! produced by this module is fatal to startup.

use crate::error::{Result, TunnelError};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use regex_lite::Regex;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Default upstream handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on the drain wait during shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(86400);

/// Default JWT subject for the private-key strategy.
pub const DEFAULT_PRIVATE_KEY_USER: &str = "private-key-user";

/// Suffix Google appends to OAuth2 client ids.
const IAP_CLIENT_ID_SUFFIX: &str = ".apps.googleusercontent.com";

/// One `listen,upstream` line of the mapping file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Local address to listen on, as written in the file.
    pub listen: String,
    /// Upstream URL (`http(s)://` or `ws(s)://`).
    pub upstream: String,
}

fn comment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*#").expect("static regex"))
}

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?):\s*(.+)$").expect("static regex"))
}

/// Parses mapping lines from any buffered reader.
///
/// Comment lines (`^\s*#`) and blank lines are skipped. Every other line must
/// contain a comma separating two non-empty fields; the first malformed line
/// is returned as [`TunnelError::InvalidMapping`].
pub fn parse_mapping<R: BufRead>(reader: R) -> Result<Vec<MappingEntry>> {
    let mut entries = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || comment_regex().is_match(&line) {
            continue;
        }
        let invalid = || TunnelError::InvalidMapping {
            line_no: idx + 1,
            line: Arc::from(line.as_str()),
        };
        let (listen, upstream) = line.split_once(',').ok_or_else(invalid)?;
        let (listen, upstream) = (listen.trim(), upstream.trim());
        if listen.is_empty() || upstream.is_empty() {
            return Err(invalid());
        }
        entries.push(MappingEntry {
            listen: listen.to_string(),
            upstream: upstream.to_string(),
        });
    }
    Ok(entries)
}

/// Reads and parses a mapping file.
pub fn read_mapping_file(path: &Path) -> Result<Vec<MappingEntry>> {
    let file = std::fs::File::open(path).map_err(|e| {
        TunnelError::config(format!("failed to open mapping file {:?}: {}", path, e))
    })?;
    parse_mapping(std::io::BufReader::new(file))
}

/// Builds the shared header set from repeated `Key: Value` flags.
///
/// Repeated keys keep every value, in flag order.
pub fn parse_headers<S: AsRef<str>>(flags: &[S]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for flag in flags {
        let flag = flag.as_ref();
        let caps = header_regex()
            .captures(flag)
            .ok_or_else(|| TunnelError::InvalidHeader(Arc::from(flag)))?;
        let name = HeaderName::from_bytes(caps[1].trim().as_bytes())?;
        let value = HeaderValue::from_str(caps[2].trim())?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Normalises a listen address into something `TcpListener::bind` accepts.
///
/// - `8080` becomes `127.0.0.1:8080`
/// - `:8080` becomes `0.0.0.0:8080`
/// - anything else is returned unchanged
pub fn normalize_listen_addr(listen: &str) -> String {
    let listen = listen.trim();
    if !listen.is_empty() && listen.bytes().all(|b| b.is_ascii_digit()) {
        return format!("127.0.0.1:{}", listen);
    }
    if let Some(port) = listen.strip_prefix(':') {
        return format!("0.0.0.0:{}", port);
    }
    listen.to_string()
}

/// Which credential strategy to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    /// Unauthenticated upstream.
    None,
    /// Self-signed RS256 JWT.
    PrivateKey {
        /// PEM file holding the RSA private key
        key_file: PathBuf,
        /// `sub` claim
        user: String,
    },
    /// Service-account JWT exchanged for an OAuth2 token.
    ServiceAccount {
        /// Service-account credential JSON
        credential_file: PathBuf,
        /// Full IAP audience (`<id>.apps.googleusercontent.com`)
        target_audience: String,
    },
}

impl AuthConfig {
    /// Resolves the credential flags into exactly one strategy.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::ExclusiveCredentials`] if both a private key and a
    ///   service-account credential are given
    /// - [`TunnelError::MissingClientId`] if a service-account credential is
    ///   given without a client id
    pub fn resolve(
        private_key: Option<PathBuf>,
        private_key_user: Option<String>,
        iap_credential: Option<PathBuf>,
        iap_client_id: Option<String>,
    ) -> Result<Self> {
        match (private_key, iap_credential) {
            (Some(_), Some(_)) => Err(TunnelError::ExclusiveCredentials),
            (None, Some(credential_file)) => {
                let client_id = iap_client_id
                    .filter(|id| !id.trim().is_empty())
                    .ok_or(TunnelError::MissingClientId)?;
                Ok(AuthConfig::ServiceAccount {
                    credential_file,
                    target_audience: iap_audience(&client_id),
                })
            }
            (Some(key_file), None) => Ok(AuthConfig::PrivateKey {
                key_file,
                user: private_key_user.unwrap_or_else(|| DEFAULT_PRIVATE_KEY_USER.to_string()),
            }),
            (None, None) => Ok(AuthConfig::None),
        }
    }
}

/// Appends the Google client-id suffix unless already present.
pub fn iap_audience(client_id: &str) -> String {
    let client_id = client_id.trim();
    if client_id.ends_with(IAP_CLIENT_ID_SUFFIX) {
        client_id.to_string()
    } else {
        format!("{}{}", client_id, IAP_CLIENT_ID_SUFFIX)
    }
}

/// Per-listener knobs shared by every mapping entry.
///
/// # Stability
///
/// This struct is marked `#[non_exhaustive]`. Use [`ListenerOptions::default()`]
/// and the `with_*` methods rather than struct literal syntax.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ListenerOptions {
    /// Upstream WebSocket handshake timeout
    pub connect_timeout: Duration,

    /// Bound on the drain wait for in-flight relays
    pub shutdown_timeout: Duration,

    /// Optional path to a PEM file containing a root CA certificate to trust.
    ///
    /// When set, this CA will be trusted in addition to the webpki roots for
    /// `wss://` upstreams.
    pub trust_ca: Option<PathBuf>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            trust_ca: None,
        }
    }
}

impl ListenerOptions {
    /// Sets the upstream handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the drain bound used during shutdown.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets a custom root CA certificate to trust.
    pub fn with_trust_ca(mut self, path: PathBuf) -> Self {
        self.trust_ca = Some(path);
        self
    }
}
