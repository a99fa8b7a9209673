//! Local TCP listener that tunnels every accepted connection to a WebSocket
//! upstream.
//!
//! This module provides the [`TunnelListener`] type. One listener owns one
//! bound TCP socket and one upstream URL.
//!
//! # Lifecycle
//!
//! 1. [`TunnelListener::bind()`] validates the upstream URL and binds the
//!    socket. Any failure here is a startup error and leaves nothing bound.
//! 2. [`TunnelListener::run()`] accepts connections until its cancellation
//!    token fires. Each connection gets `TCP_NODELAY`, an upstream dial and a
//!    [`relay_connection`] task; the accept loop never waits for relays.
//! 3. On cancellation the socket is dropped, so no new connection is
//!    accepted, and in-flight relays are given up to the configured shutdown
//!    timeout to finish. Relays still running after that are left alone.
//!
//! # Upstream Handshake
//!
//! The handshake request carries the shared header set, an `Origin` of the
//! upstream's scheme and host, and `Authorization: Bearer <token>` when the
//! token generator is enabled. A dial or token failure closes only the
//! affected client socket.

use crate::config::{normalize_listen_addr, ListenerOptions};
use crate::error::{is_transient_accept, Result, TunnelError};
use crate::relay::{relay_connection, BufferPool};
use crate::token::TokenGenerator;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, ORIGIN};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// WebSocket session to the upstream.
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Back-off after the process ran out of file descriptors.
const RESOURCE_BACKOFF: Duration = Duration::from_millis(100);

/// A parsed upstream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// The URL as configured
    pub url: String,
    /// The URL dialed: a leading `http` is replaced by `ws`
    pub ws_url: String,
    /// `Origin` header value: scheme and host of the configured URL
    pub origin: String,
}

impl Upstream {
    /// Parses an upstream URL.
    ///
    /// `http://` and `https://` become `ws://` and `wss://`; `ws://` and
    /// `wss://` are used as given.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::ConfigError`] if the URL does not parse, has no
    /// host, or does not map to a WebSocket scheme.
    pub fn parse(upstream: &str) -> Result<Self> {
        let parsed = url::Url::parse(upstream)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TunnelError::config(format!("upstream url missing host: {}", upstream)))?;
        let origin = match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        };

        let ws_url = match upstream.strip_prefix("http") {
            Some(rest) => format!("ws{}", rest),
            None => upstream.to_string(),
        };
        let ws_scheme = url::Url::parse(&ws_url)?.scheme().to_string();
        if ws_scheme != "ws" && ws_scheme != "wss" {
            return Err(TunnelError::config(format!(
                "upstream url must be http(s) or ws(s): {}",
                upstream
            )));
        }

        Ok(Self {
            url: upstream.to_string(),
            ws_url,
            origin,
        })
    }
}

/// Everything a connection task needs to reach the upstream.
struct Dialer {
    upstream: Upstream,
    headers: Arc<HeaderMap>,
    generator: Arc<dyn TokenGenerator>,
    connect_timeout: Duration,
    connector: Option<tokio_tungstenite::Connector>,
}

impl Dialer {
    /// Opens one WebSocket session to the upstream.
    async fn dial(&self) -> Result<UpstreamStream> {
        let mut request = self.upstream.ws_url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        for (name, value) in self.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
        if !headers.contains_key(ORIGIN) {
            headers.insert(ORIGIN, HeaderValue::from_str(&self.upstream.origin)?);
        }

        if self.generator.enabled() {
            let token = self.generator.get().await?;
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }

        let connect = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            true,
            self.connector.clone(),
        );
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| TunnelError::Timeout)??;
        Ok(ws_stream)
    }
}

/// A bound local listener tunnelling to one upstream.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use wsgate_client::{ListenerOptions, NoAuth, TunnelListener};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TunnelListener::bind(
///     "127.0.0.1:8080",
///     "https://gate.example.com/proxy/ssh",
///     Arc::new(http::HeaderMap::new()),
///     Arc::new(NoAuth::new()),
///     ListenerOptions::default(),
/// )
/// .await?;
///
/// let cancel = CancellationToken::new();
/// listener.run(cancel).await?;
/// # Ok(())
/// # }
/// ```
pub struct TunnelListener {
    listener: TcpListener,
    listen: Arc<str>,
    local_addr: SocketAddr,
    dialer: Arc<Dialer>,
    shutdown_timeout: Duration,
    pool: Arc<BufferPool>,
    tracker: TaskTracker,
}

impl TunnelListener {
    /// Validates `upstream` and binds `listen`.
    ///
    /// `listen` accepts a bare port (`8080`, bound on loopback), `:port`
    /// (bound on all interfaces) or any `host:port`.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::ConfigError`] for a bad upstream URL or CA file
    /// - [`TunnelError::BindError`] if the address does not resolve or is in use
    pub async fn bind(
        listen: &str,
        upstream: &str,
        headers: Arc<HeaderMap>,
        generator: Arc<dyn TokenGenerator>,
        options: ListenerOptions,
    ) -> Result<Self> {
        let upstream = Upstream::parse(upstream)?;
        let connector = match options.trust_ca.as_deref() {
            Some(ca_path) => Some(build_tls_connector(ca_path)?),
            None => None,
        };

        let addr = normalize_listen_addr(listen);
        let bind_error = |e: std::io::Error| TunnelError::BindError {
            addr: Arc::from(listen),
            message: Arc::from(e.to_string()),
        };
        let listener = TcpListener::bind(addr.as_str()).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        Ok(Self {
            listener,
            listen: Arc::from(listen),
            local_addr,
            dialer: Arc::new(Dialer {
                upstream,
                headers,
                generator,
                connect_timeout: options.connect_timeout,
                connector,
            }),
            shutdown_timeout: options.shutdown_timeout,
            pool: Arc::new(BufferPool::new()),
            tracker: TaskTracker::new(),
        })
    }

    /// Shares a buffer pool with other listeners.
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    /// The address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The listen address as configured.
    pub fn listen(&self) -> &str {
        &self.listen
    }

    /// The upstream this listener dials.
    pub fn upstream(&self) -> &Upstream {
        &self.dialer.upstream
    }

    /// Accepts connections until `cancel` fires or accept fails for good,
    /// then drains in-flight relays.
    ///
    /// Returns `Ok(())` after a cancellation and
    /// [`TunnelError::AcceptFailed`] after a non-transient accept error. In
    /// both cases the drain runs before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let TunnelListener {
            listener,
            listen,
            local_addr,
            dialer,
            shutdown_timeout,
            pool,
            tracker,
        } = self;

        tracing::info!(
            listen = %listen,
            addr = %local_addr,
            upstream = %dialer.upstream.url,
            "Listening"
        );

        let result = loop {
            let (socket, peer) = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) if is_transient_accept(&e) => {
                        tracing::debug!(listen = %listen, error = %e, "Transient accept error");
                        if matches!(e.raw_os_error(), Some(23) | Some(24)) {
                            tokio::time::sleep(RESOURCE_BACKOFF).await;
                        }
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(listen = %listen, error = %e, "Accept failed");
                        break Err(TunnelError::AcceptFailed {
                            addr: listen.clone(),
                            message: Arc::from(e.to_string()),
                        });
                    }
                },
            };

            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!(client = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
            tracker.spawn(handle_connection(
                dialer.clone(),
                socket,
                peer,
                pool.clone(),
                listen.clone(),
            ));
        };

        // Stop accepting before draining.
        drop(listener);
        tracker.close();
        tracing::info!(listen = %listen, in_flight = tracker.len(), "Draining connections");
        if tokio::time::timeout(shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                listen = %listen,
                in_flight = tracker.len(),
                "Shutdown timeout elapsed with relays still running"
            );
        }
        tracing::info!(listen = %listen, "Listener closed");
        result
    }
}

/// Dials upstream for one accepted client and relays until done.
async fn handle_connection(
    dialer: Arc<Dialer>,
    socket: TcpStream,
    peer: SocketAddr,
    pool: Arc<BufferPool>,
    listen: Arc<str>,
) {
    let upstream = match dialer.dial().await {
        Ok(ws) => ws,
        Err(e) if e.is_per_connection() => {
            tracing::warn!(
                listen = %listen,
                client = %peer,
                error = %e,
                "Failed to connect upstream"
            );
            // Dropping the socket closes the client connection.
            drop(socket);
            return;
        }
        Err(e) => {
            // e.g. a token that is not a valid header value
            tracing::error!(
                listen = %listen,
                client = %peer,
                error = %e,
                "Failed to build upstream request"
            );
            drop(socket);
            return;
        }
    };
    tracing::debug!(listen = %listen, client = %peer, "Relay started");
    let stats = relay_connection(socket, upstream, pool).await;
    tracing::debug!(
        listen = %listen,
        client = %peer,
        upstream_bytes = stats.bytes_upstream,
        downstream_bytes = stats.bytes_downstream,
        "Relay finished"
    );
}

/// Builds a TLS connector that trusts the specified CA certificate file
/// in addition to the webpki root certificates.
fn build_tls_connector(ca_path: &Path) -> Result<tokio_tungstenite::Connector> {
    use rustls::pki_types::CertificateDer;
    use std::io::BufReader;

    let ca_file = std::fs::File::open(ca_path).map_err(|e| {
        TunnelError::config(format!("Failed to open CA file {:?}: {}", ca_path, e))
    })?;
    let mut ca_reader = BufReader::new(ca_file);

    let ca_certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut ca_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            TunnelError::config(format!(
                "Failed to parse CA certificates from {:?}: {}",
                ca_path, e
            ))
        })?;

    if ca_certs.is_empty() {
        return Err(TunnelError::config(format!(
            "No certificates found in {:?}",
            ca_path
        )));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in ca_certs {
        root_store
            .add(cert)
            .map_err(|e| TunnelError::config(format!("Failed to add CA certificate: {}", e)))?;
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::config(format!("TLS configuration error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}
