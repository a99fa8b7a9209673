//! Startup and lifecycle of the whole tunnel set.
//!
//! The [`Orchestrator`] owns every [`TunnelListener`] built from the mapping
//! file together with the single [`TokenGenerator`] they share. Startup is
//! all-or-nothing: the initial token fetch and every bind must succeed before
//! any listener accepts a connection.
//!
//! [`Orchestrator::run`] starts all listeners under one cancellation token.
//! The first listener to fail cancels that token, which drains every other
//! listener; `run` then returns the first error.

use crate::config::{AuthConfig, ListenerOptions, MappingEntry};
use crate::error::{Result, TunnelError};
use crate::listener::TunnelListener;
use crate::relay::BufferPool;
use crate::token::{build_generator, TokenGenerator};
use http::HeaderMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Owns the listeners of one process and the generator they share.
pub struct Orchestrator {
    listeners: Vec<TunnelListener>,
    generator: Arc<dyn TokenGenerator>,
}

impl Orchestrator {
    /// Builds the generator selected by `auth`, then everything else as in
    /// [`Orchestrator::new`].
    pub async fn from_auth(
        mappings: &[MappingEntry],
        headers: HeaderMap,
        auth: &AuthConfig,
        options: ListenerOptions,
    ) -> Result<Self> {
        let generator = build_generator(auth)?;
        Self::new(mappings, headers, generator, options).await
    }

    /// Fetches the initial token (when enabled) and binds one listener per
    /// mapping entry.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::ConfigError`] if `mappings` is empty
    /// - the token error if the initial fetch fails
    /// - the first bind or upstream error; listeners bound before it are
    ///   dropped again
    pub async fn new(
        mappings: &[MappingEntry],
        headers: HeaderMap,
        generator: Arc<dyn TokenGenerator>,
        options: ListenerOptions,
    ) -> Result<Self> {
        if mappings.is_empty() {
            return Err(TunnelError::config("mapping has no entries"));
        }

        if generator.enabled() {
            // A broken credential must not let unauthenticated tunnels start.
            generator.get().await?;
            tracing::info!("Initial token acquired");
        }

        let headers = Arc::new(headers);
        let pool = Arc::new(BufferPool::new());
        let mut listeners = Vec::with_capacity(mappings.len());
        for entry in mappings {
            tracing::info!(listen = %entry.listen, upstream = %entry.upstream, "Create map");
            let listener = TunnelListener::bind(
                &entry.listen,
                &entry.upstream,
                headers.clone(),
                generator.clone(),
                options.clone(),
            )
            .await?
            .with_buffer_pool(pool.clone());
            listeners.push(listener);
        }

        Ok(Self {
            listeners,
            generator,
        })
    }

    /// Bound addresses, in mapping order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr()).collect()
    }

    /// Runs every listener and the token refresh loop until `cancel` fires
    /// or a listener fails.
    ///
    /// Returns after all listeners have drained, with the first listener
    /// error if there was one.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Orchestrator {
            listeners,
            generator,
        } = self;

        let refresh_cancel = cancel.child_token();
        let refresh = generator.enabled().then(|| {
            let generator = generator.clone();
            let refresh_cancel = refresh_cancel.clone();
            tokio::spawn(async move { generator.run(refresh_cancel).await })
        });

        let mut set = JoinSet::new();
        for listener in listeners {
            set.spawn(listener.run(cancel.clone()));
        }
        let result = supervise(set, &cancel).await;

        refresh_cancel.cancel();
        if let Some(handle) = refresh {
            let _ = handle.await;
        }
        result
    }
}

/// Waits for every listener task. The first failure cancels `cancel` so the
/// remaining listeners drain, and is returned once all have stopped.
async fn supervise(mut set: JoinSet<Result<()>>, cancel: &CancellationToken) -> Result<()> {
    let mut first_error: Option<TunnelError> = None;
    while let Some(joined) = set.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(TunnelError::IoError(Arc::from(format!(
                "listener task failed: {}",
                e
            )))),
        };
        if let Err(e) = result {
            if first_error.is_none() {
                tracing::error!(error = %e, "Listener failed, stopping all listeners");
                cancel.cancel();
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
