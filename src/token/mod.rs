//! Bearer token generation for the upstream handshake.
//!
//! A [`TokenGenerator`] produces the value of the `Authorization: Bearer`
//! header. Three strategies exist:
//!
//! - [`NoAuth`]: no header at all
//! - [`PrivateKeyGenerator`]: a self-signed RS256 JWT is the token
//! - [`ServiceAccountGenerator`]: a service-account JWT assertion exchanged
//!   at an OAuth2 token endpoint for an access token
//!
//! # Caching
//!
//! Each enabled strategy keeps one [`CachedToken`] behind an async mutex.
//! [`TokenGenerator::get`] holds the lock across the validity check and any
//! regeneration, so a burst of connections arriving on an expired cache
//! triggers a single regeneration; the other callers wait and then read the
//! fresh token.
//!
//! # Background refresh
//!
//! [`TokenGenerator::run`] re-mints the token on a fixed period until its
//! cancellation token fires. Failures are logged and the previous token keeps
//! being served until it actually expires.

mod noauth;
mod private_key;
mod service_account;

pub use noauth::NoAuth;
pub use private_key::{PrivateKeyClaims, PrivateKeyGenerator};
pub use service_account::ServiceAccountGenerator;

use crate::config::AuthConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Capability set shared by every credential strategy.
///
/// Implementations must be safe to call from many connection setups at once.
#[async_trait]
pub trait TokenGenerator: Send + Sync {
    /// Whether an `Authorization` header should be attached at all.
    fn enabled(&self) -> bool;

    /// Returns a token that is valid right now, regenerating it if needed.
    async fn get(&self) -> Result<String>;

    /// Periodically regenerates the token until `cancel` fires.
    ///
    /// Never returns an error: refresh failures are logged.
    async fn run(&self, cancel: CancellationToken);
}

/// Builds the strategy selected by `auth`.
///
/// Credential files are read and validated here, so a bad key or JSON
/// document fails startup rather than the first connection.
pub fn build_generator(auth: &AuthConfig) -> Result<Arc<dyn TokenGenerator>> {
    Ok(match auth {
        AuthConfig::None => Arc::new(NoAuth::new()),
        AuthConfig::PrivateKey { key_file, user } => {
            Arc::new(PrivateKeyGenerator::from_file(key_file, user)?)
        }
        AuthConfig::ServiceAccount {
            credential_file,
            target_audience,
        } => Arc::new(ServiceAccountGenerator::from_file(
            credential_file,
            target_audience,
        )?),
    })
}

/// A token value with the instant it stops being served.
#[derive(Debug, Clone)]
pub struct CachedToken {
    /// The bearer token
    pub value: String,
    /// When this token expires
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// A token is served only while non-empty and strictly before expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.value.is_empty() && now < self.expires_at
    }
}

/// Lock-protected slot holding the current token of one generator.
#[derive(Debug, Default)]
pub(crate) struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token if still valid, otherwise runs `mint` under
    /// the lock and caches its result.
    pub(crate) async fn get_or_mint<F, Fut>(&self, mint: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.is_valid_at(Utc::now()) {
                return Ok(cached.value.clone());
            }
        }
        let fresh = mint().await?;
        let value = fresh.value.clone();
        *slot = Some(fresh);
        Ok(value)
    }

    /// Unconditionally runs `mint` under the lock. On failure the previous
    /// token is left in place.
    pub(crate) async fn remint<F, Fut>(&self, mint: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken>>,
    {
        let mut slot = self.slot.lock().await;
        let fresh = mint().await?;
        let value = fresh.value.clone();
        *slot = Some(fresh);
        Ok(value)
    }

    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> Option<CachedToken> {
        self.slot.lock().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn expire_now(&self) {
        if let Some(cached) = self.slot.lock().await.as_mut() {
            cached.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

/// Runs `tick` every `period` until `cancel` fires.
///
/// The immediate first tick of the interval is skipped: the orchestrator has
/// already fetched a token synchronously at startup.
pub(crate) async fn refresh_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    tracing::debug!(generator = name, period = ?period, "Token refresh loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                // The regeneration itself is also abandoned on cancellation.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = tick() => match result {
                        Ok(_) => tracing::debug!(generator = name, "Token refreshed"),
                        Err(e) => tracing::warn!(generator = name, error = %e, "Regular token refresh failed"),
                    },
                }
            }
        }
    }
    tracing::debug!(generator = name, "Token refresh loop stopped");
}
