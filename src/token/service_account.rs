//! Service-account strategy for upstreams behind Identity-Aware Proxy.
//!
//! A JWT assertion signed with the service account's private key is
//! exchanged at the OAuth2 token endpoint
//! (`grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer`). The token
//! returned by the endpoint is cached for one hour from issuance and the
//! whole mint-and-exchange is repeated every ten minutes in the background.
//!
//! # Assertion Format
//!
//! - `iss`, `sub`: The service account email
//! - `aud`: The token endpoint URL
//! - `iat`, `exp`: Now and one hour later
//! - `target_audience`: `<iap-client-id>.apps.googleusercontent.com`

use super::{refresh_loop, CachedToken, TokenCache, TokenGenerator};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use chrono::{Duration, SubsecRound, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Token endpoint used when the credential JSON does not name one.
pub const DEFAULT_TOKEN_URI: &str = "https://www.googleapis.com/oauth2/v4/token";

/// Assertion and cached token validity (1 hour).
pub const TOKEN_VALIDITY_SECS: i64 = 3600;

/// Background re-exchange period.
const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

/// Bound on one round trip to the token endpoint.
const EXCHANGE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// The subset of a service-account credential JSON that is used.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Must be `service_account` when present
    #[serde(rename = "type", default)]
    pub key_type: Option<String>,

    /// Service account email, used as `iss` and `sub`
    pub client_email: String,

    /// PEM-encoded RSA private key
    pub private_key: String,

    /// Becomes the `kid` header when present
    #[serde(default)]
    pub private_key_id: Option<String>,

    /// OAuth2 token endpoint
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// Claims of the assertion sent to the token endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub target_audience: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    /// Lifetime in seconds as reported by the endpoint
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchanges service-account assertions for bearer tokens.
pub struct ServiceAccountGenerator {
    email: String,
    key_id: Option<String>,
    key: EncodingKey,
    token_uri: String,
    target_audience: String,
    client: reqwest::Client,
    cache: TokenCache,
}

impl ServiceAccountGenerator {
    /// Loads the credential JSON at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::CredentialError`] if the file cannot be read, is
    /// not a service-account JSON, or its private key is unusable.
    pub fn from_file(path: &Path, target_audience: &str) -> Result<Self> {
        let json = std::fs::read(path).map_err(|e| {
            TunnelError::credential(format!("failed to read credential {:?}: {}", path, e))
        })?;
        Self::from_json(&json, target_audience)
            .map_err(|e| TunnelError::credential(format!("credential {:?}: {}", path, e)))
    }

    /// Builds a generator from credential JSON bytes.
    pub fn from_json(json: &[u8], target_audience: &str) -> Result<Self> {
        let sa: ServiceAccountKey = serde_json::from_slice(json)
            .map_err(|e| TunnelError::credential(format!("invalid credential JSON: {}", e)))?;
        Self::from_key(sa, target_audience)
    }

    /// Builds a generator from an already parsed credential.
    pub fn from_key(sa: ServiceAccountKey, target_audience: &str) -> Result<Self> {
        if let Some(kind) = sa.key_type.as_deref() {
            if kind != "service_account" {
                return Err(TunnelError::credential(format!(
                    "unsupported credential type {:?}, expected \"service_account\"",
                    kind
                )));
            }
        }
        if sa.client_email.is_empty() {
            return Err(TunnelError::credential("client_email is empty"));
        }
        let key = EncodingKey::from_rsa_pem(sa.private_key.as_bytes())
            .map_err(|e| TunnelError::credential(format!("invalid private_key: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .map_err(|e| TunnelError::config(format!("failed to build HTTP client: {}", e)))?;

        let gen = Self {
            email: sa.client_email,
            key_id: sa.private_key_id,
            key,
            token_uri: sa.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            target_audience: target_audience.to_string(),
            client,
            cache: TokenCache::new(),
        };
        // Signing once checks the key body, which from_rsa_pem does not.
        gen.assertion()
            .map_err(|e| TunnelError::credential(format!("unusable private_key: {}", e)))?;
        Ok(gen)
    }

    /// Service account email.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Token endpoint the assertion is exchanged at.
    pub fn token_uri(&self) -> &str {
        &self.token_uri
    }

    /// Signs a fresh assertion, returning it with its issue time.
    fn assertion(&self) -> Result<(String, chrono::DateTime<Utc>)> {
        let now = Utc::now().trunc_subsecs(0);
        let claims = AssertionClaims {
            iss: self.email.clone(),
            sub: self.email.clone(),
            aud: self.token_uri.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(TOKEN_VALIDITY_SECS)).timestamp(),
            target_audience: self.target_audience.clone(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        Ok((encode(&header, &claims, &self.key)?, now))
    }

    /// Mints an assertion and exchanges it for a token.
    async fn mint(&self) -> Result<CachedToken> {
        let (assertion, issued_at) = self.assertion()?;
        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TunnelError::TokenExchange(Arc::from(format!(
                "token endpoint returned {}: {}",
                status,
                body.trim()
            ))));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)?;
        let value = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .or(parsed.id_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                TunnelError::TokenExchange(Arc::from("response has neither access_token nor id_token"))
            })?;

        let mut expires_at = issued_at + Duration::seconds(TOKEN_VALIDITY_SECS);
        if let Some(secs) = parsed.expires_in.filter(|secs| *secs > 0) {
            expires_at = expires_at.min(Utc::now().trunc_subsecs(0) + Duration::seconds(secs));
        }

        tracing::debug!(email = %self.email, expires_at = %expires_at, "Exchanged service account assertion");
        Ok(CachedToken { value, expires_at })
    }
}

#[async_trait]
impl TokenGenerator for ServiceAccountGenerator {
    fn enabled(&self) -> bool {
        true
    }

    async fn get(&self) -> Result<String> {
        self.cache.get_or_mint(|| self.mint()).await
    }

    async fn run(&self, cancel: CancellationToken) {
        refresh_loop("service-account", REFRESH_INTERVAL, cancel, || {
            self.cache.remint(|| self.mint())
        })
        .await
    }
}
