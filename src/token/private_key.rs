//! Self-signed RS256 JWT strategy.
//!
//! The signed compact JWT is itself the bearer token; nothing is exchanged
//! with a server. Tokens are valid for one minute and re-minted every ten
//! seconds by the background loop.
//!
//! # Token Format
//!
//! - `iss`: [`ISSUER`]
//! - `sub`: The configured user
//! - `iat`: Issued-at timestamp
//! - `exp`: Issued-at plus [`TOKEN_VALIDITY_SECS`]

use super::{refresh_loop, CachedToken, TokenCache, TokenGenerator};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use chrono::{Duration, SubsecRound, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Fixed `iss` claim.
pub const ISSUER: &str = "wsgate-client";

/// Token validity (1 minute).
pub const TOKEN_VALIDITY_SECS: i64 = 60;

/// Background re-mint period.
const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Claims of the self-signed token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PrivateKeyClaims {
    /// Issuer - always [`ISSUER`]
    pub iss: String,

    /// Subject - the configured user
    pub sub: String,

    /// Issued-at timestamp (Unix seconds)
    pub iat: i64,

    /// Expiration timestamp (Unix seconds)
    pub exp: i64,
}

/// Signs JWTs with a local RSA private key.
pub struct PrivateKeyGenerator {
    key: EncodingKey,
    user: String,
    cache: TokenCache,
}

impl PrivateKeyGenerator {
    /// Loads the PEM key at `path` (PKCS#1 or PKCS#8).
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::CredentialError`] if the file cannot be read or
    /// does not hold a usable RSA private key.
    pub fn from_file(path: &Path, user: &str) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| {
            TunnelError::credential(format!("failed to read private key {:?}: {}", path, e))
        })?;
        Self::from_pem(&pem, user)
            .map_err(|e| TunnelError::credential(format!("private key {:?}: {}", path, e)))
    }

    /// Builds a generator from PEM bytes.
    pub fn from_pem(pem: &[u8], user: &str) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(pem)
            .map_err(|e| TunnelError::credential(format!("invalid RSA private key: {}", e)))?;
        // from_rsa_pem only decodes the PEM envelope; signing once checks the key body.
        encode(&Header::new(Algorithm::RS256), &probe_claims(user), &key)
            .map_err(|e| TunnelError::credential(format!("unusable RSA private key: {}", e)))?;
        Ok(Self {
            key,
            user: user.to_string(),
            cache: TokenCache::new(),
        })
    }

    /// Returns the configured subject.
    pub fn user(&self) -> &str {
        &self.user
    }

    async fn mint(&self) -> Result<CachedToken> {
        // exp is whole seconds; the cache must not outlive it
        let now = Utc::now().trunc_subsecs(0);
        let expires_at = now + Duration::seconds(TOKEN_VALIDITY_SECS);
        let claims = PrivateKeyClaims {
            iss: ISSUER.to_string(),
            sub: self.user.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let value = encode(&Header::new(Algorithm::RS256), &claims, &self.key)?;
        Ok(CachedToken { value, expires_at })
    }
}

fn probe_claims(user: &str) -> PrivateKeyClaims {
    let now = Utc::now().timestamp();
    PrivateKeyClaims {
        iss: ISSUER.to_string(),
        sub: user.to_string(),
        iat: now,
        exp: now,
    }
}

#[async_trait]
impl TokenGenerator for PrivateKeyGenerator {
    fn enabled(&self) -> bool {
        true
    }

    async fn get(&self) -> Result<String> {
        self.cache.get_or_mint(|| self.mint()).await
    }

    async fn run(&self, cancel: CancellationToken) {
        refresh_loop("private-key", REFRESH_INTERVAL, cancel, || {
            self.cache.remint(|| self.mint())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use std::io::Write;

    const PRIVATE_PEM: &str = include_str!("../../tests/fixtures/rsa_private.pem");
    const PRIVATE_PKCS8_PEM: &str = include_str!("../../tests/fixtures/rsa_private_pkcs8.pem");
    const PUBLIC_PEM: &str = include_str!("../../tests/fixtures/rsa_public.pem");

    fn verify(token: &str) -> PrivateKeyClaims {
        let key = DecodingKey::from_rsa_pem(PUBLIC_PEM.as_bytes()).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);
        decode::<PrivateKeyClaims>(token, &key, &validation)
            .unwrap()
            .claims
    }

    #[tokio::test]
    async fn test_get_returns_valid_jwt() {
        let gen = PrivateKeyGenerator::from_pem(PRIVATE_PEM.as_bytes(), "test-user").unwrap();
        assert!(gen.enabled());
        let token = gen.get().await.unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = verify(&token);
        assert_eq!(claims.sub, "test-user");
        assert_eq!(claims.iss, ISSUER);
        assert!(claims.exp > claims.iat);
        assert_eq!(claims.exp - claims.iat, TOKEN_VALIDITY_SECS);
    }

    #[tokio::test]
    async fn test_pkcs8_key_accepted() {
        let gen = PrivateKeyGenerator::from_pem(PRIVATE_PKCS8_PEM.as_bytes(), "u").unwrap();
        let claims = verify(&gen.get().await.unwrap());
        assert_eq!(claims.sub, "u");
    }

    #[tokio::test]
    async fn test_get_caches_within_window() {
        let gen = PrivateKeyGenerator::from_pem(PRIVATE_PEM.as_bytes(), "test-user").unwrap();
        let token1 = gen.get().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let token2 = gen.get().await.unwrap();
        assert_eq!(token1, token2);
    }

    #[tokio::test]
    async fn test_get_regenerates_after_expiry() {
        let gen = PrivateKeyGenerator::from_pem(PRIVATE_PEM.as_bytes(), "test-user").unwrap();
        let token1 = gen.get().await.unwrap();
        let before = gen.cache.snapshot().await.unwrap().expires_at;
        // Move to the next second so iat, and therefore the token, differs
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        gen.cache.expire_now().await;
        let token2 = gen.get().await.unwrap();
        assert_ne!(token1, token2);
        assert!(gen.cache.snapshot().await.unwrap().expires_at > before);
    }

    #[tokio::test]
    async fn test_cache_expiry_matches_exp_claim() {
        let gen = PrivateKeyGenerator::from_pem(PRIVATE_PEM.as_bytes(), "test-user").unwrap();
        for _ in 0..5 {
            let cached = gen.mint().await.unwrap();
            let claims = verify(&cached.value);
            assert_eq!(cached.expires_at.timestamp_millis(), claims.exp * 1000);
            assert_eq!(claims.exp - claims.iat, TOKEN_VALIDITY_SECS);
            tokio::time::sleep(std::time::Duration::from_millis(230)).await;
        }
    }

    #[test]
    fn test_from_file_errors() {
        let missing = PrivateKeyGenerator::from_file(Path::new("/nonexistent/key.pem"), "u");
        assert!(matches!(missing, Err(TunnelError::CredentialError(_))));

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        garbage.write_all(b"not a pem file").unwrap();
        let bad = PrivateKeyGenerator::from_file(garbage.path(), "u");
        assert!(matches!(bad, Err(TunnelError::CredentialError(_))));

        let mut public = tempfile::NamedTempFile::new().unwrap();
        public.write_all(PUBLIC_PEM.as_bytes()).unwrap();
        assert!(PrivateKeyGenerator::from_file(public.path(), "u").is_err());
    }

    #[test]
    fn test_from_file_ok() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PRIVATE_PEM.as_bytes()).unwrap();
        let gen = PrivateKeyGenerator::from_file(file.path(), "someone").unwrap();
        assert_eq!(gen.user(), "someone");
    }
}
