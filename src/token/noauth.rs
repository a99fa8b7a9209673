use super::TokenGenerator;
use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Generator used when no credential flag is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl NoAuth {
    pub fn new() -> Self {
        NoAuth
    }
}

#[async_trait]
impl TokenGenerator for NoAuth {
    fn enabled(&self) -> bool {
        false
    }

    async fn get(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn run(&self, _cancel: CancellationToken) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noauth() {
        let gen = NoAuth::new();
        assert!(!gen.enabled());
        assert_eq!(gen.get().await.unwrap(), "");
        assert_eq!(gen.get().await.unwrap(), "");
        // Returns immediately even with a live token
        gen.run(CancellationToken::new()).await;
    }
}
