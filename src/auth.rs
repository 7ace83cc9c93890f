//! Access token boundary.
//!
//! The engine never acquires or refreshes credentials. It asks a provider for
//! the current token before each upstream call.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Source of a currently valid access token.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// A token valid right now, or `None` when unauthenticated.
    async fn valid_token(&self) -> Option<String>;
}

/// Token slot written by whatever owns the authorization flow.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    token: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.filter(|t| !t.is_empty()))),
        }
    }

    /// Replace the token (e.g. after the owner refreshed it).
    pub async fn set(&self, token: Option<String>) {
        *self.token.write().await = token.filter(|t| !t.is_empty());
    }
}

#[async_trait]
impl AccessTokenProvider for SharedToken {
    async fn valid_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }
}
