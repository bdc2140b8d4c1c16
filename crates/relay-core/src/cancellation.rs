use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Tracks the abort token for each in-flight top-level query. One token
/// per query, shared by reference through every tool invocation and
/// classifier call the query triggers.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, query_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(query_id.to_string(), token.clone());
        token
    }

    pub async fn get(&self, query_id: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(query_id).cloned()
    }

    pub async fn cancel(&self, query_id: &str) -> bool {
        let Some(token) = self.get(query_id).await else {
            return false;
        };
        token.cancel();
        true
    }

    pub async fn remove(&self, query_id: &str) {
        self.tokens.write().await.remove(query_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_fires_the_query_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("q1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("q1").await);
        assert!(token.is_cancelled());
        registry.remove("q1").await;
        assert!(registry.get("q1").await.is_none());
    }

    #[tokio::test]
    async fn cancel_of_unknown_query_is_a_noop() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("missing").await);
    }
}
