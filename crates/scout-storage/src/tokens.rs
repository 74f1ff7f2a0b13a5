use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::AuthTokens;
use tokio::sync::RwLock;

/// Per-provider credential cache. Implementations hold at most one bundle per provider
/// and replace bundles wholesale, so a reader never observes a half-written bundle.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Last writer wins.
    async fn save_tokens(&self, provider: &str, tokens: AuthTokens);

    async fn get_tokens(&self, provider: &str) -> Option<AuthTokens>;

    async fn clear_tokens(&self, provider: &str);

    async fn has_valid_tokens_at(&self, provider: &str, now: DateTime<Utc>) -> bool {
        self.get_tokens(provider)
            .await
            .is_some_and(|tokens| tokens.is_valid_at(now))
    }

    async fn has_valid_tokens(&self, provider: &str) -> bool {
        self.has_valid_tokens_at(provider, Utc::now()).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    bundles: RwLock<HashMap<String, AuthTokens>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save_tokens(&self, provider: &str, tokens: AuthTokens) {
        self.bundles.write().await.insert(provider.to_string(), tokens);
    }

    async fn get_tokens(&self, provider: &str) -> Option<AuthTokens> {
        self.bundles.read().await.get(provider).cloned()
    }

    async fn clear_tokens(&self, provider: &str) {
        self.bundles.write().await.remove(provider);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn validity_tracks_save_clear_and_expiry() {
        let store = MemoryTokenStore::new();
        assert!(!store.has_valid_tokens("vinted").await);

        store.save_tokens("vinted", AuthTokens::bearer("a")).await;
        assert!(store.has_valid_tokens("vinted").await);

        store.clear_tokens("vinted").await;
        assert!(!store.has_valid_tokens("vinted").await);
        assert!(store.get_tokens("vinted").await.is_none());

        let now = Utc::now();
        store
            .save_tokens("vinted", AuthTokens::bearer("b").expiring_at(now + Duration::hours(1)))
            .await;
        assert!(store.has_valid_tokens("vinted").await);
        assert!(!store.has_valid_tokens_at("vinted", now + Duration::hours(2)).await);

        store
            .save_tokens("vinted", AuthTokens::bearer("c").expiring_at(now - Duration::seconds(1)))
            .await;
        assert!(!store.has_valid_tokens("vinted").await);
    }

    #[tokio::test]
    async fn bundles_are_isolated_per_provider() {
        let store = MemoryTokenStore::new();
        store.save_tokens("vinted", AuthTokens::bearer("v")).await;
        store.save_tokens("ebay", AuthTokens::bearer("e")).await;
        store.save_tokens("vinted", AuthTokens::bearer("v2")).await;

        assert_eq!(
            store.get_tokens("vinted").await.and_then(|t| t.bearer_token),
            Some("v2".to_string())
        );
        assert_eq!(
            store.get_tokens("ebay").await.and_then(|t| t.bearer_token),
            Some("e".to_string())
        );
        store.clear_tokens("ebay").await;
        assert!(store.get_tokens("ebay").await.is_none());
        assert!(store.has_valid_tokens("vinted").await);
    }

    #[tokio::test]
    async fn concurrent_writers_leave_one_whole_bundle() {
        let store = Arc::new(MemoryTokenStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let tokens = AuthTokens {
                    session_cookie: Some(format!("cookie-{i}")),
                    bearer_token: Some(format!("bearer-{i}")),
                    csrf_token: Some(format!("csrf-{i}")),
                    expires_at: None,
                };
                store.save_tokens("leboncoin", tokens).await;
                store.get_tokens("leboncoin").await
            }));
        }
        for handle in handles {
            let seen = handle.await.expect("join").expect("bundle present");
            let cookie_id = seen.session_cookie.unwrap().trim_start_matches("cookie-").to_string();
            assert_eq!(seen.bearer_token.unwrap(), format!("bearer-{cookie_id}"));
            assert_eq!(seen.csrf_token.unwrap(), format!("csrf-{cookie_id}"));
        }
    }
}
