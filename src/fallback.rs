//! Read-through fallback to a legacy origin during migration.
//!
//! When a GET or HEAD misses the local index, an optional strategy decides
//! how to surface the origin's copy. PUT and DELETE never reach it, and it
//! never populates the local store; migration is driven externally by a
//! tool replaying uploads.

use async_trait::async_trait;

/// How to answer a miss from the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackRoute {
    /// Send the client to the origin with a 307; clients must follow.
    Redirect(String),
}

#[async_trait]
pub trait FallbackStrategy: Send + Sync + 'static {
    async fn try_fetch(&self, path: &str) -> Option<FallbackRoute>;
}

/// Redirects every miss to `<base>/<path>`. The origin's own 404 is
/// authoritative for files that exist nowhere.
pub struct RedirectFallback {
    base_url: String,
}

impl RedirectFallback {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }
}

#[async_trait]
impl FallbackStrategy for RedirectFallback {
    async fn try_fetch(&self, path: &str) -> Option<FallbackRoute> {
        Some(FallbackRoute::Redirect(format!("{}{path}", self.base_url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redirects_preserve_the_path() {
        let fallback = RedirectFallback::new("http://legacy:9999/");
        assert_eq!(
            fallback.try_fetch("/old/file").await,
            Some(FallbackRoute::Redirect(
                "http://legacy:9999/old/file".to_string()
            ))
        );
    }
}
