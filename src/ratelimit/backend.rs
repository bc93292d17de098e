//! Rate limiter trait used by the middleware adapter.

use async_trait::async_trait;

use super::limiter::Decision;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the limiter so the adapter can be driven by
/// [`super::LimiterStore`] in production and by fixed stubs in tests.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide and report counter state for one request.
    async fn check(&self, identifier: &str) -> Result<Decision>;

    /// Decide whether one request is admitted.
    async fn allow(&self, identifier: &str) -> Result<bool> {
        self.check(identifier).await.map(|decision| decision.allowed)
    }
}
