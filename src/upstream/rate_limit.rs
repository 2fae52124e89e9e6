//! Outbound request pacing for the upstream portal.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::trace;

/// Token-bucket limiter applied to every request made through the client.
#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(quota: Quota) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn per_minute(requests: NonZeroU32) -> Self {
        Self::new(Quota::per_minute(requests))
    }
}

#[async_trait::async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        if self.limiter.check().is_err() {
            trace!(url = %req.url(), "rate limit reached, waiting for capacity");
            self.limiter.until_ready().await;
        }
        next.run(req, extensions).await
    }
}
