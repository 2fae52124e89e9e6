//! Error types for the upstream open-data client.

use crate::upstream::json::JsonError;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request to upstream failed: {0}")]
    Request(#[from] reqwest_middleware::Error),
    #[error("upstream responded with HTTP {status} for {url}")]
    Status { status: u16, url: String, body: String },
    #[error("upstream rejected the query: {0}")]
    Rejected(String),
    #[error("failed to decode response from {url} (HTTP {status}): {source}")]
    ParseFailed {
        status: u16,
        url: String,
        #[source]
        source: JsonError,
    },
}

impl UpstreamError {
    /// Whether retrying the identical request can reasonably succeed.
    ///
    /// Network failures, timeouts, rate limiting (429) and server errors are
    /// transient. Everything else means the request itself is wrong.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(reqwest_middleware::Error::Reqwest(e)) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            Self::Request(reqwest_middleware::Error::Middleware(_)) => false,
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Rejected(_) | Self::ParseFailed { .. } => false,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(reqwest_middleware::Error::Reqwest(e))
    }
}
