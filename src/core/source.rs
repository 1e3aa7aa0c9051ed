//! Rate source abstraction

use crate::core::rate::RateReading;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure: DNS, refused connection, reset, timeout.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error: unexpected status {0}")]
    BadStatus(u16),

    /// The body did not carry a usable price.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Performs one round-trip to an upstream price API.
///
/// Implementations must not retry and must not touch shared state; the
/// service decides what a failure means.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self) -> Result<RateReading, FetchError>;
}
