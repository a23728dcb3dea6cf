//! Turning storage keys into locators.
//!
//! The [`Resolver`] is the only upstream dependency of the caches. It may fail, and those failures
//! are absorbed by the [`LocatorCache`](crate::LocatorCache); none of them reach its callers.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

mod http;

pub use http::HttpResolver;

/// An error that happens when resolving a storage key into a locator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No object is stored under the requested key.
    #[error("not found")]
    NotFound,
    /// The resolver responded with an unexpected status code.
    #[error("resolver responded with status {0}")]
    BadStatus(u16),
    /// The resolver could not be reached, or did not respond in time.
    ///
    /// The attached string describes the underlying transport problem.
    #[error("transport error: {0}")]
    Transport(String),
    /// The resolver responded, but the response did not contain a locator.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The resolver refused to resolve the key for another reason.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for ResolveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Resolves storage keys into locators.
#[async_trait]
pub trait Resolver: fmt::Debug + Send + Sync + 'static {
    /// Resolves `source_key` into a fresh locator.
    async fn resolve(&self, source_key: &str) -> Result<String, ResolveError>;
}

/// A resolver that rejects every key.
///
/// Used to open persisted caches for inspection and eviction when no resolver is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineResolver;

#[async_trait]
impl Resolver for OfflineResolver {
    async fn resolve(&self, _source_key: &str) -> Result<String, ResolveError> {
        Err(ResolveError::Rejected("no resolver configured".into()))
    }
}
