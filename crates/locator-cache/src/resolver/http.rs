use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::config::ResolverConfig;

use super::{ResolveError, Resolver};

/// The body of a successful presigning response.
#[derive(Debug, Deserialize)]
struct PresignedUrl {
    url: String,
}

/// A [`Resolver`] backed by a remote presigning endpoint.
///
/// Issues `GET {url}?key={source_key}` and expects a JSON body of the form `{"url": "..."}`.
#[derive(Clone)]
pub struct HttpResolver {
    client: reqwest::Client,
    url: Url,
}

impl fmt::Debug for HttpResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResolver")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl HttpResolver {
    pub fn new(url: Url, config: &ResolverConfig) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { client, url })
    }

    /// Creates a resolver for the endpoint configured in `config`.
    ///
    /// Returns `Ok(None)` if no endpoint is configured.
    pub fn from_config(config: &ResolverConfig) -> Result<Option<Self>, ResolveError> {
        config
            .url
            .clone()
            .map(|url| Self::new(url, config))
            .transpose()
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, source_key: &str) -> Result<String, ResolveError> {
        tracing::trace!(source_key, "Requesting locator from {}", self.url);

        let response = self
            .client
            .get(self.url.clone())
            .query(&[("key", source_key)])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ResolveError::NotFound);
        }
        if !status.is_success() {
            return Err(ResolveError::BadStatus(status.as_u16()));
        }

        let presigned: PresignedUrl = response
            .json()
            .await
            .map_err(|e| ResolveError::Malformed(e.to_string()))?;

        if presigned.url.is_empty() {
            return Err(ResolveError::Malformed("empty url".into()));
        }
        Ok(presigned.url)
    }
}
