//! Host HTTP cache abstraction.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use tokio::io::AsyncRead;

/// Response headers as stored by the cache (name → values).
pub type HeaderMap = BTreeMap<String, Vec<String>>;

/// Read-only handle on one cached response.
///
/// Owning the handle owns the open body stream; dropping it closes the entry.
pub struct CacheEntry {
    url: String,
    headers: HeaderMap,
    body: Box<dyn AsyncRead + Send + Unpin>,
}

impl CacheEntry {
    pub fn new(
        url: impl Into<String>,
        headers: HeaderMap,
        body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        Self {
            url: url.into(),
            headers,
            body,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// `Content-Length` header, if present and numeric. Case-insensitive.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, values)| values.first())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Split into the URL and the body stream, closing nothing.
    pub fn into_body(self) -> (String, Box<dyn AsyncRead + Send + Unpin>) {
        (self.url, self.body)
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Read-only view of the host's HTTP cache.
///
/// Implementations never go to the network and never revalidate.
#[async_trait]
pub trait HttpCache: Send + Sync {
    /// Open the cached response for `url`, `Ok(None)` when not cached.
    async fn open_entry(&self, url: &str) -> std::io::Result<Option<CacheEntry>>;
}
