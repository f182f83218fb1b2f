//! Cache-to-file materialization.
//!
//! The node reads cached responses from plain files, so every extraction
//! copies an entry's body into a freshly named spool file. Spool names are
//! `dhtfox-<process token>-<counter>.cache`: the counter keeps names unique
//! inside the process, the random token keeps them unique across restarts
//! that reuse the spool directory, and files are created with create-new so
//! an existing file is never overwritten.

use super::traits::{CacheEntry, HttpCache};
use crate::component::CacheCallback;
use async_trait::async_trait;
use rand::Rng;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Why an extraction failed. Callers only ever see `None`.
#[derive(Debug, Error)]
pub enum CacheReadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("body length {actual} does not match Content-Length {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
}

/// Result of one successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheExtractionRecord {
    pub url: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Hands out spool file paths.
#[derive(Debug)]
pub struct SpoolNamer {
    dir: PathBuf,
    token: String,
    counter: AtomicU64,
}

impl SpoolNamer {
    pub fn new(dir: PathBuf) -> Self {
        let token = format!("{:016x}", rand::thread_rng().gen::<u64>());
        Self {
            dir,
            token,
            counter: AtomicU64::new(0),
        }
    }

    /// Next unused path. Never returns the same path twice.
    pub fn next_path(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("dhtfox-{}-{}.cache", self.token, n))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Removes a spool file on drop unless disarmed.
struct SpoolGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for SpoolGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove partial spool file");
            }
        }
    }
}

/// Serves cache entries to the node as spool files.
#[derive(Clone)]
pub struct CacheMaterializer {
    cache: Arc<dyn HttpCache>,
    namer: Arc<SpoolNamer>,
}

impl CacheMaterializer {
    /// Materializer spooling into `spool_dir` (created if needed).
    pub fn new(cache: Arc<dyn HttpCache>, spool_dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = std::path::absolute(spool_dir.as_ref())?;
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            cache,
            namer: Arc::new(SpoolNamer::new(dir)),
        })
    }

    pub fn spool_dir(&self) -> &Path {
        self.namer.dir()
    }

    /// Open the cached entry for `url`. Absent and unreadable both give `None`.
    pub async fn get_cache_entry(&self, url: &str) -> Option<CacheEntry> {
        match self.cache.open_entry(url).await {
            Ok(entry) => {
                if entry.is_none() {
                    debug!(%url, "not cached");
                }
                entry
            }
            Err(e) => {
                warn!(%url, error = %e, "cache entry unreadable");
                None
            }
        }
    }

    /// Copy `entry` into a new spool file and return its absolute path.
    ///
    /// The entry is consumed and closed on every path. On failure the spool
    /// file is removed before `None` is returned.
    pub async fn read_all(&self, entry: CacheEntry) -> Option<PathBuf> {
        let url = entry.url().to_string();
        match self.spool(entry).await {
            Ok(record) => {
                debug!(url = %record.url, path = %record.path.display(), bytes = record.bytes, "materialized");
                Some(record.path)
            }
            Err(e) => {
                warn!(%url, error = %e, "materialization failed");
                None
            }
        }
    }

    /// `get_cache_entry` followed by `read_all`.
    pub async fn extract(&self, url: &str) -> Option<CacheExtractionRecord> {
        let entry = self.get_cache_entry(url).await?;
        self.spool(entry)
            .await
            .inspect_err(|e| warn!(%url, error = %e, "materialization failed"))
            .ok()
    }

    async fn spool(&self, entry: CacheEntry) -> Result<CacheExtractionRecord, CacheReadError> {
        let expected = entry.content_length();
        let (url, mut body) = entry.into_body();
        let path = self.namer.next_path();

        // Declared before `out` so the file is closed before the guard removes it.
        let mut guard = SpoolGuard {
            path: &path,
            armed: false,
        };
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        guard.armed = true;

        let bytes = tokio::io::copy(&mut body, &mut out).await?;
        drop(body);
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        if let Some(expected) = expected {
            if expected != bytes {
                return Err(CacheReadError::LengthMismatch {
                    expected,
                    actual: bytes,
                });
            }
        }

        guard.armed = false;
        Ok(CacheExtractionRecord {
            url,
            path: path.clone(),
            bytes,
        })
    }
}

#[async_trait]
impl CacheCallback for CacheMaterializer {
    async fn get_cache_entry(&self, url: &str) -> Option<CacheEntry> {
        CacheMaterializer::get_cache_entry(self, url).await
    }

    async fn read_all(&self, entry: CacheEntry) -> Option<PathBuf> {
        CacheMaterializer::read_all(self, entry).await
    }
}
