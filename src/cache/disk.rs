//! Directory-backed HTTP cache.
//!
//! One response is two files named after the SHA-256 of its URL:
//!
//! ```text
//! <dir>/<hex sha256(url)>          body bytes
//! <dir>/<hex sha256(url)>.header   {"url": "...", "headers": {...}, "body_len": n}
//! ```
//!
//! An entry only counts as cached when both files exist. Stores in progress
//! live under `.tmp-<random>` names until they are renamed into place.

use super::traits::{CacheEntry, HeaderMap, HttpCache};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const HEADER_SUFFIX: &str = ".header";

/// Marks files of a store still in progress.
const TEMP_MARKER: &str = ".tmp-";

/// Attempts before giving up on an entry that keeps changing under a reader.
const OPEN_ATTEMPTS: usize = 3;

/// Header file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredHeaders {
    url: String,
    headers: HeaderMap,
    /// Length of the body this header was written with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body_len: Option<u64>,
}

/// HTTP cache stored under one directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    /// Open (creating if needed) the cache directory.
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File stem for `url`.
    pub fn file_stem(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    pub fn body_path(&self, url: &str) -> PathBuf {
        self.dir.join(Self::file_stem(url))
    }

    pub fn header_path(&self, url: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", Self::file_stem(url), HEADER_SUFFIX))
    }

    /// Store a response.
    ///
    /// Both files are written under temporary names and renamed into place,
    /// body first, so readers never see a partial body and a failed store
    /// leaves any previous entry intact.
    pub async fn store(&self, url: &str, headers: &HeaderMap, body: &[u8]) -> io::Result<()> {
        let suffix = format!("{}{:016x}", TEMP_MARKER, rand::thread_rng().gen::<u64>());
        let body_tmp = self.dir.join(format!("{}{}", Self::file_stem(url), suffix));
        let header_tmp = self.dir.join(format!(
            "{}{}{}",
            Self::file_stem(url),
            HEADER_SUFFIX,
            suffix
        ));

        let result = self
            .write_files(url, headers, body, &body_tmp, &header_tmp)
            .await;
        if let Err(e) = &result {
            warn!(%url, error = %e, "cache store aborted");
            remove_if_present(&body_tmp).await;
            remove_if_present(&header_tmp).await;
        }
        result
    }

    async fn write_files(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: &[u8],
        body_tmp: &Path,
        header_tmp: &Path,
    ) -> io::Result<()> {
        let stored = StoredHeaders {
            url: url.to_string(),
            headers: headers.clone(),
            body_len: Some(body.len() as u64),
        };
        let json = serde_json::to_vec(&stored).map_err(io::Error::other)?;

        write_synced(body_tmp, body).await?;
        write_synced(header_tmp, &json).await?;

        fs::rename(body_tmp, self.body_path(url)).await?;
        fs::rename(header_tmp, self.header_path(url)).await?;

        debug!(%url, bytes = body.len(), "cached");
        Ok(())
    }

    async fn read_headers(path: &Path) -> io::Result<StoredHeaders> {
        let raw = fs::read(path).await?;
        serde_json::from_slice(&raw).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
    }

    /// URLs of every complete entry, sorted.
    pub async fn cached_urls(&self) -> io::Result<Vec<String>> {
        let mut urls = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(HEADER_SUFFIX) else {
                continue;
            };
            if !fs::try_exists(self.dir.join(stem)).await.unwrap_or(false) {
                continue;
            }
            match Self::read_headers(&item.path()).await {
                Ok(stored) if Self::file_stem(&stored.url) == stem => urls.push(stored.url),
                Ok(stored) => {
                    warn!(file = %name, url = %stored.url, "header file does not match its name")
                }
                Err(e) => warn!(file = %name, error = %e, "unreadable header file"),
            }
        }
        urls.sort();
        Ok(urls)
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial cache file");
        }
    }
}

#[async_trait]
impl HttpCache for DiskCache {
    async fn open_entry(&self, url: &str) -> io::Result<Option<CacheEntry>> {
        let header_path = self.header_path(url);
        for _ in 0..OPEN_ATTEMPTS {
            let stored = match Self::read_headers(&header_path).await {
                Ok(stored) => stored,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };

            let body = match File::open(self.body_path(url)).await {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };

            // An overwrite lands between the body and header renames.
            let len = body.metadata().await?.len();
            if stored.body_len.is_some_and(|expected| expected != len) {
                debug!(%url, "entry replaced while opening");
                continue;
            }

            return Ok(Some(CacheEntry::new(stored.url, stored.headers, Box::new(body))));
        }
        debug!(%url, "entry kept changing, treating as not cached");
        Ok(None)
    }
}
