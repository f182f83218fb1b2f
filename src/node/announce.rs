//! Announce locally cached URLs on the DHT.
//!
//! For every complete entry in the disk cache the node publishes
//! `hex(sha256(url)) -> "<advertise address>:<proxy port>"`, so other peers
//! can find a proxy holding the response. Component failures are retried
//! with exponential backoff; a stopped node or an unreadable cache aborts
//! the whole run.

use super::client::{ClientError, KeyValueClient};
use crate::cache::DiskCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Backoff settings for announcement puts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// `humantime` strings ("1s", "500ms") for durations in config files.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Retry `operation` while `is_retryable` accepts the error, sleeping
/// according to `policy` between attempts.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) || attempt >= policy.max_retries {
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    backoff = ?backoff,
                    error = %err,
                    "attempt failed, retrying"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Only failures reported by the component are transient.
pub fn is_client_error_retryable(err: &ClientError) -> bool {
    matches!(err, ClientError::Component(_))
}

/// DHT key under which `url` is announced.
pub fn announce_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Why an announcement run was abandoned.
#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("node is not running")]
    NotRunning,

    #[error("cannot list cache at {}: {source}", dir.display())]
    CacheUnreadable {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of one announcement run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceReport {
    pub announced: usize,
    pub failed: Vec<String>,
}

/// Publishes cache contents for this proxy.
#[derive(Debug, Clone)]
pub struct CacheAnnouncer {
    advertise: String,
    proxy_port: u16,
    policy: RetryPolicy,
}

impl CacheAnnouncer {
    pub fn new(advertise: impl Into<String>, proxy_port: u16, policy: RetryPolicy) -> Self {
        Self {
            advertise: advertise.into(),
            proxy_port,
            policy,
        }
    }

    /// Value stored under every announced key.
    pub fn value(&self) -> String {
        format!("{}:{}", self.advertise, self.proxy_port)
    }

    /// Announce every complete cache entry.
    ///
    /// URLs whose put still fails after retries are listed in the report.
    /// The run is abandoned with an error when the node goes away or the
    /// cache directory cannot be listed.
    pub async fn announce_all(
        &self,
        client: &KeyValueClient,
        cache: &DiskCache,
    ) -> Result<AnnounceReport, AnnounceError> {
        let urls = cache.cached_urls().await.map_err(|source| {
            warn!(dir = %cache.dir().display(), error = %source, "cannot list cache");
            AnnounceError::CacheUnreadable {
                dir: cache.dir().to_path_buf(),
                source,
            }
        })?;

        let value = self.value();
        let mut report = AnnounceReport::default();
        for url in urls {
            let key = announce_key(&url);
            let result = retry_with_backoff(
                &self.policy,
                || client.put(&key, &value),
                is_client_error_retryable,
            )
            .await;

            match result {
                Ok(()) => {
                    debug!(%url, %key, "announced");
                    report.announced += 1;
                }
                Err(ClientError::NotRunning) => return Err(AnnounceError::NotRunning),
                Err(e) => {
                    warn!(%url, error = %e, "giving up on announcement");
                    report.failed.push(url);
                }
            }
        }

        info!(
            announced = report.announced,
            failed = report.failed.len(),
            value = %value,
            "cache announcement finished"
        );
        Ok(report)
    }
}
