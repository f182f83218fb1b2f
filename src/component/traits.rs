//! Capability contract between the bridge and a loaded DHT component.
//!
//! The component is opaque: it owns routing, replication and the overlay
//! join. The bridge only sees the calls below, and the component only sees
//! the two callback capabilities handed to it at initialization.

use crate::cache::CacheEntry;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Version of the contract below. Manifests must declare the same value.
pub const COMPONENT_ABI_VERSION: u32 = 1;

/// Result type for component operations.
pub type ComponentResult<T> = Result<T, ComponentError>;

/// Failures reported by a component.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComponentError {
    #[error("bootstrap peer unreachable: {0}")]
    BootstrapUnreachable(String),

    #[error("component not initialized")]
    NotInitialized,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

/// Parameters for joining the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeParams {
    /// Identity label; also the secret that authorizes our puts.
    pub identity: String,
    /// `host:port` of a peer already in the overlay.
    pub bootstrap: String,
    pub dht_port: u16,
    pub proxy_port: u16,
    /// Ask the component to map its ports with UPnP.
    pub upnp: bool,
}

impl NodeParams {
    pub fn new(
        identity: impl Into<String>,
        bootstrap: impl Into<String>,
        dht_port: u16,
        proxy_port: u16,
    ) -> Self {
        Self {
            identity: identity.into(),
            bootstrap: bootstrap.into(),
            dht_port,
            proxy_port,
            upnp: false,
        }
    }

    /// SHA-256 of the identity, handed to the overlay instead of the raw secret.
    pub fn hashed_secret(&self) -> [u8; 32] {
        Sha256::digest(self.identity.as_bytes()).into()
    }
}

/// Host cache access offered to the component.
#[async_trait]
pub trait CacheCallback: Send + Sync {
    /// Open a read-only entry for `url`, or `None` if it is not cached.
    async fn get_cache_entry(&self, url: &str) -> Option<CacheEntry>;

    /// Copy the entry's body to a fresh file and return its absolute path.
    async fn read_all(&self, entry: CacheEntry) -> Option<PathBuf>;
}

/// Host log sink offered to the component. Never fails.
pub trait LogCallback: Send + Sync {
    fn log(&self, message: &str);
    fn error(&self, message: &str);
}

/// Capabilities passed to [`DhtComponent::initialize`].
#[derive(Clone)]
pub struct NodeCallbacks {
    pub cache: Arc<dyn CacheCallback>,
    pub log: Arc<dyn LogCallback>,
}

impl fmt::Debug for NodeCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCallbacks").finish_non_exhaustive()
    }
}

/// A loaded DHT node implementation.
#[async_trait]
pub trait DhtComponent: Send + Sync {
    /// Whether this component already runs a node (started by anyone).
    fn is_started(&self) -> bool;

    /// Create the node and join the overlay through `params.bootstrap`.
    async fn initialize(&self, params: &NodeParams, callbacks: NodeCallbacks)
        -> ComponentResult<()>;

    /// Current value for `key`, or `None`.
    async fn get(&self, key: &str) -> ComponentResult<Option<String>>;

    /// Store `value` under `key`; returns once accepted locally.
    async fn put(&self, key: &str, value: &str) -> ComponentResult<()>;

    /// Leave the overlay and release the node.
    async fn stop(&self) -> ComponentResult<()>;
}
