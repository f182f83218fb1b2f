//! Built-in in-process DHT component.
//!
//! `MemoryDht` keeps the directory in memory and never leaves the process.
//! It follows the full component contract (bootstrap validation, callbacks,
//! stop) so it serves both as the node for local runs and as the reference
//! the bridge is exercised against.

use super::traits::{
    ComponentError, ComponentResult, DhtComponent, LogCallback, NodeCallbacks, NodeParams,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::lookup_host;
use tokio::sync::RwLock;

/// Live overlay state, present between `initialize` and `stop`.
struct Overlay {
    identity: String,
    directory: HashMap<String, String>,
    log: Arc<dyn LogCallback>,
}

/// In-memory overlay node.
pub struct MemoryDht {
    overlay: RwLock<Option<Overlay>>,
    started: AtomicBool,
}

impl MemoryDht {
    /// Entry symbol the built-in registry exports this component under.
    pub const ENTRY: &'static str = "dhtfox.MemoryDht";

    pub fn new() -> Self {
        Self {
            overlay: RwLock::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Number of keys currently held.
    pub async fn len(&self) -> usize {
        self.overlay
            .read()
            .await
            .as_ref()
            .map_or(0, |o| o.directory.len())
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryDht {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the bootstrap contact; a single-process overlay only needs it to
/// be a well-formed address.
async fn resolve_bootstrap(bootstrap: &str) -> ComponentResult<SocketAddr> {
    if let Ok(addr) = bootstrap.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let mut addrs = lookup_host(bootstrap)
        .await
        .map_err(|e| ComponentError::BootstrapUnreachable(format!("{bootstrap}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| ComponentError::BootstrapUnreachable(bootstrap.to_string()))
}

#[async_trait]
impl DhtComponent for MemoryDht {
    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn initialize(
        &self,
        params: &NodeParams,
        callbacks: NodeCallbacks,
    ) -> ComponentResult<()> {
        let mut overlay = self.overlay.write().await;
        if overlay.is_some() {
            return Err(ComponentError::Rejected("node already initialized".to_string()));
        }

        let bootstrap = match resolve_bootstrap(&params.bootstrap).await {
            Ok(addr) => addr,
            Err(e) => {
                callbacks.log.error(&format!("join failed: {e}"));
                return Err(e);
            }
        };

        callbacks.log.log(&format!(
            "node '{}' listening on dht port {} (proxy {}), joined via {}, put secret {}..",
            params.identity,
            params.dht_port,
            params.proxy_port,
            bootstrap,
            hex::encode(&params.hashed_secret()[..4])
        ));

        *overlay = Some(Overlay {
            identity: params.identity.clone(),
            directory: HashMap::new(),
            log: callbacks.log,
        });
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> ComponentResult<Option<String>> {
        let overlay = self.overlay.read().await;
        let overlay = overlay.as_ref().ok_or(ComponentError::NotInitialized)?;
        Ok(overlay.directory.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> ComponentResult<()> {
        let mut overlay = self.overlay.write().await;
        let overlay = overlay.as_mut().ok_or(ComponentError::NotInitialized)?;
        overlay
            .directory
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn stop(&self) -> ComponentResult<()> {
        let mut overlay = self.overlay.write().await;
        let node = overlay.take().ok_or(ComponentError::NotInitialized)?;
        self.started.store(false, Ordering::SeqCst);
        node.log
            .log(&format!("node '{}' left the overlay", node.identity));
        Ok(())
    }
}
