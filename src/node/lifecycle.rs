//! Lifecycle of the single DHT node.
//!
//! ```text
//! NotStarted ──start──▶ Starting ──ok──▶ Running ──stop──▶ Stopped
//!     ▲                    │                                  │
//!     └──── startup fails ─┘        Stopped ──start──▶ Starting
//! ```
//!
//! Start and stop are serialized by an async mutex that is held across the
//! component's `initialize`, so two activation events racing from
//! `NotStarted` cannot both initialize a node. The current status (and the
//! handle while running) lives in a watch channel: readers never take the
//! transition lock, and in-flight client calls notice a stop immediately.

use crate::component::{
    CacheCallback, ComponentHandle, ComponentLocation, DhtComponent, LogCallback, NodeCallbacks,
    NodeParams,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NotStarted,
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// The one running node.
pub struct NodeHandle {
    pub identity: String,
    pub bootstrap: String,
    pub dht_port: u16,
    pub proxy_port: u16,
    pub entry: String,
    pub location: ComponentLocation,
    pub started_at: Instant,
    component: Arc<dyn DhtComponent>,
}

impl NodeHandle {
    pub fn component(&self) -> &Arc<dyn DhtComponent> {
        &self.component
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("identity", &self.identity)
            .field("bootstrap", &self.bootstrap)
            .field("dht_port", &self.dht_port)
            .field("proxy_port", &self.proxy_port)
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

/// Status published on the watch channel.
#[derive(Debug, Clone)]
pub enum NodeStatus {
    NotStarted,
    Starting,
    Running(Arc<NodeHandle>),
    Stopped,
}

impl NodeStatus {
    pub fn state(&self) -> NodeState {
        match self {
            Self::NotStarted => NodeState::NotStarted,
            Self::Starting => NodeState::Starting,
            Self::Running(_) => NodeState::Running,
            Self::Stopped => NodeState::Stopped,
        }
    }

    pub fn handle(&self) -> Option<&Arc<NodeHandle>> {
        match self {
            Self::Running(handle) => Some(handle),
            _ => None,
        }
    }

    /// True while `handle` is the running node.
    pub fn is_running_handle(&self, handle: &Arc<NodeHandle>) -> bool {
        matches!(self, Self::Running(current) if Arc::ptr_eq(current, handle))
    }
}

/// Loader-level faults detected at start.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("component '{entry}' at {location} is no longer trusted")]
    Untrusted {
        entry: String,
        location: ComponentLocation,
    },
}

/// Holds `Starting` while `initialize` runs. Reverts to the idle status it
/// was built with when dropped armed, including when `start` is cancelled.
struct StartingGuard<'a> {
    status: &'a watch::Sender<NodeStatus>,
    idle: Option<NodeStatus>,
}

impl StartingGuard<'_> {
    fn disarm(&mut self) {
        self.idle = None;
    }

    fn revert(&mut self) {
        if let Some(idle) = self.idle.take() {
            self.status.send_replace(idle);
        }
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.idle.is_some() {
            warn!("node start abandoned before initialize finished");
            self.revert();
        }
    }
}

/// Owner of the node slot.
pub struct NodeLifecycle {
    transition: Mutex<()>,
    status: watch::Sender<NodeStatus>,
}

impl NodeLifecycle {
    pub fn new() -> Self {
        let (status, _) = watch::channel(NodeStatus::NotStarted);
        Self {
            transition: Mutex::new(()),
            status,
        }
    }

    pub fn state(&self) -> NodeState {
        self.status.borrow().state()
    }

    pub fn is_started(&self) -> bool {
        self.state() == NodeState::Running
    }

    /// Running node, if any.
    pub fn handle(&self) -> Option<Arc<NodeHandle>> {
        self.status.borrow().handle().cloned()
    }

    /// Watch the status.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    /// Start the node unless it is already running.
    ///
    /// Returns `Ok(true)` when the node is running afterwards, `Ok(false)` when
    /// the component reported a startup failure (not retried here), and `Err`
    /// only when the component may not run at all.
    pub async fn start(
        &self,
        component: &ComponentHandle,
        cache: Arc<dyn CacheCallback>,
        log: Arc<dyn LogCallback>,
        params: NodeParams,
    ) -> Result<bool, LifecycleError> {
        let _transition = self.transition.lock().await;

        let previous = self.status.borrow().clone();
        if let NodeStatus::Running(handle) = &previous {
            info!(identity = %handle.identity, "node already running, start ignored");
            return Ok(true);
        }

        if !component.is_trusted() {
            return Err(LifecycleError::Untrusted {
                entry: component.entry().to_string(),
                location: component.location().clone(),
            });
        }

        let dht = Arc::clone(component.component());
        if dht.is_started() {
            info!(entry = %component.entry(), "component reports a running node, adopting it");
            self.status
                .send_replace(NodeStatus::Running(Self::handle_for(component, &params)));
            return Ok(true);
        }

        self.status.send_replace(NodeStatus::Starting);
        let mut starting = StartingGuard {
            status: &self.status,
            idle: Some(match previous {
                NodeStatus::Stopped => NodeStatus::Stopped,
                _ => NodeStatus::NotStarted,
            }),
        };
        info!(
            identity = %params.identity,
            bootstrap = %params.bootstrap,
            dht_port = params.dht_port,
            proxy_port = params.proxy_port,
            "starting node"
        );

        match dht.initialize(&params, NodeCallbacks { cache, log }).await {
            Ok(()) => {
                starting.disarm();
                self.status
                    .send_replace(NodeStatus::Running(Self::handle_for(component, &params)));
                info!(identity = %params.identity, "node running");
                Ok(true)
            }
            Err(e) => {
                warn!(identity = %params.identity, error = %e, "node failed to start");
                starting.revert();
                Ok(false)
            }
        }
    }

    /// Stop the running node. No-op unless running.
    ///
    /// The status flips to `Stopped` before the component is asked to stop,
    /// so pending client calls are released without waiting for it.
    pub async fn stop(&self) {
        let _transition = self.transition.lock().await;

        let handle = match self.status.borrow().handle() {
            Some(handle) => Arc::clone(handle),
            None => return,
        };
        self.status.send_replace(NodeStatus::Stopped);

        if let Err(e) = handle.component.stop().await {
            warn!(identity = %handle.identity, error = %e, "component stop failed");
        }
        info!(
            identity = %handle.identity,
            uptime = ?handle.started_at.elapsed(),
            "node stopped"
        );
    }

    fn handle_for(component: &ComponentHandle, params: &NodeParams) -> Arc<NodeHandle> {
        Arc::new(NodeHandle {
            identity: params.identity.clone(),
            bootstrap: params.bootstrap.clone(),
            dht_port: params.dht_port,
            proxy_port: params.proxy_port,
            entry: component.entry().to_string(),
            location: component.location().clone(),
            started_at: Instant::now(),
            component: Arc::clone(component.component()),
        })
    }
}

impl Default for NodeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLifecycle")
            .field("state", &self.state())
            .finish()
    }
}
