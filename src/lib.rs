//! DHTFox bridge
//!
//! Hosts a peer-to-peer DHT node inside a caching web proxy and lets the
//! proxy talk to it.
//!
//! - [`trust`]: trust scopes granted to loaded component code
//! - [`component`]: locating, vetting and instantiating the DHT component
//! - [`node`]: lifecycle of the single node, get/put access and cache
//!   announcement
//! - [`cache`]: materializing HTTP cache entries as files for the node
//! - [`peer`]: serving cached responses to other peers
//! - [`logging`]: the node's log channel into the host, and subscriber setup

pub mod cache;
pub mod component;
pub mod logging;
pub mod node;
pub mod peer;
pub mod trust;

pub use cache::{CacheMaterializer, DiskCache};
pub use component::{ComponentLoader, ComponentLocation, DhtComponent, NodeParams};
pub use logging::LoggerBridge;
pub use node::{KeyValueClient, NodeLifecycle, NodeState};
pub use peer::PeerServer;
pub use trust::TrustGrantor;
