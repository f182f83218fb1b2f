//! The single DHT node and the operations run against it.
//!
//! - [`NodeLifecycle`]: start/stop state machine owning the node
//! - [`KeyValueClient`]: get/put against the running node
//! - [`CacheAnnouncer`]: publishes cached URLs for this proxy

pub mod announce;
pub mod client;
pub mod lifecycle;

pub use announce::{AnnounceError, AnnounceReport, CacheAnnouncer, RetryPolicy};
pub use client::{ClientError, KeyValueClient};
pub use lifecycle::{LifecycleError, NodeHandle, NodeLifecycle, NodeState, NodeStatus};
