//! External DHT component integration.
//!
//! This module provides:
//! - The capability contract a DHT component implements ([`DhtComponent`])
//! - Location and manifest handling for component files
//! - A loader that only resolves entries inside a trusted scope
//! - The built-in in-memory component and a scriptable mock for tests

pub mod loader;
pub mod location;
pub mod manifest;
pub mod memory;
pub mod mock;
pub mod traits;

pub use loader::{ComponentHandle, ComponentLoader, ComponentRegistry, LoadError, ScopedLoader};
pub use location::ComponentLocation;
pub use manifest::ComponentManifest;
pub use memory::MemoryDht;
pub use traits::{
    CacheCallback, ComponentError, ComponentResult, DhtComponent, LogCallback, NodeCallbacks,
    NodeParams, COMPONENT_ABI_VERSION,
};
