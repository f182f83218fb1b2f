//! Host HTTP cache access.
//!
//! - [`HttpCache`]: read-only view of the host cache
//! - [`DiskCache`]: directory-backed cache the host writes responses into
//! - [`CacheMaterializer`]: copies cached bodies into spool files for the node

pub mod disk;
pub mod materializer;
pub mod traits;

pub use disk::DiskCache;
pub use materializer::{CacheExtractionRecord, CacheMaterializer, CacheReadError, SpoolNamer};
pub use traits::{CacheEntry, HeaderMap, HttpCache};
