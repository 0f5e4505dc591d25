//! Response caching
//!
//! This module provides:
//! - Canonical cache keys (`METHOD:PATH?sorted&query`)
//! - A per-connector cache with TTL, LRU bounding, tags, pattern invalidation
//!   and stale-while-revalidate
//! - A registry handing out exactly one cache per connector id
//!
//! The cache never fetches on its own. A stale hit is a signal to the caller
//! (the connector) to refresh in the background.

pub mod key;
pub mod registry;
pub mod store;

pub use key::{generate_key, generate_key_from_json, query_value};
pub use registry::{AggregateCacheStats, CacheRegistry};
pub use store::{
    CacheConfig, CacheEntryOptions, CacheMetadata, CacheStats, CachedValue, ResponseCache,
};
