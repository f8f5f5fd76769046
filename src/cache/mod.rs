//! Typed client-side cache.
//!
//! This module knows nothing about the network or the UI:
//! - Entries are addressed by a `(domain, scope_id)` [`CacheKey`]
//! - Each entry tracks when it was stored and an optional TTL
//! - Stale entries stay readable until overwritten or invalidated
//! - Bulk invalidation by domain or by scope handles cross-entity deletes

mod key;
mod store;
mod traits;

pub use key::CacheKey;
pub use store::{CachedValue, TypedCache};
pub use traits::{CacheResult, CacheSource, Resource};
