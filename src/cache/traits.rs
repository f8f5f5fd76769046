//! Per-type load policy and the shape of load results.

use chrono::{DateTime, Utc};

use super::store::CachedValue;

/// Trait for values that can be cached and loaded through the orchestrator.
///
/// The only per-type policy is what a "resource missing" answer from the
/// backend means. Aggregate or derived data (history lists, computed
/// summaries) simply has nothing in it yet, so it provides an empty value.
/// Entities return `None`, and a missing entity is reported as an error.
pub trait Resource: Clone + Send + Sync + 'static {
  /// Value to cache when the backend reports the resource as missing.
  fn empty() -> Option<Self> {
    None
  }
}

impl<T: Clone + Send + Sync + 'static> Resource for Vec<T> {
  fn empty() -> Option<Self> {
    Some(Vec::new())
  }
}

/// What a load handed back, and how current it was at the time.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Wall-clock time of the cache write the data came from; `None` when the
  /// caller waited on the network.
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// A cache hit. The caller never waited, whatever the entry's age.
  pub fn from_cached(cached: CachedValue<T>) -> Self {
    Self {
      data: cached.value,
      source: if cached.is_fresh {
        CacheSource::CacheFresh
      } else {
        CacheSource::CacheStale
      },
      cached_at: Some(cached.cached_at),
    }
  }

  pub fn is_from_cache(&self) -> bool {
    self.source != CacheSource::Network
  }
}

/// How a load was satisfied.
///
/// Cache hits of either kind may have started a silent refresh, depending on
/// the load's revalidation policy; its result arrives on the change feed, not
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// The caller waited for a fetch
  Network,
  /// Entry within its TTL, or stored without one
  CacheFresh,
  /// Entry past its TTL, returned as is while a refresh replaces it
  CacheStale,
}
