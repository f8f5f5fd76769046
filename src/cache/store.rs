//! In-memory typed cache with per-entry TTL tracking.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::key::CacheKey;

/// A single cached value with its storage metadata.
///
/// Owned by [`TypedCache`]; callers only ever receive clones of the value.
struct CacheEntry {
  value: Arc<dyn Any + Send + Sync>,
  stored_at: Instant,
  cached_at: DateTime<Utc>,
  ttl: Option<Duration>,
}

impl CacheEntry {
  /// Entries without a TTL stay fresh until invalidated.
  fn is_fresh(&self, now: Instant) -> bool {
    match self.ttl {
      Some(ttl) => now.saturating_duration_since(self.stored_at) < ttl,
      None => true,
    }
  }
}

/// A typed read of a cache entry.
#[derive(Debug, Clone)]
pub struct CachedValue<T> {
  pub value: T,
  /// Wall-clock time the value was stored
  pub cached_at: DateTime<Utc>,
  pub is_fresh: bool,
}

/// Process-lifetime key/value store shared by every consumer of the sync core.
///
/// Values of any `Clone` type can be stored; a read with the wrong type is a
/// miss rather than a panic. All operations are O(1) map operations behind a
/// single mutex, so none of them block for long and none of them fail.
#[derive(Clone, Default)]
pub struct TypedCache {
  entries: Arc<Mutex<HashMap<CacheKey, CacheEntry>>>,
}

impl TypedCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
    // Critical sections never leave the map half-updated, so a poisoned lock is still usable.
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Get the cached value for a key, fresh or stale.
  pub fn get<T: Clone + 'static>(&self, key: &CacheKey) -> Option<T> {
    self.lookup(key).map(|cached| cached.value)
  }

  /// Get the cached value together with its freshness metadata.
  pub fn lookup<T: Clone + 'static>(&self, key: &CacheKey) -> Option<CachedValue<T>> {
    let entries = self.entries();
    let entry = entries.get(key)?;

    let Some(value) = entry.value.downcast_ref::<T>() else {
      tracing::warn!(
        key = %key,
        expected = std::any::type_name::<T>(),
        "cached value has a different type, treating as miss"
      );
      return None;
    };

    Some(CachedValue {
      value: value.clone(),
      cached_at: entry.cached_at,
      is_fresh: entry.is_fresh(Instant::now()),
    })
  }

  /// Store a value, replacing any existing entry for the key.
  pub fn set<T: Send + Sync + 'static>(&self, key: &CacheKey, value: T, ttl: Option<Duration>) {
    let entry = CacheEntry {
      value: Arc::new(value),
      stored_at: Instant::now(),
      cached_at: Utc::now(),
      ttl,
    };
    self.entries().insert(key.clone(), entry);
  }

  /// True iff an entry exists, regardless of freshness.
  pub fn has(&self, key: &CacheKey) -> bool {
    self.entries().contains_key(key)
  }

  /// True iff an entry exists and is within its TTL.
  pub fn is_fresh(&self, key: &CacheKey) -> bool {
    self
      .entries()
      .get(key)
      .is_some_and(|entry| entry.is_fresh(Instant::now()))
  }

  /// Remove the entry for a key. Returns whether anything was removed.
  pub fn invalidate(&self, key: &CacheKey) -> bool {
    self.entries().remove(key).is_some()
  }

  /// Remove every entry in a domain, returning the removed keys.
  pub fn invalidate_domain(&self, domain: &str) -> Vec<CacheKey> {
    self.invalidate_where(|key| key.domain() == domain)
  }

  /// Remove every entry scoped to one entity (e.g. all data for a deleted pet).
  pub fn invalidate_scope(&self, scope_id: &str) -> Vec<CacheKey> {
    self.invalidate_where(|key| key.scope_id() == scope_id)
  }

  fn invalidate_where(&self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
    let mut entries = self.entries();
    let removed: Vec<CacheKey> = entries.keys().filter(|k| predicate(k)).cloned().collect();
    for key in &removed {
      entries.remove(key);
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries().is_empty()
  }
}
