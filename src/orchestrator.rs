//! Cache-first load coordination.
//!
//! [`LoadOrchestrator`] sits between screens (or the poller) and the fetch
//! functions they supply:
//!
//! 1. A present cache entry is returned immediately and a silent refresh is
//!    started in the background
//! 2. Otherwise the caller attaches to an in-flight fetch for the key, or a
//!    new fetch is spawned, so there is at most one fetch per key at a time
//! 3. Every wait is raced against a timeout; losing the race leaves the fetch
//!    running and its eventual result still lands in the cache
//! 4. A fetch that every waiter gave up on is replaced by the next load for
//!    its key, so a hung backend call never blocks a key for good
//! 5. Results are written through to the cache and announced on a change feed

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;

use crate::cache::{CacheKey, CacheResult, Resource, TypedCache};
use crate::diagnostics::{DiagnosticEvent, DiagnosticsSink};
use crate::error::{FetchError, SyncError};

/// Default time a caller waits for a fetch before getting [`SyncError::Timeout`].
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(15);

const CHANGE_FEED_CAPACITY: usize = 256;

type ErasedValue = Arc<dyn Any + Send + Sync>;
type Outcome = Result<ErasedValue, SyncError>;

/// Per-key load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
  Idle,
  Loading,
  Succeeded,
  Failed,
}

/// When a cache hit should also trigger a silent refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Revalidate {
  /// On every cache hit
  #[default]
  Always,
  /// Only once the entry is past its TTL. Entries without a TTL are never
  /// refreshed from a cache hit.
  IfStale,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
  /// Skip the cache read and always fetch. The result is still cached.
  pub force_refresh: bool,
  /// Report [`LoadProgress`] when the caller has to wait for the network.
  pub show_loading_if_needed: bool,
  /// How long any caller, foreground or background, waits for the fetch.
  pub timeout: Duration,
  /// TTL for the cached result; `None` keeps it fresh until invalidated.
  pub ttl: Option<Duration>,
  pub revalidate: Revalidate,
}

impl Default for LoadOptions {
  fn default() -> Self {
    Self {
      force_refresh: false,
      show_loading_if_needed: true,
      timeout: DEFAULT_LOAD_TIMEOUT,
      ttl: None,
      revalidate: Revalidate::Always,
    }
  }
}

impl LoadOptions {
  pub fn force_refresh(mut self) -> Self {
    self.force_refresh = true;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_revalidate(mut self, revalidate: Revalidate) -> Self {
    self.revalidate = revalidate;
    self
  }

  pub fn quiet(mut self) -> Self {
    self.show_loading_if_needed = false;
    self
  }
}

/// Progress of a load that has to wait on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProgress {
  Started,
  Finished,
}

/// Change to a cache entry made through the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
  Updated(CacheKey),
  Invalidated(CacheKey),
}

impl CacheChange {
  pub fn key(&self) -> &CacheKey {
    match self {
      CacheChange::Updated(key) | CacheChange::Invalidated(key) => key,
    }
  }
}

/// One spawned fetch and the callers waiting on it.
struct Flight {
  id: u64,
  rx: watch::Receiver<Option<Outcome>>,
  waiters: usize,
  /// Every waiter gave up before the outcome arrived
  abandoned: bool,
  task: Option<AbortHandle>,
}

/// A flight registered under the registry lock but not spawned yet.
struct NewFlight {
  id: u64,
  tx: watch::Sender<Option<Outcome>>,
  rx: watch::Receiver<Option<Outcome>>,
  superseded: Option<AbortHandle>,
}

#[derive(Default)]
struct Registry {
  in_flight: HashMap<CacheKey, Flight>,
  states: HashMap<CacheKey, LoadState>,
  next_flight: u64,
}

impl Registry {
  /// The key's in-flight fetch, unless everyone waiting on it has given up.
  fn live_flight(&mut self, key: &CacheKey) -> Option<&mut Flight> {
    self.in_flight.get_mut(key).filter(|flight| !flight.abandoned)
  }

  /// Register a new flight with one waiter, replacing an abandoned one.
  fn open_flight(&mut self, key: &CacheKey) -> NewFlight {
    self.next_flight += 1;
    let id = self.next_flight;
    let (tx, rx) = watch::channel(None);
    let replaced = self.in_flight.insert(
      key.clone(),
      Flight {
        id,
        rx: rx.clone(),
        waiters: 1,
        abandoned: false,
        task: None,
      },
    );
    self.states.insert(key.clone(), LoadState::Loading);

    NewFlight {
      id,
      tx,
      rx,
      superseded: replaced.and_then(|flight| flight.task),
    }
  }
}

struct Inner {
  cache: TypedCache,
  registry: Mutex<Registry>,
  changes: broadcast::Sender<CacheChange>,
  diagnostics: Arc<dyn DiagnosticsSink>,
}

impl Inner {
  fn registry(&self) -> MutexGuard<'_, Registry> {
    self.registry.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn record(&self, event: DiagnosticEvent) {
    self.diagnostics.record(event);
  }

  fn store<T: Send + Sync + 'static>(&self, key: &CacheKey, value: T, ttl: Option<Duration>) {
    self.cache.set(key, value, ttl);
    // No subscribers is fine
    let _ = self.changes.send(CacheChange::Updated(key.clone()));
  }

  fn remove(&self, key: &CacheKey) -> bool {
    let removed = self.cache.invalidate(key);
    if removed {
      let _ = self.changes.send(CacheChange::Invalidated(key.clone()));
    }
    removed
  }

  /// Apply a fetch result to the cache and turn it into the shared outcome.
  fn settle<T: Resource>(
    &self,
    key: &CacheKey,
    result: Result<T, FetchError>,
    ttl: Option<Duration>,
  ) -> Outcome {
    match result {
      Ok(value) => {
        self.store(key, value.clone(), ttl);
        Ok(Arc::new(value))
      }
      Err(FetchError::NotFound) => match T::empty() {
        Some(empty) => {
          tracing::debug!(key = %key, "resource missing, caching empty result");
          self.store(key, empty.clone(), ttl);
          Ok(Arc::new(empty))
        }
        None => {
          if self.remove(key) {
            tracing::info!(key = %key, "resource removed upstream, invalidated cache entry");
          }
          Err(SyncError::ResourceMissing { key: key.clone() })
        }
      },
      Err(err) => {
        let err = SyncError::from_fetch(key, err);
        if matches!(err, SyncError::Decode(_)) {
          tracing::error!(key = %key, error = %err, "fetch returned undecodable data");
        } else {
          tracing::debug!(key = %key, error = %err, "fetch failed");
        }
        Err(err)
      }
    }
  }
}

/// Clears the in-flight registration for a key when its fetch task ends,
/// including when the task panics or is aborted.
struct FlightGuard {
  inner: Arc<Inner>,
  key: CacheKey,
  id: u64,
  state: LoadState,
}

impl Drop for FlightGuard {
  fn drop(&mut self) {
    let mut registry = self.inner.registry();
    // A superseded flight no longer owns the key
    if registry.in_flight.get(&self.key).map(|flight| flight.id) == Some(self.id) {
      registry.in_flight.remove(&self.key);
      registry.states.insert(self.key.clone(), self.state);
    }
  }
}

/// A caller's interest in one flight. Dropping the last waiter before the
/// outcome arrives marks the flight abandoned.
struct Waiter {
  inner: Arc<Inner>,
  key: CacheKey,
  id: u64,
  rx: watch::Receiver<Option<Outcome>>,
}

impl Waiter {
  async fn outcome(&mut self) -> Outcome {
    let outcome = match self.rx.wait_for(Option::is_some).await {
      Ok(outcome) => outcome.clone(),
      Err(_) => None,
    };
    outcome.unwrap_or_else(|| {
      Err(SyncError::Internal {
        key: self.key.clone(),
        reason: "fetch task ended without a result".to_string(),
      })
    })
  }
}

impl Drop for Waiter {
  fn drop(&mut self) {
    let mut registry = self.inner.registry();
    let Some(flight) = registry.in_flight.get_mut(&self.key) else {
      return;
    };
    if flight.id != self.id {
      return;
    }
    flight.waiters = flight.waiters.saturating_sub(1);
    if flight.waiters == 0 && self.rx.borrow().is_none() {
      flight.abandoned = true;
      tracing::debug!(key = %self.key, "no one waiting on fetch any more, next load replaces it");
    }
  }
}

/// Coordinates cache reads, fetches and cache writes for every resource.
///
/// Cheap to clone; clones share the cache, in-flight registry and change feed.
#[derive(Clone)]
pub struct LoadOrchestrator {
  inner: Arc<Inner>,
}

impl LoadOrchestrator {
  pub fn new(cache: TypedCache, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
    let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        cache,
        registry: Mutex::new(Registry::default()),
        changes,
        diagnostics,
      }),
    }
  }

  pub fn cache(&self) -> &TypedCache {
    &self.inner.cache
  }

  pub(crate) fn diagnostics(&self) -> &dyn DiagnosticsSink {
    self.inner.diagnostics.as_ref()
  }

  /// Subscribe to cache changes made through this orchestrator.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
    self.inner.changes.subscribe()
  }

  pub fn load_state(&self, key: &CacheKey) -> LoadState {
    self
      .inner
      .registry()
      .states
      .get(key)
      .copied()
      .unwrap_or(LoadState::Idle)
  }

  /// Whether a fetch for `key` is running and someone is still waiting on it.
  pub fn is_in_flight(&self, key: &CacheKey) -> bool {
    self.inner.registry().live_flight(key).is_some()
  }

  /// Read the cached value without loading.
  pub fn peek<T: Clone + 'static>(&self, key: &CacheKey) -> Option<T> {
    self.inner.cache.get(key)
  }

  /// Store a value the user just wrote locally.
  pub fn write_local<T: Resource>(&self, key: &CacheKey, value: T, ttl: Option<Duration>) {
    self.inner.store(key, value, ttl);
  }

  pub fn invalidate(&self, key: &CacheKey) -> bool {
    self.inner.remove(key)
  }

  /// Invalidate every entry in a domain. Returns how many were removed.
  pub fn invalidate_domain(&self, domain: &str) -> usize {
    let removed = self.inner.cache.invalidate_domain(domain);
    self.announce_invalidated(removed)
  }

  /// Invalidate every entry scoped to one entity. Returns how many were removed.
  pub fn invalidate_scope(&self, scope_id: &str) -> usize {
    let removed = self.inner.cache.invalidate_scope(scope_id);
    self.announce_invalidated(removed)
  }

  fn announce_invalidated(&self, removed: Vec<CacheKey>) -> usize {
    let count = removed.len();
    for key in removed {
      let _ = self.inner.changes.send(CacheChange::Invalidated(key));
    }
    count
  }

  /// Load a resource cache-first. See [`load_with_progress`](Self::load_with_progress).
  pub async fn load<T, F, Fut>(
    &self,
    key: &CacheKey,
    fetch: F,
    options: &LoadOptions,
  ) -> Result<CacheResult<T>, SyncError>
  where
    T: Resource,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    self.load_with_progress(key, fetch, options, |_| {}).await
  }

  /// Load a resource cache-first, reporting when the caller has to wait.
  ///
  /// A cache hit returns without waiting and never reports progress. A miss
  /// (or `force_refresh`) waits on the key's single in-flight fetch for at
  /// most `options.timeout`; `progress` sees `Started` before the wait and
  /// `Finished` after it when `show_loading_if_needed` is set.
  pub async fn load_with_progress<T, F, Fut, P>(
    &self,
    key: &CacheKey,
    fetch: F,
    options: &LoadOptions,
    mut progress: P,
  ) -> Result<CacheResult<T>, SyncError>
  where
    T: Resource,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    P: FnMut(LoadProgress),
  {
    if !options.force_refresh {
      if let Some(cached) = self.inner.cache.lookup::<T>(key) {
        self.inner.record(DiagnosticEvent::CacheHit { key: key.clone() });
        if !cached.is_fresh || options.revalidate == Revalidate::Always {
          self.spawn_refresh(key, fetch, options);
        }
        return Ok(CacheResult::from_cached(cached));
      }
      self.inner.record(DiagnosticEvent::CacheMiss { key: key.clone() });
    }

    let mut waiter = self.join_or_start(key, fetch, options.ttl);

    if options.show_loading_if_needed {
      progress(LoadProgress::Started);
    }
    let waited = tokio::time::timeout(options.timeout, waiter.outcome()).await;
    drop(waiter);
    if options.show_loading_if_needed {
      progress(LoadProgress::Finished);
    }

    match waited {
      Ok(outcome) => outcome
        .and_then(|value| downcast::<T>(key, &value))
        .map(CacheResult::from_network),
      Err(_) => {
        let duration_ms = millis(options.timeout);
        tracing::warn!(key = %key, duration_ms, "load timed out, fetch continues in background");
        self.inner.record(DiagnosticEvent::LoadTimeout {
          key: key.clone(),
          duration_ms,
        });
        Err(SyncError::Timeout {
          key: key.clone(),
          after: options.timeout,
        })
      }
    }
  }

  /// Fetch a resource in the background and update the cache.
  ///
  /// Does nothing if a fetch for the key is already running. Waits at most
  /// `options.timeout`; failures are logged and reported to diagnostics,
  /// never returned, since the screen already has something to show.
  pub async fn refresh<T, F, Fut>(&self, key: &CacheKey, fetch: F, options: &LoadOptions)
  where
    T: Resource,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    if let Some(waiter) = self.start_if_idle(key, fetch, options.ttl) {
      self.finish_refresh(key, waiter, options.timeout).await;
    }
  }

  fn spawn_refresh<T, F, Fut>(&self, key: &CacheKey, fetch: F, options: &LoadOptions)
  where
    T: Resource,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    // Register synchronously so a load right after the cache hit joins this fetch
    let Some(waiter) = self.start_if_idle(key, fetch, options.ttl) else {
      return;
    };

    let this = self.clone();
    let key = key.clone();
    let timeout = options.timeout;
    tokio::spawn(async move {
      this.finish_refresh(&key, waiter, timeout).await;
    });
  }

  async fn finish_refresh(&self, key: &CacheKey, mut waiter: Waiter, timeout: Duration) {
    let outcome = match tokio::time::timeout(timeout, waiter.outcome()).await {
      Ok(outcome) => outcome,
      Err(_) => Err(SyncError::Timeout {
        key: key.clone(),
        after: timeout,
      }),
    };
    drop(waiter);

    match outcome {
      Ok(_) => {
        tracing::debug!(key = %key, "background refresh succeeded");
        self.inner.record(DiagnosticEvent::RefreshSucceeded { key: key.clone() });
      }
      Err(err) => {
        match &err {
          SyncError::Decode(_) => {
            tracing::error!(key = %key, error = %err, "background refresh failed")
          }
          SyncError::ResourceMissing { .. } => {
            tracing::info!(key = %key, "background refresh found resource missing")
          }
          _ => tracing::warn!(key = %key, error = %err, "background refresh failed"),
        }
        self.inner.record(DiagnosticEvent::RefreshFailed {
          key: key.clone(),
          error: err.kind(),
        });
      }
    }
  }

  /// Attach to the in-flight fetch for `key`, or start one.
  fn join_or_start<T, F, Fut>(&self, key: &CacheKey, fetch: F, ttl: Option<Duration>) -> Waiter
  where
    T: Resource,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let flight = {
      let mut registry = self.inner.registry();
      match registry.live_flight(key) {
        Some(flight) => {
          tracing::debug!(key = %key, "joining in-flight fetch");
          flight.waiters += 1;
          return Waiter {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id: flight.id,
            rx: flight.rx.clone(),
          };
        }
        None => registry.open_flight(key),
      }
    };
    self.launch(key, flight, fetch, ttl)
  }

  /// Start a fetch for `key` unless one is already running.
  fn start_if_idle<T, F, Fut>(
    &self,
    key: &CacheKey,
    fetch: F,
    ttl: Option<Duration>,
  ) -> Option<Waiter>
  where
    T: Resource,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let flight = {
      let mut registry = self.inner.registry();
      if registry.live_flight(key).is_some() {
        tracing::debug!(key = %key, "refresh skipped, fetch already running");
        return None;
      }
      registry.open_flight(key)
    };
    self.inner.record(DiagnosticEvent::RefreshStarted { key: key.clone() });
    Some(self.launch(key, flight, fetch, ttl))
  }

  fn launch<T, F, Fut>(
    &self,
    key: &CacheKey,
    flight: NewFlight,
    fetch: F,
    ttl: Option<Duration>,
  ) -> Waiter
  where
    T: Resource,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let NewFlight {
      id,
      tx,
      rx,
      superseded,
    } = flight;
    if let Some(stale) = superseded {
      tracing::debug!(key = %key, "replacing abandoned fetch");
      stale.abort();
    }

    let mut guard = FlightGuard {
      inner: Arc::clone(&self.inner),
      key: key.clone(),
      id,
      state: LoadState::Failed,
    };
    let future = fetch();

    let task = tokio::spawn(async move {
      let result = future.await;
      let outcome = guard.inner.settle(&guard.key, result, ttl);
      if outcome.is_ok() {
        guard.state = LoadState::Succeeded;
      }
      drop(guard);
      // Every waiter may have timed out already
      let _ = tx.send(Some(outcome));
    });

    if let Some(entry) = self.inner.registry().in_flight.get_mut(key) {
      if entry.id == id {
        entry.task = Some(task.abort_handle());
      }
    }

    Waiter {
      inner: Arc::clone(&self.inner),
      key: key.clone(),
      id,
      rx,
    }
  }
}

pub(crate) fn millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn downcast<T: Clone + 'static>(key: &CacheKey, value: &ErasedValue) -> Result<T, SyncError> {
  value.downcast_ref::<T>().cloned().ok_or_else(|| {
    SyncError::Decode(format!(
      "in-flight load for {} did not produce a {}",
      key,
      std::any::type_name::<T>()
    ))
  })
}
