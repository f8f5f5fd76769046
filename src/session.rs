//! Per-screen load lifecycle.
//!
//! A [`ViewLoadSession`] binds one resource to one screen's visibility.
//! Screens call [`on_appear`](ViewLoadSession::on_appear) and
//! [`on_disappear`](ViewLoadSession::on_disappear) and bind to the
//! `loading`, `last_error` and `value` observables; debouncing, cancellation,
//! timeouts and poll registration are handled here.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKey, Resource};
use crate::diagnostics::DiagnosticEvent;
use crate::error::ErrorKind;
use crate::gateway::Fetcher;
use crate::observable::Observable;
use crate::orchestrator::{millis, CacheChange, LoadOptions, LoadOrchestrator, LoadProgress};
use crate::polling::PollingSyncController;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_SAFETY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
  /// Repeated `on_appear` calls within this window are ignored while the
  /// screen is still visible
  pub debounce: Duration,
  /// Last-resort limit on how long `loading` can stay true
  pub safety_timeout: Duration,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      debounce: DEFAULT_DEBOUNCE,
      safety_timeout: DEFAULT_SAFETY_TIMEOUT,
    }
  }
}

struct Control {
  /// Bumped whenever the running task is superseded or cancelled
  epoch: u64,
  last_appear: Option<Instant>,
  token: CancellationToken,
  task: Option<JoinHandle<()>>,
  visible: bool,
  watching: bool,
}

impl Control {
  fn cancel(&mut self) {
    self.epoch += 1;
    self.token.cancel();
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

/// UI-bound state plus the guard that keeps cancelled tasks from touching it.
struct Bindings<T> {
  control: Arc<Mutex<Control>>,
  epoch: u64,
  token: CancellationToken,
  loading: Observable<bool>,
  last_error: Observable<Option<ErrorKind>>,
  value: Observable<Option<T>>,
}

impl<T: Clone> Bindings<T> {
  /// Apply `update` only if this task is still the screen's current one.
  ///
  /// Runs under the control lock, so it cannot interleave with `on_disappear`.
  fn publish(&self, update: impl FnOnce(&Self)) -> bool {
    let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
    if control.epoch != self.epoch || self.token.is_cancelled() {
      return false;
    }
    update(self);
    true
  }
}

/// Loads one resource for one screen and keeps it current while visible.
pub struct ViewLoadSession<T: Resource> {
  key: CacheKey,
  fetcher: Fetcher<T>,
  options: LoadOptions,
  config: SessionConfig,
  orchestrator: LoadOrchestrator,
  poller: Option<PollingSyncController>,
  control: Arc<Mutex<Control>>,
  loading: Observable<bool>,
  last_error: Observable<Option<ErrorKind>>,
  value: Observable<Option<T>>,
}

impl<T: Resource> ViewLoadSession<T> {
  pub fn new(orchestrator: LoadOrchestrator, key: CacheKey, fetcher: Fetcher<T>) -> Self {
    Self {
      key,
      fetcher,
      options: LoadOptions::default(),
      config: SessionConfig::default(),
      orchestrator,
      poller: None,
      control: Arc::new(Mutex::new(Control {
        epoch: 0,
        last_appear: None,
        token: CancellationToken::new(),
        task: None,
        visible: false,
        watching: false,
      })),
      loading: Observable::new(false),
      last_error: Observable::new(None),
      value: Observable::new(None),
    }
  }

  pub fn with_options(mut self, options: LoadOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_config(mut self, config: SessionConfig) -> Self {
    self.config = config;
    self
  }

  /// Keep the resource polled while the screen is visible.
  pub fn with_polling(mut self, poller: PollingSyncController) -> Self {
    self.poller = Some(poller);
    self
  }

  fn control(&self) -> MutexGuard<'_, Control> {
    self.control.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn loading(&self) -> &Observable<bool> {
    &self.loading
  }

  pub fn last_error(&self) -> &Observable<Option<ErrorKind>> {
    &self.last_error
  }

  pub fn value(&self) -> &Observable<Option<T>> {
    &self.value
  }

  pub fn is_visible(&self) -> bool {
    self.control().visible
  }

  /// Screen became visible. Returns false when the call was debounced.
  ///
  /// Replaces any running task with a new one that loads the resource
  /// cache-first and then follows cache changes for it.
  pub fn on_appear(&self) -> bool {
    let now = Instant::now();
    let mut control = self.control();

    // Only thrash while already visible is absorbed; an appear after a
    // disappear is a new visit
    if let Some(last) = control.last_appear.filter(|_| control.visible) {
      if now.saturating_duration_since(last) < self.config.debounce {
        tracing::debug!(key = %self.key, "on_appear debounced");
        return false;
      }
    }
    control.last_appear = Some(now);

    control.cancel();
    control.token = CancellationToken::new();
    control.visible = true;

    if let Some(poller) = &self.poller {
      if !control.watching {
        poller.watch(&self.key, Arc::clone(&self.fetcher), &self.options);
        control.watching = true;
      }
    }

    let bindings = Bindings {
      control: Arc::clone(&self.control),
      epoch: control.epoch,
      token: control.token.clone(),
      loading: self.loading.clone(),
      last_error: self.last_error.clone(),
      value: self.value.clone(),
    };
    let task = SessionTask {
      orchestrator: self.orchestrator.clone(),
      key: self.key.clone(),
      fetcher: Arc::clone(&self.fetcher),
      options: self.options.clone(),
      safety_timeout: self.config.safety_timeout,
      bindings,
    };
    control.task = Some(tokio::spawn(task.run()));
    true
  }

  /// Screen went away. Nothing from the cancelled task is published after this returns.
  pub fn on_disappear(&self) {
    let mut control = self.control();
    control.cancel();
    control.visible = false;
    self.loading.set_if_changed(false);

    if control.watching {
      if let Some(poller) = &self.poller {
        poller.unwatch(&self.key);
      }
      control.watching = false;
    }
  }
}

impl<T: Resource> Drop for ViewLoadSession<T> {
  fn drop(&mut self) {
    self.on_disappear();
  }
}

struct SessionTask<T> {
  orchestrator: LoadOrchestrator,
  key: CacheKey,
  fetcher: Fetcher<T>,
  options: LoadOptions,
  safety_timeout: Duration,
  bindings: Bindings<T>,
}

impl<T: Resource> SessionTask<T> {
  async fn run(self) {
    // Let the screen render before any work starts
    tokio::task::yield_now().await;
    if self.bindings.token.is_cancelled() {
      return;
    }

    // Subscribe first so refreshes that land during the load aren't missed
    let mut changes = self.orchestrator.subscribe();

    self.load().await;

    loop {
      let change = tokio::select! {
        _ = self.bindings.token.cancelled() => return,
        change = changes.recv() => change,
      };

      match change {
        Ok(CacheChange::Updated(key)) if key == self.key => self.republish_cached(),
        Ok(CacheChange::Invalidated(key)) if key == self.key => {
          self.bindings.publish(|b| b.value.set(None));
        }
        Ok(_) => {}
        Err(RecvError::Lagged(skipped)) => {
          tracing::debug!(key = %self.key, skipped, "change feed lagged, re-reading cache");
          self.republish_cached();
        }
        Err(RecvError::Closed) => return,
      }
    }
  }

  async fn load(&self) {
    let bindings = &self.bindings;
    let fetcher = &self.fetcher;
    let load = self.orchestrator.load_with_progress(
      &self.key,
      || fetcher(),
      &self.options,
      |progress| {
        bindings.publish(|b| {
          b.loading.set_if_changed(progress == LoadProgress::Started);
        });
      },
    );

    let result = tokio::select! {
      _ = bindings.token.cancelled() => return,
      result = tokio::time::timeout(self.safety_timeout, load) => result,
    };

    match result {
      Ok(Ok(loaded)) => {
        bindings.publish(|b| {
          b.value.set(Some(loaded.data));
          b.last_error.set(None);
          b.loading.set_if_changed(false);
        });
      }
      Ok(Err(err)) => {
        tracing::debug!(key = %self.key, error = %err, "screen load failed");
        let missing = matches!(err.kind(), ErrorKind::ResourceMissing);
        bindings.publish(|b| {
          if missing {
            b.value.set(None);
          }
          b.last_error.set(Some(err.kind()));
          b.loading.set_if_changed(false);
        });
      }
      Err(_) => {
        let duration_ms = millis(self.safety_timeout);
        tracing::warn!(
          key = %self.key,
          duration_ms,
          "screen load stalled, clearing loading state"
        );
        self.orchestrator.diagnostics().record(DiagnosticEvent::SessionStalled {
          key: self.key.clone(),
          duration_ms,
        });
        bindings.publish(|b| {
          b.last_error.set(Some(ErrorKind::Timeout));
          b.loading.set_if_changed(false);
        });
      }
    }
  }

  fn republish_cached(&self) {
    let cached = self.orchestrator.peek::<T>(&self.key);
    self.bindings.publish(|b| {
      if cached.is_some() {
        b.last_error.set(None);
      }
      b.value.set(cached);
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::TypedCache;
  use crate::diagnostics::MemorySink;
  use crate::error::FetchError;
  use crate::gateway::fetcher_fn;
  use crate::orchestrator::Revalidate;
  use crate::polling::PollingConfig;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn setup() -> (LoadOrchestrator, MemorySink) {
    let sink = MemorySink::new();
    (
      LoadOrchestrator::new(TypedCache::new(), Arc::new(sink.clone())),
      sink,
    )
  }

  fn history_key() -> CacheKey {
    CacheKey::new("weightHistory", "pet-1")
  }

  fn delayed_fetcher(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
    records: Vec<u32>,
  ) -> Fetcher<Vec<u32>> {
    let calls = Arc::clone(calls);
    fetcher_fn(move || {
      calls.fetch_add(1, Ordering::SeqCst);
      let records = records.clone();
      async move {
        tokio::time::sleep(delay).await;
        Ok::<_, FetchError>(records)
      }
    })
  }

  fn hanging_fetcher() -> Fetcher<Vec<u32>> {
    fetcher_fn(|| futures::future::pending::<Result<Vec<u32>, FetchError>>())
  }

  #[tokio::test(start_paused = true)]
  async fn test_cold_load_shows_spinner_then_value() {
    let (orchestrator, _sink) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let session = ViewLoadSession::new(
      orchestrator.clone(),
      history_key(),
      delayed_fetcher(&calls, Duration::from_secs(1), vec![1, 2, 3]),
    );

    assert!(session.on_appear());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(session.loading().get());
    assert_eq!(session.value().get(), None);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!session.loading().get());
    assert_eq!(session.value().get(), Some(vec![1, 2, 3]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.peek::<Vec<u32>>(&history_key()), Some(vec![1, 2, 3]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_value_shows_without_spinner() {
    let (orchestrator, _sink) = setup();
    orchestrator.write_local(&history_key(), vec![1u32, 2, 3], Some(Duration::from_secs(60)));
    tokio::time::advance(Duration::from_secs(61)).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let session = ViewLoadSession::new(
      orchestrator.clone(),
      history_key(),
      delayed_fetcher(&calls, Duration::from_secs(1), vec![1, 2, 3, 4]),
    )
    .with_options(LoadOptions::default().with_ttl(Some(Duration::from_secs(60))));

    session.on_appear();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!session.loading().get());
    assert_eq!(session.value().get(), Some(vec![1, 2, 3]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Silent refresh lands and the screen follows it
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(session.value().get(), Some(vec![1, 2, 3, 4]));
    assert!(!session.loading().get());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cached_history_refreshes_in_background_without_spinner() {
    let (orchestrator, _sink) = setup();
    orchestrator.write_local(&history_key(), vec![1u32, 2, 3], None);

    let calls = Arc::new(AtomicUsize::new(0));
    let session = ViewLoadSession::new(
      orchestrator.clone(),
      history_key(),
      delayed_fetcher(&calls, Duration::from_secs(1), vec![1, 2, 3]),
    );
    let mut loading = session.loading().subscribe();

    session.on_appear();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.value().get(), Some(vec![1, 2, 3]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.value().get(), Some(vec![1, 2, 3]));
    assert!(!loading.has_changed().unwrap());
    assert!(!*loading.borrow_and_update());
  }

  #[tokio::test(start_paused = true)]
  async fn test_appear_right_after_disappear_is_a_new_visit() {
    let (orchestrator, _sink) = setup();
    let poller = PollingSyncController::new(orchestrator.clone(), PollingConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let session = ViewLoadSession::new(
      orchestrator,
      history_key(),
      delayed_fetcher(&calls, Duration::ZERO, vec![1]),
    )
    .with_options(LoadOptions::default().force_refresh())
    .with_polling(poller.clone());

    assert!(session.on_appear());
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.on_disappear();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(session.on_appear());
    assert!(session.is_visible());
    assert_eq!(poller.subscriptions().len(), 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(session.value().get(), Some(vec![1]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_rapid_appear_is_debounced() {
    let (orchestrator, _sink) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let session = ViewLoadSession::new(
      orchestrator,
      history_key(),
      delayed_fetcher(&calls, Duration::ZERO, vec![1]),
    )
    .with_options(LoadOptions::default().force_refresh());

    assert!(session.on_appear());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!session.on_appear());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(session.on_appear());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_mutation_after_disappear() {
    let (orchestrator, _sink) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let session = ViewLoadSession::new(
      orchestrator.clone(),
      history_key(),
      delayed_fetcher(&calls, Duration::from_secs(1), vec![5]),
    );

    session.on_appear();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(session.loading().get());

    session.on_disappear();
    assert!(!session.loading().get());
    assert!(!session.is_visible());

    let mut loading = session.loading().subscribe();
    let mut value = session.value().subscribe();
    let mut last_error = session.last_error().subscribe();
    loading.borrow_and_update();
    value.borrow_and_update();
    last_error.borrow_and_update();

    tokio::time::sleep(Duration::from_secs(2)).await;
    orchestrator.write_local(&history_key(), vec![6u32], None);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(!loading.has_changed().unwrap());
    assert!(!value.has_changed().unwrap());
    assert!(!last_error.has_changed().unwrap());
    assert_eq!(session.value().get(), None);
    // The fetch itself still completed and populated the cache
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_orchestrator_timeout_clears_spinner() {
    let (orchestrator, _sink) = setup();
    let session = ViewLoadSession::new(orchestrator, history_key(), hanging_fetcher())
      .with_options(LoadOptions::default().with_timeout(Duration::from_secs(15)));

    session.on_appear();
    tokio::time::sleep(Duration::from_secs(14)).await;
    assert!(session.loading().get());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!session.loading().get());
    assert_eq!(session.last_error().get(), Some(ErrorKind::Timeout));
  }

  #[tokio::test(start_paused = true)]
  async fn test_safety_timeout_guards_misconfigured_load() {
    let (orchestrator, sink) = setup();
    let session = ViewLoadSession::new(orchestrator, history_key(), hanging_fetcher())
      .with_options(LoadOptions::default().with_timeout(Duration::from_secs(3600)))
      .with_config(SessionConfig {
        debounce: DEFAULT_DEBOUNCE,
        safety_timeout: Duration::from_secs(30),
      });

    session.on_appear();
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert!(!session.loading().get());
    assert_eq!(session.last_error().get(), Some(ErrorKind::Timeout));
    assert_eq!(
      sink.count(|e| matches!(e, DiagnosticEvent::SessionStalled { duration_ms: 30000, .. })),
      1
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_follows_local_writes_while_visible() {
    let (orchestrator, _sink) = setup();
    orchestrator.write_local(&history_key(), vec![1u32], None);
    let calls = Arc::new(AtomicUsize::new(0));
    let session = ViewLoadSession::new(
      orchestrator.clone(),
      history_key(),
      delayed_fetcher(&calls, Duration::ZERO, vec![]),
    )
    .with_options(LoadOptions::default().with_revalidate(Revalidate::IfStale));

    session.on_appear();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.value().get(), Some(vec![1]));

    orchestrator.write_local(&history_key(), vec![1u32, 2], None);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.value().get(), Some(vec![1, 2]));

    orchestrator.invalidate(&history_key());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.value().get(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_polling_registration_follows_visibility() {
    let (orchestrator, _sink) = setup();
    let poller = PollingSyncController::new(orchestrator.clone(), PollingConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let session = ViewLoadSession::new(
      orchestrator,
      history_key(),
      delayed_fetcher(&calls, Duration::ZERO, vec![1]),
    )
    .with_polling(poller.clone());

    session.on_appear();
    assert_eq!(poller.subscriptions().len(), 1);
    assert!(poller.is_running());

    session.on_disappear();
    assert!(poller.subscriptions().is_empty());
    assert!(!poller.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_error_is_bound_to_last_error() {
    let (orchestrator, _sink) = setup();
    let fetcher = fetcher_fn(|| async {
      Err::<Vec<u32>, _>(FetchError::Server {
        code: 500,
        message: "boom".into(),
      })
    });
    let session = ViewLoadSession::new(orchestrator, history_key(), fetcher);

    session.on_appear();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(session.last_error().get(), Some(ErrorKind::Server { code: 500 }));
    assert!(!session.loading().get());
  }
}
