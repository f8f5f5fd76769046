//! Adaptive background polling for watched resources.
//!
//! The backend has no push channel, so screens that want live data register
//! their keys here. A single timer refreshes every watched key: on a short
//! interval for a while after the user writes something, on a long interval
//! otherwise, and not at all while the app is in the background.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::{CacheKey, Resource};
use crate::gateway::Fetcher;
use crate::lifecycle::{LifecycleEvent, LifecycleSource};
use crate::orchestrator::{millis, LoadOptions, LoadOrchestrator};

pub const DEFAULT_SHORT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LONG_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FAST_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
  pub short_interval: Duration,
  pub long_interval: Duration,
  /// Fast window length used by [`PollingSyncController::on_user_write`]
  pub fast_window: Duration,
}

impl Default for PollingConfig {
  fn default() -> Self {
    Self {
      short_interval: DEFAULT_SHORT_INTERVAL,
      long_interval: DEFAULT_LONG_INTERVAL,
      fast_window: DEFAULT_FAST_WINDOW,
    }
  }
}

type Refresher = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Membership of a key in the watched set.
#[derive(Clone)]
pub struct PollSubscription {
  pub key: CacheKey,
  pub registered_at: DateTime<Utc>,
  /// Number of screens currently interested in the key
  pub watchers: usize,
  refresh: Refresher,
}

impl fmt::Debug for PollSubscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PollSubscription")
      .field("key", &self.key)
      .field("registered_at", &self.registered_at)
      .field("watchers", &self.watchers)
      .finish_non_exhaustive()
  }
}

/// Period of short-interval polling after a user write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastWindow {
  pub until: Instant,
}

struct PollState {
  subscriptions: HashMap<CacheKey, PollSubscription>,
  fast_window: Option<FastWindow>,
  foreground: bool,
  timer: Option<JoinHandle<()>>,
  /// Bumped on every timer start/stop so a superseded timer exits on its own
  generation: u64,
}

impl PollState {
  fn interval(&self, now: Instant, config: &PollingConfig) -> Duration {
    match self.fast_window {
      Some(window) if now < window.until => config.short_interval,
      _ => config.long_interval,
    }
  }
}

/// Refreshes watched keys on an adaptive timer.
///
/// Cheap to clone; clones control the same timer and watched set.
#[derive(Clone)]
pub struct PollingSyncController {
  orchestrator: LoadOrchestrator,
  config: PollingConfig,
  state: Arc<Mutex<PollState>>,
}

impl PollingSyncController {
  pub fn new(orchestrator: LoadOrchestrator, config: PollingConfig) -> Self {
    Self {
      orchestrator,
      config,
      state: Arc::new(Mutex::new(PollState {
        subscriptions: HashMap::new(),
        fast_window: None,
        foreground: true,
        timer: None,
        generation: 0,
      })),
    }
  }

  fn state(&self) -> MutexGuard<'_, PollState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Add a key to the watched set, or count one more watcher for it.
  ///
  /// Each tick refreshes the key through the orchestrator with `fetcher`,
  /// waiting at most `options.timeout` and caching the result with
  /// `options.ttl`. A tick that finds the key's previous fetch still running
  /// skips it.
  pub fn watch<T: Resource>(&self, key: &CacheKey, fetcher: Fetcher<T>, options: &LoadOptions) {
    let mut state = self.state();

    if let Some(subscription) = state.subscriptions.get_mut(key) {
      subscription.watchers += 1;
      return;
    }

    let orchestrator = self.orchestrator.clone();
    let refresh_key = key.clone();
    let options = options.clone();
    let refresh: Refresher = Arc::new(move || {
      let orchestrator = orchestrator.clone();
      let key = refresh_key.clone();
      let fetcher = Arc::clone(&fetcher);
      let options = options.clone();
      async move { orchestrator.refresh(&key, || fetcher(), &options).await }.boxed()
    });

    state.subscriptions.insert(
      key.clone(),
      PollSubscription {
        key: key.clone(),
        registered_at: Utc::now(),
        watchers: 1,
        refresh,
      },
    );
    tracing::debug!(key = %key, "watching");

    if state.foreground && state.timer.is_none() {
      self.start_timer(&mut state);
    }
  }

  /// Drop one watcher for a key. The key leaves the watched set with its last watcher.
  pub fn unwatch(&self, key: &CacheKey) {
    let mut state = self.state();

    let Some(subscription) = state.subscriptions.get_mut(key) else {
      return;
    };
    subscription.watchers -= 1;
    if subscription.watchers > 0 {
      return;
    }

    state.subscriptions.remove(key);
    tracing::debug!(key = %key, "unwatched");

    if state.subscriptions.is_empty() {
      Self::stop_timer(&mut state);
    }
  }

  /// Poll on the short interval for `duration` from now.
  ///
  /// An existing window is only ever extended. A running timer is restarted
  /// so the short interval applies right away.
  pub fn trigger_fast_window(&self, duration: Duration) {
    let mut state = self.state();

    let until = Instant::now() + duration;
    let until = match state.fast_window {
      Some(window) => window.until.max(until),
      None => until,
    };
    state.fast_window = Some(FastWindow { until });
    tracing::debug!(window_ms = millis(duration), "fast polling window set");

    if state.timer.is_some() {
      self.start_timer(&mut state);
    }
  }

  /// Signal that the user just wrote data; opens the configured fast window.
  pub fn on_user_write(&self) {
    self.trigger_fast_window(self.config.fast_window);
  }

  pub fn on_app_foreground(&self) {
    let mut state = self.state();
    state.foreground = true;
    if !state.subscriptions.is_empty() && state.timer.is_none() {
      tracing::info!("app foregrounded, resuming polling");
      self.start_timer(&mut state);
    }
  }

  pub fn on_app_background(&self) {
    let mut state = self.state();
    state.foreground = false;
    if state.timer.is_some() {
      tracing::info!("app backgrounded, pausing polling");
    }
    Self::stop_timer(&mut state);
  }

  /// Forward lifecycle events to this controller until the source closes.
  pub fn attach_lifecycle(&self, mut source: LifecycleSource) -> JoinHandle<()> {
    let controller = self.clone();
    tokio::spawn(async move {
      while let Some(event) = source.next().await {
        match event {
          LifecycleEvent::Foregrounded => controller.on_app_foreground(),
          LifecycleEvent::Backgrounded => controller.on_app_background(),
        }
      }
    })
  }

  /// Interval the timer uses right now.
  pub fn current_interval(&self) -> Duration {
    self.state().interval(Instant::now(), &self.config)
  }

  pub fn is_running(&self) -> bool {
    self.state().timer.is_some()
  }

  pub fn fast_window(&self) -> Option<FastWindow> {
    self.state().fast_window
  }

  pub fn subscriptions(&self) -> Vec<PollSubscription> {
    self.state().subscriptions.values().cloned().collect()
  }

  fn start_timer(&self, state: &mut PollState) {
    if let Some(timer) = state.timer.take() {
      timer.abort();
    }
    state.generation += 1;

    let weak = Arc::downgrade(&self.state);
    let config = self.config;
    let generation = state.generation;
    tracing::debug!(
      interval_ms = millis(state.interval(Instant::now(), &config)),
      "poll timer started"
    );
    state.timer = Some(tokio::spawn(run_timer(weak, config, generation)));
  }

  fn stop_timer(state: &mut PollState) {
    if let Some(timer) = state.timer.take() {
      timer.abort();
      tracing::debug!("poll timer stopped");
    }
    state.generation += 1;
  }
}

async fn run_timer(state: Weak<Mutex<PollState>>, config: PollingConfig, generation: u64) {
  loop {
    let interval = {
      let Some(state) = state.upgrade() else {
        return;
      };
      let state = state.lock().unwrap_or_else(PoisonError::into_inner);
      if state.generation != generation {
        return;
      }
      state.interval(Instant::now(), &config)
    };

    tokio::time::sleep(interval).await;

    let refreshers = {
      let Some(state) = state.upgrade() else {
        return;
      };
      let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
      if state.generation != generation {
        return;
      }
      if let Some(window) = state.fast_window {
        if Instant::now() >= window.until {
          state.fast_window = None;
          tracing::debug!("fast polling window expired");
        }
      }
      state
        .subscriptions
        .values()
        .map(|s| Arc::clone(&s.refresh))
        .collect::<Vec<_>>()
    };

    tracing::trace!(keys = refreshers.len(), "poll tick");
    // One task per key so a slow or failing resource can't hold up the rest
    for refresh in refreshers {
      tokio::spawn(refresh());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::TypedCache;
  use crate::diagnostics::MemorySink;
  use crate::error::FetchError;
  use crate::gateway::fetcher_fn;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn config() -> PollingConfig {
    PollingConfig {
      short_interval: Duration::from_secs(5),
      long_interval: Duration::from_secs(60),
      fast_window: Duration::from_secs(30),
    }
  }

  fn setup() -> (PollingSyncController, LoadOrchestrator) {
    let orchestrator = LoadOrchestrator::new(TypedCache::new(), Arc::new(MemorySink::new()));
    (
      PollingSyncController::new(orchestrator.clone(), config()),
      orchestrator,
    )
  }

  fn counting_fetcher(calls: &Arc<AtomicUsize>) -> Fetcher<Vec<u32>> {
    let calls = Arc::clone(calls);
    fetcher_fn(move || {
      let n = calls.fetch_add(1, Ordering::SeqCst) as u32;
      async move { Ok::<_, FetchError>(vec![n]) }
    })
  }

  fn key(scope: &str) -> CacheKey {
    CacheKey::new("weightHistory", scope)
  }

  #[tokio::test(start_paused = true)]
  async fn test_watch_polls_on_long_interval() {
    let (poller, orchestrator) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    poller.watch(&key("pet-1"), counting_fetcher(&calls), &LoadOptions::default());
    assert!(poller.is_running());

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.peek::<Vec<u32>>(&key("pet-1")), Some(vec![0]));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_last_unwatch_stops_timer() {
    let (poller, _orchestrator) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key("pet-1");

    poller.watch(&k, counting_fetcher(&calls), &LoadOptions::default());
    poller.watch(&k, counting_fetcher(&calls), &LoadOptions::default());
    assert_eq!(poller.subscriptions()[0].watchers, 2);

    poller.unwatch(&k);
    assert!(poller.is_running());

    poller.unwatch(&k);
    assert!(!poller.is_running());
    assert!(poller.subscriptions().is_empty());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fast_window_decays_to_long_interval() {
    let (poller, _orchestrator) = setup();
    assert_eq!(poller.current_interval(), Duration::from_secs(60));

    poller.trigger_fast_window(Duration::from_secs(30));
    assert_eq!(poller.current_interval(), Duration::from_secs(5));

    tokio::time::advance(Duration::from_secs(29)).await;
    assert_eq!(poller.current_interval(), Duration::from_secs(5));

    tokio::time::advance(Duration::from_millis(1001)).await;
    assert_eq!(poller.current_interval(), Duration::from_secs(60));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fast_window_is_only_extended() {
    let (poller, _orchestrator) = setup();
    poller.trigger_fast_window(Duration::from_secs(30));
    let first = poller.fast_window().unwrap().until;

    poller.trigger_fast_window(Duration::from_secs(10));
    assert_eq!(poller.fast_window().unwrap().until, first);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fast_window_changes_tick_rate() {
    let (poller, _orchestrator) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    poller.watch(&key("pet-1"), counting_fetcher(&calls), &LoadOptions::default());

    // Takes effect immediately instead of after the pending 60s sleep
    poller.trigger_fast_window(Duration::from_secs(12));
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Tick at 15s sees the expired window and drops back to 60s
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(poller.fast_window().is_none());

    tokio::time::sleep(Duration::from_secs(58)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_background_pauses_polling() {
    let (poller, _orchestrator) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    poller.watch(&key("pet-1"), counting_fetcher(&calls), &LoadOptions::default());

    poller.on_app_background();
    assert!(!poller.is_running());
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    poller.on_app_foreground();
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(poller.subscriptions().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_watch_while_backgrounded_waits_for_foreground() {
    let (poller, _orchestrator) = setup();
    poller.on_app_background();

    let calls = Arc::new(AtomicUsize::new(0));
    poller.watch(&key("pet-1"), counting_fetcher(&calls), &LoadOptions::default());
    assert!(!poller.is_running());

    poller.on_app_foreground();
    assert!(poller.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_key_does_not_block_others() {
    let (poller, _orchestrator) = setup();
    let fast_calls = Arc::new(AtomicUsize::new(0));
    let slow_calls = Arc::new(AtomicUsize::new(0));

    let slow = {
      let calls = Arc::clone(&slow_calls);
      fetcher_fn(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        futures::future::pending::<Result<Vec<u32>, FetchError>>()
      })
    };

    poller.watch(&key("slow"), slow, &LoadOptions::default());
    poller.watch(&key("fast"), counting_fetcher(&fast_calls), &LoadOptions::default());

    tokio::time::sleep(Duration::from_secs(181)).await;
    assert_eq!(fast_calls.load(Ordering::SeqCst), 3);
    // Each tick gives up on the hung fetch after the load timeout and retries
    assert_eq!(slow_calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_fetch_does_not_pile_up_tasks() {
    let (poller, orchestrator) = setup();
    let metrics = tokio::runtime::Handle::current().metrics();
    let hung = fetcher_fn(|| futures::future::pending::<Result<Vec<u32>, FetchError>>());
    let k = key("hung");
    poller.watch(&k, hung, &LoadOptions::default());

    // First tick at 60s, its wait gives up at 75s
    tokio::time::sleep(Duration::from_secs(80)).await;
    let after_one_tick = metrics.num_alive_tasks();
    assert_eq!(after_one_tick, 2);

    tokio::time::sleep(Duration::from_secs(60 * 100)).await;
    assert_eq!(metrics.num_alive_tasks(), after_one_tick);

    poller.unwatch(&k);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(metrics.num_alive_tasks(), 1);

    // The key recovers as soon as the backend answers again
    let options = LoadOptions::default()
      .force_refresh()
      .with_timeout(Duration::from_secs(1));
    let loaded = orchestrator
      .load(&k, || async { Ok(vec![7u32]) }, &options)
      .await
      .unwrap();
    assert_eq!(loaded.data, vec![7]);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(metrics.num_alive_tasks(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_lifecycle_events_drive_timer() {
    let (poller, _orchestrator) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    poller.watch(&key("pet-1"), counting_fetcher(&calls), &LoadOptions::default());

    let (events, source) = LifecycleSource::channel();
    let listener = poller.attach_lifecycle(source);

    events.send(LifecycleEvent::Backgrounded).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!poller.is_running());

    events.send(LifecycleEvent::Foregrounded).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(poller.is_running());

    drop(events);
    listener.await.unwrap();
  }
}
