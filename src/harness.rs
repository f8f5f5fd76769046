//! Scripted run of the sync core against an in-process backend.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cache::{CacheKey, Resource, TypedCache};
use crate::config::Config;
use crate::diagnostics::{DiagnosticEvent, DiagnosticsSink, FanoutSink, MemorySink, TracingSink};
use crate::error::FetchError;
use crate::gateway::{fetcher, FetchGateway, ResourceDescriptor};
use crate::lifecycle::{LifecycleEvent, LifecycleSource};
use crate::orchestrator::{millis, LoadOrchestrator};
use crate::polling::PollingSyncController;
use crate::session::ViewLoadSession;

/// One weigh-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
  pub recorded_at: DateTime<Utc>,
  pub grams: u32,
}

/// A pet's profile. Unlike the weight history, it is an entity: if the
/// backend says it's gone, it's gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PetProfile {
  pub id: String,
  pub name: String,
  pub target_grams: Option<u32>,
}

impl Resource for PetProfile {}

pub fn weights_path(scope: &str) -> String {
  format!("/pets/{}/weights", scope)
}

pub fn profile_path(scope: &str) -> String {
  format!("/pets/{}/profile", scope)
}

/// In-process backend serving JSON fixtures.
///
/// Every response is delayed by `latency`. With `fail_every` set to N, every
/// Nth request fails with a 503. Unknown paths answer not-found.
pub struct SimulatedGateway {
  resources: Mutex<HashMap<String, serde_json::Value>>,
  latency: Duration,
  fail_every: u32,
  requests: AtomicU32,
}

impl SimulatedGateway {
  pub fn new(
    resources: BTreeMap<String, serde_json::Value>,
    latency: Duration,
    fail_every: u32,
  ) -> Self {
    Self {
      resources: Mutex::new(resources.into_iter().collect()),
      latency,
      fail_every,
      requests: AtomicU32::new(0),
    }
  }

  /// Replace what the backend serves for `path`, as a server-side write would.
  pub fn put(&self, path: impl Into<String>, body: serde_json::Value) {
    self
      .resources
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(path.into(), body);
  }

  pub fn remove(&self, path: &str) {
    self.resources.lock().unwrap_or_else(PoisonError::into_inner).remove(path);
  }

  pub fn requests(&self) -> u32 {
    self.requests.load(Ordering::SeqCst)
  }
}

impl FetchGateway for SimulatedGateway {
  fn fetch(
    &self,
    resource: &ResourceDescriptor,
  ) -> BoxFuture<'static, Result<serde_json::Value, FetchError>> {
    let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
    let result = if self.fail_every > 0 && n % self.fail_every == 0 {
      Err(FetchError::Server {
        code: 503,
        message: "simulated outage".to_string(),
      })
    } else {
      self
        .resources
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&resource.path)
        .cloned()
        .ok_or(FetchError::NotFound)
    };

    tracing::debug!(path = %resource.path, request = n, ok = result.is_ok(), "simulated fetch");
    let latency = self.latency;
    async move {
      tokio::time::sleep(latency).await;
      result
    }
    .boxed()
  }
}

/// Fixtures used when the config provides none for the scope.
fn default_fixtures(scope: &str) -> BTreeMap<String, serde_json::Value> {
  let now = Utc::now();
  let weights: Vec<WeightRecord> = (0..3)
    .map(|i| WeightRecord {
      recorded_at: now - ChronoDuration::days(7 * (3 - i)),
      grams: 4200 - 50 * i as u32,
    })
    .collect();
  let profile = PetProfile {
    id: scope.to_string(),
    name: "Biscuit".to_string(),
    target_grams: Some(4000),
  };

  let mut fixtures = BTreeMap::new();
  fixtures.insert(weights_path(scope), serde_json::json!(weights));
  fixtures.insert(profile_path(scope), serde_json::json!(profile));
  fixtures
}

/// What a scripted run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
  /// Requests the simulated backend answered, failures included
  pub requests: u32,
  pub events: Vec<DiagnosticEvent>,
}

impl RunReport {
  pub fn count(&self, pred: impl Fn(&DiagnosticEvent) -> bool) -> usize {
    self.events.iter().filter(|e| pred(*e)).count()
  }

  /// Event counts keyed by their serialized tag, e.g. `cache_hit`.
  pub fn summary(&self) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for event in &self.events {
      let name = serde_json::to_value(event)
        .ok()
        .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
      *counts.entry(name).or_default() += 1;
    }
    counts
  }
}

/// Run the scripted scenario for `duration` and log a diagnostics summary.
pub async fn run(config: &Config, scope: &str, duration: Duration) -> Result<RunReport> {
  let mut fixtures = default_fixtures(scope);
  fixtures.extend(config.simulation.resources.clone());
  let gateway = Arc::new(SimulatedGateway::new(
    fixtures,
    config.simulation.latency,
    config.simulation.fail_every,
  ));

  let memory = MemorySink::new();
  let diagnostics: Arc<dyn DiagnosticsSink> = Arc::new(FanoutSink::new(vec![
    Arc::new(TracingSink),
    Arc::new(memory.clone()),
  ]));
  let orchestrator = LoadOrchestrator::new(TypedCache::new(), diagnostics);
  let poller = PollingSyncController::new(orchestrator.clone(), config.polling_config());
  let (lifecycle, source) = LifecycleSource::channel();
  let listener = poller.attach_lifecycle(source);

  let shared: Arc<dyn FetchGateway> = gateway.clone();
  let weights_key = CacheKey::new("weightHistory", scope);
  let weights = ViewLoadSession::new(
    orchestrator.clone(),
    weights_key.clone(),
    fetcher::<Vec<WeightRecord>>(Arc::clone(&shared), ResourceDescriptor::new(weights_path(scope))),
  )
  .with_options(config.load_options())
  .with_config(config.session_config())
  .with_polling(poller.clone());

  let profile = ViewLoadSession::new(
    orchestrator.clone(),
    CacheKey::new("profile", scope),
    fetcher::<PetProfile>(shared, ResourceDescriptor::new(profile_path(scope))),
  )
  .with_options(config.load_options().with_ttl(None))
  .with_config(config.session_config());

  let settle = config.simulation.latency * 2 + Duration::from_millis(50);
  let phase = duration / 4;

  tracing::info!(scope, "screens appear");
  weights.on_appear();
  profile.on_appear();
  tokio::time::sleep(settle).await;
  tracing::info!(
    records = weights.value().get().map(|w| w.len()),
    profile = ?profile.value().get().map(|p| p.name),
    error = ?weights.last_error().get(),
    "initial load done"
  );

  tracing::info!("user logs a weigh-in");
  let mut history = orchestrator.peek::<Vec<WeightRecord>>(&weights_key).unwrap_or_default();
  history.push(WeightRecord {
    recorded_at: Utc::now(),
    grams: 4090,
  });
  gateway.put(weights_path(scope), serde_json::json!(history));
  orchestrator.write_local(&weights_key, history, config.sync.default_ttl);
  poller.on_user_write();
  tracing::info!(
    interval_ms = millis(poller.current_interval()),
    "fast polling window open"
  );
  tokio::time::sleep(phase).await;

  tracing::info!("app backgrounded");
  let _ = lifecycle.send(LifecycleEvent::Backgrounded);
  tokio::time::sleep(phase).await;
  tracing::info!(polling = poller.is_running(), "app foregrounded");
  let _ = lifecycle.send(LifecycleEvent::Foregrounded);

  tracing::info!("weights screen re-opened");
  weights.on_disappear();
  weights.on_appear();
  tokio::time::sleep(phase).await;

  tracing::info!("screens disappear");
  weights.on_disappear();
  profile.on_disappear();
  drop(lifecycle);
  let _ = listener.await;

  let report = RunReport {
    requests: gateway.requests(),
    events: memory.events(),
  };
  tracing::info!(requests = report.requests, "simulated backend requests");
  for (event, count) in report.summary() {
    tracing::info!(event = %event, count, "diagnostics summary");
  }
  Ok(report)
}
