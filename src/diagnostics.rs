//! Structured diagnostic events for an external telemetry collector.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::CacheKey;
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagnosticEvent {
  CacheHit { key: CacheKey },
  CacheMiss { key: CacheKey },
  RefreshStarted { key: CacheKey },
  RefreshSucceeded { key: CacheKey },
  RefreshFailed { key: CacheKey, error: ErrorKind },
  LoadTimeout { key: CacheKey, duration_ms: u64 },
  /// A screen's safety guard fired and forcibly cleared its loading state.
  SessionStalled { key: CacheKey, duration_ms: u64 },
}

impl DiagnosticEvent {
  pub fn key(&self) -> &CacheKey {
    match self {
      DiagnosticEvent::CacheHit { key }
      | DiagnosticEvent::CacheMiss { key }
      | DiagnosticEvent::RefreshStarted { key }
      | DiagnosticEvent::RefreshSucceeded { key }
      | DiagnosticEvent::RefreshFailed { key, .. }
      | DiagnosticEvent::LoadTimeout { key, .. }
      | DiagnosticEvent::SessionStalled { key, .. } => key,
    }
  }
}

/// Receiver of diagnostic events. Transmission and storage are up to the implementor.
pub trait DiagnosticsSink: Send + Sync {
  fn record(&self, event: DiagnosticEvent);
}

/// Sink that writes every event to the tracing log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
  fn record(&self, event: DiagnosticEvent) {
    match &event {
      DiagnosticEvent::RefreshFailed { key, error } => {
        tracing::warn!(key = %key, error = ?error, "diagnostic: refresh failed");
      }
      DiagnosticEvent::LoadTimeout { key, duration_ms }
      | DiagnosticEvent::SessionStalled { key, duration_ms } => {
        tracing::warn!(
          key = %key,
          duration_ms,
          event = ?event,
          "diagnostic: load exceeded deadline"
        );
      }
      _ => tracing::debug!(key = %event.key(), event = ?event, "diagnostic"),
    }
  }
}

/// Sink that keeps events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
  events: Arc<Mutex<Vec<DiagnosticEvent>>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<DiagnosticEvent> {
    self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn count(&self, pred: impl Fn(&DiagnosticEvent) -> bool) -> usize {
    self
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .filter(|e| pred(e))
      .count()
  }
}

impl DiagnosticsSink for MemorySink {
  fn record(&self, event: DiagnosticEvent) {
    self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
  }
}

/// Sink that forwards every event to each of several sinks.
#[derive(Default)]
pub struct FanoutSink {
  sinks: Vec<Arc<dyn DiagnosticsSink>>,
}

impl FanoutSink {
  pub fn new(sinks: Vec<Arc<dyn DiagnosticsSink>>) -> Self {
    Self { sinks }
  }
}

impl DiagnosticsSink for FanoutSink {
  fn record(&self, event: DiagnosticEvent) {
    if let Some((last, rest)) = self.sinks.split_last() {
      for sink in rest {
        sink.record(event.clone());
      }
      last.record(event);
    }
  }
}
