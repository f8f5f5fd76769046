//! Error types for fetching and loading.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheKey;

/// Errors reported by a [`FetchGateway`](crate::gateway::FetchGateway).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// The backend has no such resource (HTTP 404).
  #[error("resource not found")]
  NotFound,

  #[error("server error {code}: {message}")]
  Server { code: u16, message: String },

  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  /// The response could not be decoded into the expected type.
  #[error("failed to decode response: {0}")]
  Decode(String),
}

/// Errors surfaced by loads and sessions.
///
/// Cloneable because one fetch outcome is delivered to every caller attached
/// to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// The caller stopped waiting; the fetch keeps running in the background.
  #[error("loading {key} timed out after {}ms", after.as_millis())]
  Timeout { key: CacheKey, after: Duration },

  #[error("{key} no longer exists")]
  ResourceMissing { key: CacheKey },

  #[error("server error {code}: {message}")]
  Server { code: u16, message: String },

  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("failed to decode response: {0}")]
  Decode(String),

  /// The fetch task panicked or was aborted before producing a result.
  #[error("fetch for {key} did not complete: {reason}")]
  Internal { key: CacheKey, reason: String },
}

/// Payload-free classification of a [`SyncError`], bound to the UI as `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
  Timeout,
  ResourceMissing,
  Server { code: u16 },
  NetworkUnavailable,
  Decode,
  Internal,
}

impl SyncError {
  /// Convert a gateway error for a key. `NotFound` becomes `ResourceMissing`.
  pub fn from_fetch(key: &CacheKey, err: FetchError) -> Self {
    match err {
      FetchError::NotFound => SyncError::ResourceMissing { key: key.clone() },
      FetchError::Server { code, message } => SyncError::Server { code, message },
      FetchError::NetworkUnavailable(msg) => SyncError::NetworkUnavailable(msg),
      FetchError::Decode(msg) => SyncError::Decode(msg),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      SyncError::Timeout { .. } => ErrorKind::Timeout,
      SyncError::ResourceMissing { .. } => ErrorKind::ResourceMissing,
      SyncError::Server { code, .. } => ErrorKind::Server { code: *code },
      SyncError::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
      SyncError::Decode(_) => ErrorKind::Decode,
      SyncError::Internal { .. } => ErrorKind::Internal,
    }
  }

  /// Whether the last known cache value is still valid and a retry makes sense.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      SyncError::Timeout { .. }
        | SyncError::ResourceMissing { .. }
        | SyncError::NetworkUnavailable(_)
    )
  }

  /// Message suitable for showing to the user.
  pub fn user_message(&self) -> String {
    match self {
      SyncError::Timeout { .. } => "This is taking longer than usual. Pull to retry.".to_string(),
      SyncError::ResourceMissing { .. } => "This item was removed.".to_string(),
      SyncError::Server { code, .. } if *code >= 500 => {
        format!("The server had a problem ({}). Please try again later.", code)
      }
      SyncError::Server { code, message } => format!("Request failed ({}): {}", code, message),
      SyncError::NetworkUnavailable(_) => "You appear to be offline.".to_string(),
      SyncError::Decode(_) | SyncError::Internal { .. } => {
        "Something went wrong loading this data.".to_string()
      }
    }
  }
}
