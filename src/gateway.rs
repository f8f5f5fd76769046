//! Boundary to the networking layer.
//!
//! The transport (HTTP, auth, retries) lives outside this crate. It is handed
//! in as a [`FetchGateway`] that resolves a [`ResourceDescriptor`] to JSON or a
//! typed [`FetchError`]; [`fetcher`] turns that into a typed [`Fetcher`] the
//! orchestrator, poller and sessions can call repeatedly.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::FetchError;

/// Remote resource to fetch, e.g. `/pets/pet-1/weights`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
  pub path: String,
}

impl ResourceDescriptor {
  pub fn new(path: impl Into<String>) -> Self {
    Self { path: path.into() }
  }
}

impl fmt::Display for ResourceDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.path)
  }
}

/// Networking collaborator supplied by the host application.
pub trait FetchGateway: Send + Sync {
  fn fetch(
    &self,
    resource: &ResourceDescriptor,
  ) -> BoxFuture<'static, Result<serde_json::Value, FetchError>>;
}

/// A factory function that creates futures for fetching one resource.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

/// Build a typed fetcher for a resource served by `gateway`.
///
/// Responses that don't match `T` become [`FetchError::Decode`].
pub fn fetcher<T>(gateway: Arc<dyn FetchGateway>, resource: ResourceDescriptor) -> Fetcher<T>
where
  T: DeserializeOwned + Send + 'static,
{
  Arc::new(move || {
    let response = gateway.fetch(&resource);
    let resource = resource.clone();
    async move {
      let json = response.await?;
      serde_json::from_value(json).map_err(|e| FetchError::Decode(format!("{}: {}", resource, e)))
    }
    .boxed()
  })
}

/// Wrap a closure returning a future as a [`Fetcher`].
pub fn fetcher_fn<T, F, Fut>(f: F) -> Fetcher<T>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
  Arc::new(move || f().boxed())
}
