use serde::Serialize;
use std::fmt;

/// Identity of a cached artifact: a resource domain plus the entity it is scoped to.
///
/// `(weightHistory, pet-1)` and `(weightHistory, pet-2)` are distinct entries;
/// bulk invalidation works on either half of the pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
  domain: String,
  scope_id: String,
}

impl CacheKey {
  pub fn new(domain: impl Into<String>, scope_id: impl Into<String>) -> Self {
    Self {
      domain: domain.into(),
      scope_id: scope_id.into(),
    }
  }

  pub fn domain(&self) -> &str {
    &self.domain
  }

  pub fn scope_id(&self) -> &str {
    &self.scope_id
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.domain, self.scope_id)
  }
}
