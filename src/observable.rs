//! Observable value for binding state to the presentation layer.

use std::fmt;
use tokio::sync::watch;

/// A value plus change notification.
///
/// The owner writes with [`set`](Observable::set); any number of consumers
/// read the latest value or [`subscribe`](Observable::subscribe) and await
/// changes. Cloning shares the same underlying value.
#[derive(Clone)]
pub struct Observable<T> {
  tx: watch::Sender<T>,
}

impl<T: Clone> Observable<T> {
  pub fn new(initial: T) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx }
  }

  /// Current value.
  pub fn get(&self) -> T {
    self.tx.borrow().clone()
  }

  /// Replace the value and notify subscribers.
  pub fn set(&self, value: T) {
    self.tx.send_replace(value);
  }

  /// Replace the value, notifying subscribers only if it actually changed.
  pub fn set_if_changed(&self, value: T) -> bool
  where
    T: PartialEq,
  {
    self.tx.send_if_modified(|current| {
      if *current == value {
        return false;
      }
      *current = value;
      true
    })
  }

  pub fn subscribe(&self) -> watch::Receiver<T> {
    self.tx.subscribe()
  }
}

impl<T: Clone + Default> Default for Observable<T> {
  fn default() -> Self {
    Self::new(T::default())
  }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Observable").field(&*self.tx.borrow()).finish()
  }
}
