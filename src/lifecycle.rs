use tokio::sync::mpsc;

/// Application lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// App came to the foreground
  Foregrounded,
  /// App went to the background; no network work should happen
  Backgrounded,
}

/// Stream of lifecycle events emitted by the host platform.
pub struct LifecycleSource {
  rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl LifecycleSource {
  /// Create a source and the sender the platform integration pushes events into.
  ///
  /// The source ends once every sender has been dropped.
  pub fn channel() -> (mpsc::UnboundedSender<LifecycleEvent>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<LifecycleEvent> {
    self.rx.recv().await
  }
}
