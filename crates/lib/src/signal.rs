//! Context teardown notification.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared "this context is closing" flag.
///
/// Cloneable and `Send`, so a supervisor thread can abandon a wait that is blocking
/// the script thread. Once raised the flag never goes back down.
#[derive(Debug, Clone)]
pub struct ClosingSignal {
  tx: Arc<watch::Sender<bool>>,
}

impl ClosingSignal {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  /// Raise the flag, waking every blocked wait.
  pub fn close(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_closing(&self) -> bool {
    *self.tx.borrow()
  }

  pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for ClosingSignal {
  fn default() -> Self {
    Self::new()
  }
}
