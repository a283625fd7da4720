//! Install-wide cancellation.

use std::sync::Arc;
use tokio::sync::watch;

/// A clonable flag that, once tripped, stays tripped.
///
/// Every clone observes the same signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trip the signal. Later calls are no-ops.
    pub fn cancel(&self) {
        self.tx.send_if_modified(|cancelled| !std::mem::replace(cancelled, true));
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has been tripped.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only errors if it is dropped.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
