//! Network status plumbing

use std::sync::Arc;
use tokio::sync::watch;

/// Shared online/offline flag with change notifications
///
/// Whatever detects connectivity (platform hooks, a reachability prober, a
/// test harness) drives `set_online`; the sync manager subscribes and flushes
/// the mutation log on the offline-to-online edge.
#[derive(Debug, Clone)]
pub struct NetworkWatch {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkWatch {
    /// Create a watch with the given initial state
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Update connectivity; subscribers are only woken on actual changes
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Current connectivity
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to connectivity changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkWatch {
    /// Online until told otherwise
    fn default() -> Self {
        Self::new(true)
    }
}
