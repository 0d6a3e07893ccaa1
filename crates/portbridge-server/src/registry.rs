//! Session registry: live links keyed by session id.
//!
//! One registry per listener. A session appears here only after its
//! outbound connection is established and leaves on teardown, so the
//! reported count never includes pending connect attempts. Accept and I/O
//! completions run on different tokio workers, hence the mutex.

use portbridge_core::SessionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

/// Bookkeeping for one registered link.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Inbound peer address.
    pub peer: SocketAddr,
    /// Outbound backend address.
    pub target: SocketAddr,
    /// Drain signal; the relay half-closes its outbound side on receipt.
    pub drain_tx: mpsc::Sender<()>,
}

/// Live sessions for a single listener.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    /// Signalled whenever a removal leaves the registry empty.
    emptied: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            emptied: Notify::new(),
        }
    }

    /// Register an established link.
    pub async fn add(&self, id: SessionId, handle: SessionHandle) {
        self.sessions.lock().await.insert(id, handle);
    }

    /// Deregister a link, returning its handle if it was present.
    pub async fn remove(&self, id: &SessionId) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(id);
        if removed.is_some() {
            debug!(session = %id, "session deregistered");
            if sessions.is_empty() {
                self.emptied.notify_waiters();
            }
        }
        removed
    }

    /// Wait until every registered link has been removed. Returns
    /// immediately when the registry is already empty. No deadline.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            // Register the waiter before the emptiness check so a removal
            // in between cannot be missed.
            notified.as_mut().enable();
            if self.sessions.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Visit every registered link. Used by the drain pass.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SessionId, &SessionHandle),
    {
        for (id, handle) in self.sessions.lock().await.iter() {
            f(id, handle);
        }
    }

    /// Number of registered links.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
