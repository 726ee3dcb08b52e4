//! Registry of live chat sessions.
//!
//! Every spawned session registers here with its peer address and a stop
//! handle. The registry is used for observability and to ask all sessions
//! to close when the server shuts down.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// A registered session.
#[derive(Debug)]
struct SessionEntry {
    peer: SocketAddr,
    /// Taken when the session is asked to stop.
    stop: Option<oneshot::Sender<()>>,
}

/// Slab-backed map of session id to session entry.
///
/// Provides O(1) register, lookup, and deregister operations.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<Slab<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sessions(&self) -> MutexGuard<'_, Slab<SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session for `peer`.
    ///
    /// Returns the session id and a receiver that resolves when the
    /// session is asked to stop.
    pub fn register(&self, peer: SocketAddr) -> (usize, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let id = self.sessions().insert(SessionEntry {
            peer,
            stop: Some(tx),
        });
        debug!(session = id, peer = %peer, "Session registered");
        (id, rx)
    }

    /// Remove a session. Returns `false` if it was not registered.
    pub fn deregister(&self, id: usize) -> bool {
        let removed = self.sessions().try_remove(id);
        if let Some(entry) = &removed {
            debug!(session = id, peer = %entry.peer, "Session deregistered");
        }
        removed.is_some()
    }

    /// Check if a session exists.
    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.sessions().contains(id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Ids and peer addresses of all registered sessions.
    pub fn peers(&self) -> Vec<(usize, SocketAddr)> {
        self.sessions()
            .iter()
            .map(|(id, entry)| (id, entry.peer))
            .collect()
    }

    /// Ask every registered session to stop.
    ///
    /// Sessions deregister themselves as they wind down. Returns the number
    /// of sessions that were signalled.
    pub fn stop_all(&self) -> usize {
        let mut sessions = self.sessions();
        let mut signalled = 0;

        for (id, entry) in sessions.iter_mut() {
            if let Some(stop) = entry.stop.take() {
                // A dropped receiver means the session already finished.
                if stop.send(()).is_ok() {
                    signalled += 1;
                } else {
                    debug!(session = id, "Session already gone");
                }
            }
        }

        signalled
    }
}
