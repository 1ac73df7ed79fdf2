//! Pending-call registry: maps call ids to single-slot reply channels.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::CallId;

/// Pending call waiting for its raw response payload
type PendingCall = oneshot::Sender<String>;

#[derive(Default)]
struct RegistryState {
    last_id: CallId,
    pending: HashMap<CallId, PendingCall>,
    closed: bool,
}

/// In-flight calls of one connection.
///
/// Ids come from a counter owned by the registry and are never reused, so a
/// late reply to an abandoned call can never be mistaken for a newer call.
#[derive(Default)]
pub struct CallRegistry {
    state: Mutex<RegistryState>,
}

impl CallRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and its reply slot.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionClosed` once the registry has been closed.
    pub fn register(&self) -> Result<(CallId, oneshot::Receiver<String>)> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }

        state.last_id += 1;
        let id = state.last_id;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, tx);
        Ok((id, rx))
    }

    /// Hand a payload to the call waiting on `id`.
    ///
    /// Returns `false` if no such call is pending. Never blocks; a caller that
    /// already gave up is not an error.
    pub fn deliver(&self, id: CallId, payload: String) -> bool {
        let Some(tx) = self.lock().pending.remove(&id) else {
            return false;
        };
        if tx.send(payload).is_err() {
            tracing::trace!("Caller for call {id} is gone, dropping response");
        }
        true
    }

    /// Forget a call that timed out or failed to send. Idempotent.
    pub fn abandon(&self, id: CallId) {
        self.lock().pending.remove(&id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Fail every pending call and refuse new ones.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            tracing::debug!("Failed {dropped} pending call(s) on close");
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
