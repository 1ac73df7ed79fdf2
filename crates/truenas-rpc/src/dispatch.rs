//! The dispatch loop: sole reader of a connection.
//!
//! Every inbound message is classified once and routed to the pending call it
//! answers, to the job tracker, or dropped.

use std::sync::Weak;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::jobs::JobTracker;
use crate::protocol::Inbound;
use crate::registry::CallRegistry;
use crate::transport::MessageStream;

/// Where an inbound message ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Handed to the call waiting for it.
    Delivered,
    /// A response nobody is waiting for (late, or never sent).
    Unmatched,
    /// Applied to an owned job.
    JobUpdated,
    /// Job update for a job this client does not own, or one already finished.
    JobIgnored,
    /// Some other notification.
    Notification,
    /// Not a JSON-RPC message.
    Malformed,
}

/// Classify one message and route it.
pub fn route(calls: &CallRegistry, jobs: &JobTracker, text: String) -> Routed {
    match Inbound::classify(text) {
        Ok(Inbound::Response { id, payload }) => {
            if calls.deliver(id, payload) {
                Routed::Delivered
            } else {
                trace!("No pending call for response {id}, dropping");
                Routed::Unmatched
            }
        }
        Ok(Inbound::JobUpdate(update)) => {
            if jobs.handle_update(update) {
                Routed::JobUpdated
            } else {
                Routed::JobIgnored
            }
        }
        Ok(Inbound::Notification { method }) => {
            debug!("Ignoring notification: {}", method.as_deref().unwrap_or("<none>"));
            Routed::Notification
        }
        Err(e) => {
            debug!("Dropping malformed message: {e}");
            Routed::Malformed
        }
    }
}

/// Read until the connection closes, the peer goes away, or a read fails.
///
/// Holds only a weak reference: dropping every client handle ends the loop.
pub(crate) async fn run(
    mut stream: MessageStream,
    conn: Weak<Connection>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        let Some(connection) = conn.upgrade() else {
            break;
        };

        match next {
            Some(Ok(text)) => {
                route(&connection.calls, &connection.jobs, text);
            }
            None => {
                debug!("Server closed the connection");
                if let Err(e) = connection.close().await {
                    debug!("Error while closing: {e}");
                }
                break;
            }
            Some(Err(e)) => {
                warn!("Read failed, closing connection: {e}");
                if let Err(e) = connection.close().await {
                    debug!("Error while closing: {e}");
                }
                break;
            }
        }
    }

    trace!("Dispatch loop stopped");
}
