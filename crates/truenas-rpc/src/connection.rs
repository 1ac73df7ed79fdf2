//! Per-connection shared state.
//!
//! One [`Connection`] is shared by every [`Client`](crate::Client) clone and,
//! weakly, by the dispatch loop. It holds the write half of the transport, the
//! pending-call registry, the job tracker, and the terminal closed signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::jobs::JobTracker;
use crate::registry::CallRegistry;
use crate::transport::MessageSink;

/// Upper bound on each step of shutdown: taking the write half, then sending
/// the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct Connection {
    /// Write half; `None` once closed. The lock serializes concurrent sends.
    sink: Mutex<Option<MessageSink>>,
    pub(crate) calls: CallRegistry,
    pub(crate) jobs: JobTracker,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    pub(crate) fn new(sink: MessageSink) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            calls: CallRegistry::new(),
            jobs: JobTracker::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled exactly when the connection closes.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one message.
    ///
    /// Fails immediately once the connection is closed, and a write stalled by
    /// backpressure is abandoned as soon as the connection closes.
    pub(crate) async fn send(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let write = async {
            let mut sink = self.sink.lock().await;
            let Some(sink) = sink.as_mut() else {
                return Err(Error::ConnectionClosed);
            };
            sink.send(text).await?;
            Ok(())
        };

        tokio::select! {
            () = self.shutdown.cancelled() => Err(Error::ConnectionClosed),
            result = write => result,
        }
    }

    /// Shut the connection down. Only the first call does any work.
    ///
    /// Order: fire the closed signal, fail pending calls and job waiters, then
    /// send the close frame and drop the write half.
    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.calls.close();
        self.jobs.close();

        let sink = match tokio::time::timeout(CLOSE_TIMEOUT, self.sink.lock()).await {
            Ok(mut sink) => sink.take(),
            Err(_) => {
                tracing::warn!("Writer still busy after {CLOSE_TIMEOUT:?}, dropping it unclosed");
                return Ok(());
            }
        };
        let Some(mut sink) = sink else {
            return Ok(());
        };

        tracing::debug!("Closing connection");
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_disconnect() => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!("Timed out sending close frame after {CLOSE_TIMEOUT:?}");
                Ok(())
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            self.calls.close();
            self.jobs.close();
        }
    }
}
