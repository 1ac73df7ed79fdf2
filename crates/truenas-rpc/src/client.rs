//! The client facade.
//!
//! A [`Client`] multiplexes any number of concurrent calls over one connection.
//! Calls are matched to responses by id, so responses may arrive in any order.
//! Cloning a client is cheap and every clone shares the same connection.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::config::{ClientConfig, Credentials, DEFAULT_CALL_TIMEOUT_SECS};
use crate::connection::Connection;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::jobs::{Job, JobCallback, JobId, JobTracker};
use crate::protocol::{CallId, RawResponse, Request, as_id};
use crate::registry::CallRegistry;
use crate::transport::Transport;

/// Timeout used by the helper calls when none is configured.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS);

/// Removes a call's registry entry however the call ends.
struct PendingCall<'a> {
    calls: &'a CallRegistry,
    id: CallId,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.calls.abandon(self.id);
    }
}

/// Handle to one server connection.
#[derive(Clone)]
pub struct Client {
    conn: Arc<Connection>,
    call_timeout: Duration,
}

impl Client {
    /// Dial the configured WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid configuration and `Error::Connect`
    /// if the endpoint cannot be reached.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let transport = Transport::connect_websocket(&config.url, config.verify_tls)
            .await
            .map_err(|source| Error::Connect {
                url: config.url.clone(),
                source,
            })?;

        Ok(Self::with_transport(transport, config.call_timeout))
    }

    /// Run over a byte stream using length-prefixed framing.
    pub fn connect_stream<T>(io: T, call_timeout: Duration) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_transport(Transport::framed(io), call_timeout)
    }

    /// Run over an already established transport.
    ///
    /// Spawns the dispatch loop, so this must be called within a tokio runtime.
    pub fn with_transport(transport: Transport, call_timeout: Duration) -> Self {
        let (sink, stream) = transport.into_parts();
        let conn = Arc::new(Connection::new(sink));

        tokio::spawn(dispatch::run(
            stream,
            Arc::downgrade(&conn),
            conn.shutdown_token(),
        ));

        Self { conn, call_timeout }
    }

    /// Timeout used by [`call_with_job`](Self::call_with_job), [`login`](Self::login),
    /// [`ping`](Self::ping) and [`subscribe_to_jobs`](Self::subscribe_to_jobs).
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Send a request and wait for its response.
    ///
    /// `Value::Null` params are sent as `[]`. The returned payload is the full
    /// response envelope, which may carry an `error` member; use
    /// [`RawResponse::into_result`] or [`request`](Self::request) to surface it.
    ///
    /// On timeout the request is not retracted: the server may still execute
    /// it, and its late response is discarded.
    ///
    /// # Errors
    ///
    /// - `Error::ConnectionClosed` if the connection is or becomes closed
    /// - `Error::Transport` if the request cannot be written
    /// - `Error::Timeout` if no response arrives within `timeout`
    pub async fn call(&self, method: &str, timeout: Duration, params: Value) -> Result<RawResponse> {
        let params = if params.is_null() { json!([]) } else { params };

        let (id, rx) = self.conn.calls.register()?;
        let _pending = PendingCall {
            calls: &self.conn.calls,
            id,
        };

        let text = serde_json::to_string(&Request::new(method, id, &params))?;
        trace!("-> {text}");

        let exchange = async {
            self.conn.send(text).await?;
            rx.await.map_err(|_| Error::ConnectionClosed)
        };

        let payload = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| {
                debug!("Call {id} ({method}) timed out after {timeout:?}");
                Error::Timeout(timeout)
            })??;

        trace!("<- {payload}");
        Ok(RawResponse::new(payload))
    }

    /// Call and decode the `result` member.
    ///
    /// # Errors
    ///
    /// Everything [`call`](Self::call) returns, plus `Error::Rpc` when the server
    /// answered with an error and `Error::Json` when the result does not decode.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        timeout: Duration,
        params: Value,
    ) -> Result<T> {
        let result = self.call(method, timeout, params).await?.into_result()?;
        Ok(serde_json::from_value(result)?)
    }

    /// Start a job and track it.
    ///
    /// Returns as soon as the server has assigned a job id; use [`Job::wait`] to
    /// wait for completion. Progress only arrives after
    /// [`subscribe_to_jobs`](Self::subscribe_to_jobs) has been called on this
    /// connection.
    ///
    /// # Errors
    ///
    /// Everything [`call`](Self::call) returns, `Error::Rpc` if the server
    /// refused, or `Error::UnexpectedJobFormat` if the result is not a job id.
    pub async fn call_with_job(
        &self,
        method: &str,
        params: Value,
        callback: Option<JobCallback>,
    ) -> Result<Job> {
        let result = self
            .call(method, self.call_timeout, params)
            .await?
            .into_result()?;
        let id = as_id(&result).ok_or(Error::UnexpectedJobFormat)?;

        debug!("{method} started job {id}");
        Ok(self.conn.jobs.register(id, method, callback))
    }

    /// Authenticate the connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::LoginRejected` unless the server answers `true`.
    pub async fn login(&self, credentials: &Credentials) -> Result<()> {
        let (method, params) = credentials.login_call();
        let accepted = self
            .call(method, self.call_timeout, params)
            .await?
            .into_result()?;

        if accepted == Value::Bool(true) {
            debug!("Logged in");
            Ok(())
        } else {
            Err(Error::LoginRejected)
        }
    }

    /// Liveness check; a healthy server answers `"pong"`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedResponse` if the result is not a string.
    pub async fn ping(&self) -> Result<String> {
        match self
            .call("core.ping", self.call_timeout, json!([]))
            .await?
            .into_result()?
        {
            Value::String(pong) => Ok(pong),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Ask the server to stream job updates on this connection.
    ///
    /// # Errors
    ///
    /// Everything [`call`](Self::call) returns, or `Error::Rpc` if refused.
    pub async fn subscribe_to_jobs(&self) -> Result<()> {
        self.call("core.subscribe", self.call_timeout, json!(["core.get_jobs"]))
            .await?
            .into_result()?;
        Ok(())
    }

    #[must_use]
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.conn.jobs.job(id)
    }

    /// Stop tracking a job. Later updates for it are ignored.
    pub fn remove_job(&self, id: JobId) -> Option<Job> {
        self.conn.jobs.remove_job(id)
    }

    #[must_use]
    pub fn jobs(&self) -> &JobTracker {
        &self.conn.jobs
    }

    /// Number of calls still waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.conn.calls.len()
    }

    /// Close the connection.
    ///
    /// Safe to call any number of times from any number of tasks. Pending calls
    /// and unfinished job waiters fail with `Error::ConnectionClosed`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the close frame could not be sent.
    pub async fn close(&self) -> Result<()> {
        self.conn.close().await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        self.conn.shutdown_token().cancelled_owned().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .field("pending_calls", &self.pending_calls())
            .field("jobs", &self.conn.jobs.len())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}
