//! Multiplexed JSON-RPC 2.0 client for the TrueNAS middleware.
//!
//! Many concurrent calls share one connection and are paired with their
//! responses by id. Long-running server operations ("jobs") report progress
//! through `collection_update` notifications, which are routed to the [`Job`]
//! handle returned by [`Client::call_with_job`].
//!
//! # Architecture
//!
//! - [`transport`]: WebSocket and length-prefixed message transports
//! - [`protocol`]: request and response envelopes, inbound classification
//! - [`registry`]: pending calls keyed by id
//! - [`jobs`]: job state machine and tracker
//! - [`dispatch`]: the single reader that routes inbound messages
//! - [`client`]: the public facade
//! - [`config`]: connection settings and credentials
//! - [`error`]: error type and `Result` alias
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use truenas_rpc::{Client, ClientConfig, Credentials, JobCallback, JobProgress};
//!
//! # async fn example() -> truenas_rpc::Result<()> {
//! let config = ClientConfig::new("wss://nas.local/websocket").with_verify_tls(false);
//! let client = Client::connect(&config).await?;
//! client.login(&Credentials::ApiKey("1-secret".to_string())).await?;
//!
//! println!("{}", client.ping().await?);
//!
//! client.subscribe_to_jobs().await?;
//! let progress: JobCallback = Arc::new(|p: &JobProgress| {
//!     println!("{:.0}% {}", p.percent, p.description);
//! });
//! let job = client
//!     .call_with_job("app.upgrade", json!(["myapp"]), Some(progress))
//!     .await?;
//! let result = job.wait().await?;
//! println!("{result}");
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
mod connection;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use client::{Client, DEFAULT_CALL_TIMEOUT};
pub use config::{ClientConfig, Credentials};
pub use error::{Error, Result};
pub use jobs::{Job, JobCallback, JobId, JobProgress, JobState, JobStatus, JobTracker};
pub use protocol::{CallId, RawResponse, RpcError};
pub use transport::{MessageSink, MessageStream, Transport, TransportError};
