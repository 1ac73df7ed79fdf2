//! JSON-RPC 2.0 envelopes and inbound message classification.
//!
//! Every inbound text frame is decoded exactly once, by [`Inbound::classify`],
//! into a response, a job-progress update, or some other notification.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::jobs::{JobId, JobState};

pub const JSONRPC_VERSION: &str = "2.0";

/// Notification method carrying job-collection updates.
pub const COLLECTION_UPDATE: &str = "collection_update";

/// Correlation id of a call, unique for the lifetime of one connection.
pub type CallId = u64;

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub id: CallId,
    pub params: &'a Value,
}

impl<'a> Request<'a> {
    #[must_use]
    pub fn new(method: &'a str, id: CallId, params: &'a Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            id,
            params,
        }
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    /// `Some(Value::Null)` for an explicit `"result": null`.
    #[serde(default, deserialize_with = "present")]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl Response {
    /// Split the envelope into its result or its error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Rpc` when the envelope carries an error object and
    /// `Error::UnexpectedResponse` when it carries neither result nor error.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        self.result.ok_or(Error::UnexpectedResponse)
    }
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Error object from a response envelope.
///
/// The middleware does not always send a numeric code, and puts the useful
/// text in `data.reason` rather than `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Human-readable message: `data.reason`, then `message`, then the raw object.
    #[must_use]
    pub fn display_message(&self) -> String {
        let reason = self
            .data
            .as_ref()
            .and_then(|data| data.get("reason"))
            .and_then(Value::as_str);

        match (reason, &self.message) {
            (Some(reason), _) => reason.to_string(),
            (None, Some(message)) => message.clone(),
            (None, None) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_message())
    }
}

impl std::error::Error for RpcError {}

/// Raw response payload handed back by [`Client::call`](crate::Client::call).
///
/// This is the complete response envelope exactly as the server sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse(String);

impl RawResponse {
    #[must_use]
    pub fn new(payload: String) -> Self {
        Self(payload)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Decode the payload as a response envelope.
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if the payload is not a response object.
    pub fn envelope(&self) -> Result<Response> {
        Ok(serde_json::from_str(&self.0)?)
    }

    /// Decode the payload and return its `result`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Rpc` when the server answered with an error.
    pub fn into_result(self) -> Result<Value> {
        self.envelope()?.into_result()
    }

    /// Decode the payload into any JSON value, for display.
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if the payload is not JSON.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.0)?)
    }
}

impl std::fmt::Display for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fields of one job-progress notification, with defaults already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub state: JobState,
    pub percent: f64,
    pub description: String,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl JobUpdate {
    fn from_params(params: &Value) -> Option<Self> {
        let job_id = as_id(params.get("id")?)?;
        let fields = params.get("fields");
        let field = |name: &str| fields.and_then(|f| f.get(name));
        let progress = field("progress");

        let state = field("state")
            .and_then(Value::as_str)
            .map_or_else(|| JobState::from("unknown"), JobState::from);
        let percent = progress
            .and_then(|p| p.get("percent"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let description = progress
            .and_then(|p| p.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let result = field("result").filter(|v| !v.is_null()).cloned();
        let error = field("error")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .map(ToString::to_string);

        Some(Self {
            job_id,
            state,
            percent,
            description,
            result,
            error,
        })
    }
}

/// Envelope fields used for classification; everything else stays in the raw text.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

/// A classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a call, carrying the untouched message text.
    Response { id: CallId, payload: String },

    /// Progress or completion of a server-side job.
    JobUpdate(JobUpdate),

    /// Any other server-initiated message.
    Notification { method: Option<String> },
}

impl Inbound {
    /// Decode and classify one inbound message.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object.
    pub fn classify(text: String) -> std::result::Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(&text)?;

        if envelope.method.as_deref() == Some(COLLECTION_UPDATE)
            && let Some(update) = envelope.params.as_ref().and_then(JobUpdate::from_params)
        {
            return Ok(Self::JobUpdate(update));
        }

        if let Some(id) = envelope.id.as_ref().and_then(as_id) {
            return Ok(Self::Response { id, payload: text });
        }

        Ok(Self::Notification {
            method: envelope.method,
        })
    }
}

/// Read a numeric id; integral floats are accepted since JSON has one number type.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Range and fraction checked
pub(crate) fn as_id(value: &Value) -> Option<u64> {
    if let Some(id) = value.as_u64() {
        return Some(id);
    }
    let float = value.as_f64()?;
    (float >= 0.0 && float.fract() == 0.0 && float <= u64::MAX as f64).then_some(float as u64)
}
