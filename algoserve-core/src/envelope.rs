//! Wire-level request/response envelopes.
//!
//! Every algorithm invocation travels in an [`AlgorithmRequest`] and comes
//! back in an [`AlgorithmResponse`]. The envelope is deliberately thin:
//! identifiers, a timestamp, an opaque caller context, and the
//! algorithm-specific payload. Business outcomes (including typed failures)
//! are carried in the body `code`, not in the HTTP status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response `code` catalog. `0` is success; everything else is a typed
/// business failure delivered with HTTP 200.
pub mod codes {
    pub const SUCCESS: i64 = 0;
    pub const BAD_ENVELOPE: i64 = 40000;
    pub const INPUT_VALIDATION: i64 = 40001;
    pub const NOT_FOUND: i64 = 40400;
    pub const REJECTED: i64 = 42900;
    pub const SYSTEM: i64 = 50000;
    pub const RUNTIME: i64 = 50001;
    pub const TIMEOUT: i64 = 50400;
}

/// Opaque caller identity and correlation data, passed through untouched.
///
/// Only user code consuming [`crate::execution::ExecutionRequest::context`]
/// interprets these fields; the server treats them as pass-through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlgorithmContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl AlgorithmContext {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none()
            && self.tenant_id.is_none()
            && self.user_id.is_none()
            && self.extra.is_empty()
    }
}

/// The request envelope.
///
/// Unknown top-level fields are rejected; the nested `data` payload is
/// validated separately against the algorithm's input model.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlgorithmRequest {
    #[garde(length(min = 1))]
    pub request_id: String,
    /// Caller-supplied request time, echoed back verbatim in the response.
    #[garde(skip)]
    pub datetime: DateTime<Utc>,
    /// Algorithm-specific input, validated against the spec's input model.
    #[garde(skip)]
    pub data: Value,
    /// Optional secondary input bag for algorithms that declare one.
    #[garde(skip)]
    #[serde(default)]
    pub hyper_params: Option<Value>,
    #[garde(skip)]
    #[serde(default)]
    pub context: Option<AlgorithmContext>,
}

/// The response envelope.
///
/// `datetime` echoes the request time (not server time), and `context` is
/// present only when user code explicitly staged one during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmResponse {
    pub code: i64,
    pub message: String,
    pub request_id: String,
    pub datetime: DateTime<Utc>,
    pub context: Option<AlgorithmContext>,
    pub data: Option<Value>,
}

impl AlgorithmResponse {
    /// A success envelope with the default message.
    pub fn success(request_id: &str, datetime: DateTime<Utc>, data: Option<Value>) -> Self {
        Self {
            code: codes::SUCCESS,
            message: "success".to_string(),
            request_id: request_id.to_string(),
            datetime,
            context: None,
            data,
        }
    }

    /// A failure envelope for the given business code.
    pub fn failure(
        code: i64,
        message: impl Into<String>,
        request_id: &str,
        datetime: DateTime<Utc>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: request_id.to_string(),
            datetime,
            context: None,
            data: None,
        }
    }
}
