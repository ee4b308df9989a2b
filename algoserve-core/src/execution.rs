//! Internal execution records.
//!
//! The HTTP layer turns an envelope into an [`ExecutionRequest`]; every
//! executor resolves it to exactly one [`ExecutionResult`] — success or a
//! typed [`ExecutionError`] — with timing and worker identity attached.
//! Errors are values here; nothing on the execution path throws across the
//! HTTP boundary.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::AlgorithmContext;
use crate::spec::AlgorithmSpec;

/// Submit payload handed to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub spec: Arc<AlgorithmSpec>,
    /// Pre-validated input object.
    pub payload: Value,
    pub hyperparams: Option<Value>,
    pub request_id: String,
    pub request_datetime: DateTime<Utc>,
    pub trace_id: Option<String>,
    pub context: Option<AlgorithmContext>,
    /// Per-request timeout; merged with the spec timeout via
    /// [`effective_timeout`].
    pub timeout_s: Option<f64>,
}

impl ExecutionRequest {
    /// Resolve the effective timeout for this request.
    ///
    /// Takes the minimum of the request and spec timeouts, skipping
    /// whichever are unset, then falls back to `default_s`. `None`
    /// throughout means "no deadline".
    pub fn effective_timeout(&self, default_s: Option<f64>) -> Option<f64> {
        effective_timeout(self.timeout_s, self.spec.execution.timeout_s, default_s)
    }
}

/// Null-eliding minimum of request, spec, and default timeouts.
pub fn effective_timeout(
    request_s: Option<f64>,
    spec_s: Option<f64>,
    default_s: Option<f64>,
) -> Option<f64> {
    match (request_s, spec_s) {
        (Some(r), Some(s)) => Some(r.min(s)),
        (Some(r), None) => Some(r),
        (None, Some(s)) => Some(s),
        (None, None) => default_s,
    }
}

/// The five-kind error taxonomy carried by failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Input failed schema coercion (dispatcher or worker side).
    Validation,
    /// The supervisor killed the worker at the deadline.
    Timeout,
    /// Admission refused the task (queue full or shutting down).
    Rejected,
    /// User code returned or raised an error; the worker keeps serving.
    Runtime,
    /// The worker died without producing a result.
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Runtime => "runtime",
            ErrorKind::System => "system",
        };
        write!(f, "{s}")
    }
}

/// A typed execution failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            traceback: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn runtime(err: crate::spec::RunError) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            message: err.message,
            details: None,
            traceback: err.traceback,
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Response metadata staged by user code during a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<AlgorithmContext>,
}

impl ResponseMeta {
    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.message.is_none() && self.context.is_none()
    }
}

/// The single terminal record for one admitted submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ExecutionError>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Pid of the worker that ran (or was reclaimed for) the task. The pid
    /// is only ever reported after the worker was released or terminated.
    pub worker_pid: Option<u32>,
    pub response_meta: Option<ResponseMeta>,
}

impl ExecutionResult {
    pub fn ok(data: Value, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            started_at,
            ended_at,
            worker_pid: None,
            response_meta: None,
        }
    }

    pub fn err(error: ExecutionError, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            started_at,
            ended_at,
            worker_pid: None,
            response_meta: None,
        }
    }

    /// A failure stamped with "now" on both ends, for pre-dispatch errors.
    pub fn failed_now(error: ExecutionError) -> Self {
        let now = Utc::now();
        Self::err(error, now, now)
    }

    pub fn with_worker_pid(mut self, pid: u32) -> Self {
        self.worker_pid = Some(pid);
        self
    }

    pub fn with_response_meta(mut self, meta: Option<ResponseMeta>) -> Self {
        self.response_meta = meta.filter(|m| !m.is_empty());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_timeout_takes_minimum() {
        assert_eq!(effective_timeout(Some(3.0), Some(5.0), None), Some(3.0));
        assert_eq!(effective_timeout(Some(9.0), Some(5.0), None), Some(5.0));
    }

    #[test]
    fn effective_timeout_null_falls_through() {
        assert_eq!(effective_timeout(None, Some(5.0), Some(60.0)), Some(5.0));
        assert_eq!(effective_timeout(Some(2.0), None, Some(60.0)), Some(2.0));
        assert_eq!(effective_timeout(None, None, Some(60.0)), Some(60.0));
        assert_eq!(effective_timeout(None, None, None), None);
    }

    #[test]
    fn error_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ErrorKind::Timeout).unwrap(), "\"timeout\"");
        assert_eq!(serde_json::to_string(&ErrorKind::System).unwrap(), "\"system\"");
    }

    #[test]
    fn result_success_invariant() {
        let now = Utc::now();
        let ok = ExecutionResult::ok(serde_json::json!({"doubled": 2}), now, now);
        assert!(ok.success && ok.data.is_some() && ok.error.is_none());

        let failed = ExecutionResult::failed_now(ExecutionError::rejected("queue full"));
        assert!(!failed.success && failed.data.is_none() && failed.error.is_some());
    }

    #[test]
    fn empty_response_meta_is_dropped() {
        let now = Utc::now();
        let result = ExecutionResult::ok(Value::Null, now, now)
            .with_response_meta(Some(ResponseMeta::default()));
        assert!(result.response_meta.is_none());
    }

    #[test]
    fn execution_error_round_trips() {
        let err = ExecutionError::system("worker exited")
            .with_details(serde_json::json!({"exitCode": 137}));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "system");
        assert_eq!(value["details"]["exitCode"], 137);
        let back: ExecutionError = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind, ErrorKind::System);
    }
}
