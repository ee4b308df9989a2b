//! Parent ↔ worker wire protocol.
//!
//! Each worker process talks to the pool over its own stdin/stdout as
//! newline-delimited JSON: the parent writes [`ToWorker`] frames, the
//! worker answers with [`FromWorker`] frames, starting with a `ready`
//! handshake. JSON keeps the boundary language-neutral and debuggable;
//! payloads are already schema-validated JSON values at this point.

use algoserve_core::envelope::AlgorithmContext;
use algoserve_core::execution::{ExecutionError, ResponseMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One task, as shipped to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: u64,
    /// Entrypoint reference, resolved against the worker's registry.
    pub name: String,
    pub version: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperparams: Option<Value>,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<AlgorithmContext>,
    pub request_datetime: DateTime<Utc>,
    pub stateful: bool,
}

/// One finished task, as reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub task_id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_meta: Option<ResponseMeta>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub pid: u32,
}

/// Frames the pool writes to a worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToWorker {
    Task(TaskMessage),
    /// Drain sentinel: finish the current task, run stateful shutdowns,
    /// exit cleanly.
    Stop,
}

/// Frames a worker writes to its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FromWorker {
    /// Startup handshake; the pool marks the worker idle on receipt.
    Ready { pid: u32 },
    Result(ResultMessage),
}

/// Encode a frame as one protocol line (no trailing newline).
pub fn encode<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode one protocol line.
pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_frame_round_trips() {
        let frame = ToWorker::Task(TaskMessage {
            task_id: 7,
            name: "double".to_string(),
            version: "v1".to_string(),
            input: serde_json::json!({"value": 21}),
            hyperparams: None,
            request_id: "r1".to_string(),
            trace_id: Some("t1".to_string()),
            context: None,
            request_datetime: "2026-01-01T00:00:00Z".parse().unwrap(),
            stateful: false,
        });
        let line = encode(&frame).unwrap();
        assert!(line.contains("\"type\":\"task\""));
        let back: ToWorker = decode(&line).unwrap();
        let ToWorker::Task(task) = back else {
            panic!("expected task frame");
        };
        assert_eq!(task.task_id, 7);
        assert_eq!(task.input["value"], 21);
    }

    #[test]
    fn ready_and_stop_frames_are_compact() {
        let line = encode(&FromWorker::Ready { pid: 123 }).unwrap();
        assert_eq!(line, r#"{"type":"ready","pid":123}"#);
        let line = encode(&ToWorker::Stop).unwrap();
        assert_eq!(line, r#"{"type":"stop"}"#);
    }

    #[test]
    fn result_frame_carries_error_and_meta() {
        let now: DateTime<Utc> = Utc::now();
        let frame = FromWorker::Result(ResultMessage {
            task_id: 9,
            success: false,
            data: None,
            error: Some(ExecutionError::runtime(
                algoserve_core::spec::RunError::msg("boom"),
            )),
            response_meta: Some(ResponseMeta {
                code: Some(201),
                message: None,
                context: None,
            }),
            started_at: now,
            ended_at: now,
            pid: 42,
        });
        let back: FromWorker = decode(&encode(&frame).unwrap()).unwrap();
        let FromWorker::Result(result) = back else {
            panic!("expected result frame");
        };
        assert!(!result.success);
        assert_eq!(result.error.unwrap().message, "boom");
        assert_eq!(result.response_meta.unwrap().code, Some(201));
    }

    #[test]
    fn decode_tolerates_trailing_newline() {
        let mut line = encode(&ToWorker::Stop).unwrap();
        line.push('\n');
        assert!(matches!(decode::<ToWorker>(&line).unwrap(), ToWorker::Stop));
    }
}
