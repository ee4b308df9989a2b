//! Envelope dispatcher.
//!
//! The single translation point between the wire envelope and the internal
//! execution records. Everything that can go wrong on a request maps to a
//! body `code` here; the HTTP status stays 200 for every business outcome.
//!
//! Per-request flow: parse and validate the envelope (`40000`), resolve the
//! spec (`40400`), validate the payload against the input model (`40001`),
//! submit, then map the result back — with any user-staged response
//! metadata overriding the defaults on both the success and failure paths.

use std::sync::Arc;

use algoserve_core::envelope::{codes, AlgorithmRequest, AlgorithmResponse};
use algoserve_core::execution::{ErrorKind, ExecutionRequest, ExecutionResult};
use algoserve_core::registry::AlgorithmRegistry;
use algoserve_core::spec::AlgorithmSpec;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde_json::Value;
use tracing::{info, warn};

use algoserve_executor::executors::{DispatchingExecutor, Executor};

use crate::metrics;

/// Default envelope `message` for each error kind; `code` mapping lives in
/// [`code_for_kind`].
fn message_for_kind(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "input validation failed",
        ErrorKind::Timeout => "execution timed out",
        ErrorKind::Rejected => "request rejected",
        ErrorKind::Runtime => "algorithm execution failed",
        ErrorKind::System => "internal execution error",
    }
}

fn code_for_kind(kind: ErrorKind) -> i64 {
    match kind {
        ErrorKind::Validation => codes::INPUT_VALIDATION,
        ErrorKind::Timeout => codes::TIMEOUT,
        ErrorKind::Rejected => codes::REJECTED,
        ErrorKind::Runtime => codes::RUNTIME,
        ErrorKind::System => codes::SYSTEM,
    }
}

/// Best-effort echo of `requestId`/`datetime` from an unparsable body so
/// even `40000` envelopes correlate.
fn echo_fields(body: &Value) -> (String, DateTime<Utc>) {
    let request_id = body
        .get("requestId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let datetime = body
        .get("datetime")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Utc::now);
    (request_id, datetime)
}

/// Execute one envelope against a resolved `(name, version)`.
pub async fn dispatch(
    registry: &AlgorithmRegistry,
    executor: &DispatchingExecutor,
    name: &str,
    version: &str,
    body: Value,
) -> AlgorithmResponse {
    // 1. Envelope shape; unknown top-level fields reject here.
    let request: AlgorithmRequest = match serde_json::from_value(body.clone()) {
        Ok(request) => request,
        Err(e) => {
            let (request_id, datetime) = echo_fields(&body);
            metrics::record_outcome(name, version, codes::BAD_ENVELOPE);
            return AlgorithmResponse::failure(
                codes::BAD_ENVELOPE,
                format!("invalid request envelope: {e}"),
                &request_id,
                datetime,
            );
        }
    };
    if let Err(report) = request.validate() {
        metrics::record_outcome(name, version, codes::BAD_ENVELOPE);
        return AlgorithmResponse::failure(
            codes::BAD_ENVELOPE,
            format!("invalid request envelope: {report}"),
            &request.request_id,
            request.datetime,
        );
    }

    // 2. Spec resolution.
    let spec = match registry.get(name, version) {
        Ok(spec) => spec,
        Err(e) => {
            metrics::record_outcome(name, version, codes::NOT_FOUND);
            return AlgorithmResponse::failure(
                codes::NOT_FOUND,
                e.to_string(),
                &request.request_id,
                request.datetime,
            );
        }
    };

    // 3. Payload against the input model; hyperparams against theirs.
    if let Err(message) = validate_payload(&spec, &request) {
        metrics::record_outcome(name, version, codes::INPUT_VALIDATION);
        return AlgorithmResponse::failure(
            codes::INPUT_VALIDATION,
            message,
            &request.request_id,
            request.datetime,
        );
    }

    if spec.logging.enabled {
        if spec.logging.log_input {
            info!(
                algorithm = %spec.key(),
                request_id = %request.request_id,
                input = %request.data,
                "executing algorithm"
            );
        } else {
            info!(
                algorithm = %spec.key(),
                request_id = %request.request_id,
                "executing algorithm"
            );
        }
    }

    // 4–5. Build the execution request (deadline fixed before dispatch) and
    // submit.
    let execution_request = ExecutionRequest {
        spec: spec.clone(),
        payload: request.data,
        hyperparams: request.hyper_params,
        request_id: request.request_id.clone(),
        request_datetime: request.datetime,
        trace_id: request
            .context
            .as_ref()
            .and_then(|ctx| ctx.trace_id.clone()),
        context: request.context,
        timeout_s: None,
    };
    let timer = metrics::execution_timer(name, version);
    let result = executor.submit(execution_request).await;
    drop(timer);

    // 6. Result → envelope.
    let response = map_result(&spec, &request.request_id, request.datetime, result);
    metrics::record_outcome(name, version, response.code);
    if spec.logging.enabled && spec.logging.log_output {
        info!(
            algorithm = %spec.key(),
            request_id = %response.request_id,
            code = response.code,
            output = %response.data.as_ref().unwrap_or(&serde_json::Value::Null),
            "algorithm finished"
        );
    }
    response
}

fn validate_payload(spec: &AlgorithmSpec, request: &AlgorithmRequest) -> Result<(), String> {
    spec.input_model
        .validate(&request.data)
        .map_err(|e| format!("data does not match the input model: {e}"))?;
    match (&spec.hyperparams_model, &request.hyper_params) {
        (Some(model), Some(params)) => model
            .validate(params)
            .map_err(|e| format!("hyperParams do not match the declared model: {e}")),
        (None, Some(_)) => Err(format!(
            "algorithm {} does not accept hyperParams",
            spec.key()
        )),
        _ => Ok(()),
    }
}

/// Map an execution result into the response envelope, honoring staged
/// response metadata on both paths.
fn map_result(
    spec: &AlgorithmSpec,
    request_id: &str,
    datetime: DateTime<Utc>,
    result: ExecutionResult,
) -> AlgorithmResponse {
    let meta = result.response_meta.unwrap_or_default();
    if result.success {
        AlgorithmResponse {
            code: meta.code.unwrap_or(codes::SUCCESS),
            message: meta.message.unwrap_or_else(|| "success".to_string()),
            request_id: request_id.to_string(),
            datetime,
            context: meta.context,
            data: result.data,
        }
    } else {
        let error = result.error.unwrap_or_else(|| {
            algoserve_core::execution::ExecutionError::system("missing error on failed result")
        });
        warn!(
            algorithm = %spec.key(),
            request_id,
            kind = %error.kind,
            error = %error.message,
            worker_pid = result.worker_pid,
            "algorithm request failed"
        );
        AlgorithmResponse {
            code: meta.code.unwrap_or_else(|| code_for_kind(error.kind)),
            message: meta
                .message
                .unwrap_or_else(|| format!("{}: {}", message_for_kind(error.kind), error.message)),
            request_id: request_id.to_string(),
            datetime,
            context: meta.context,
            data: None,
        }
    }
}

/// Summary row for `GET /algorithms`.
pub fn spec_summary(spec: &Arc<AlgorithmSpec>) -> Value {
    serde_json::json!({
        "name": spec.name,
        "version": spec.version,
        "description": spec.description,
        "algorithmType": spec.algorithm_type,
        "createdTime": spec.created_time,
        "author": spec.author,
        "category": spec.category,
        "applicationScenarios": spec.application_scenarios,
        "extra": spec.extra,
    })
}

/// Schema document for `GET /algorithms/{name}/{version}/schema`.
pub fn spec_schema(spec: &Arc<AlgorithmSpec>) -> Value {
    let mut doc = serde_json::json!({
        "input": spec.input_model.schema(),
        "output": spec.output_model.schema(),
        "execution": spec.execution,
        "algorithmType": spec.algorithm_type,
        "createdTime": spec.created_time,
        "author": spec.author,
        "category": spec.category,
        "applicationScenarios": spec.application_scenarios,
        "extra": spec.extra,
    });
    if let Some(model) = &spec.hyperparams_model {
        doc["hyperparams"] = model.schema();
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use algoserve_core::def::AlgorithmDef;
    use algoserve_core::envelope::AlgorithmContext;
    use algoserve_core::execution::{ExecutionError, ResponseMeta};
    use algoserve_core::spec::RunError;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct In {
        value: i64,
    }

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct Out {
        doubled: i64,
    }

    fn sample_spec() -> Arc<AlgorithmSpec> {
        let mut registry = AlgorithmRegistry::new();
        registry
            .register(
                AlgorithmDef::function("double", "v1", |inp: In| {
                    Ok::<_, RunError>(Out {
                        doubled: inp.value * 2,
                    })
                })
                .author("tests")
                .category("arithmetic")
                .created("2026-01-01"),
            )
            .unwrap();
        registry.get("double", "v1").unwrap()
    }

    fn dt() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn success_maps_to_code_zero() {
        let spec = sample_spec();
        let result = ExecutionResult::ok(serde_json::json!({"doubled": 42}), dt(), dt());
        let response = map_result(&spec, "r1", dt(), result);
        assert_eq!(response.code, 0);
        assert_eq!(response.message, "success");
        assert!(response.context.is_none());
        assert_eq!(response.data.unwrap()["doubled"], 42);
    }

    #[test]
    fn error_kinds_map_to_catalog_codes() {
        let spec = sample_spec();
        let cases = [
            (ExecutionError::validation("bad"), codes::INPUT_VALIDATION),
            (ExecutionError::timeout("late"), codes::TIMEOUT),
            (ExecutionError::rejected("full"), codes::REJECTED),
            (
                ExecutionError::runtime(RunError::msg("boom")),
                codes::RUNTIME,
            ),
            (ExecutionError::system("dead"), codes::SYSTEM),
        ];
        for (error, expected) in cases {
            let result = ExecutionResult::err(error, dt(), dt());
            let response = map_result(&spec, "r1", dt(), result);
            assert_eq!(response.code, expected);
            assert!(response.data.is_none());
        }
    }

    #[test]
    fn staged_meta_overrides_success_defaults() {
        let spec = sample_spec();
        let mut context = AlgorithmContext::default();
        context.trace_id = Some("rt".to_string());
        let result = ExecutionResult::ok(serde_json::json!({"doubled": 2}), dt(), dt())
            .with_response_meta(Some(ResponseMeta {
                code: Some(201),
                message: Some("created".to_string()),
                context: Some(context),
            }));
        let response = map_result(&spec, "r1", dt(), result);
        assert_eq!(response.code, 201);
        assert_eq!(response.message, "created");
        assert_eq!(response.context.unwrap().trace_id.as_deref(), Some("rt"));
        assert!(response.data.is_some());
    }

    #[test]
    fn staged_meta_overrides_failure_defaults() {
        let spec = sample_spec();
        let result = ExecutionResult::err(
            ExecutionError::runtime(RunError::msg("boom")),
            dt(),
            dt(),
        )
        .with_response_meta(Some(ResponseMeta {
            code: Some(201),
            message: Some("created".to_string()),
            context: None,
        }));
        let response = map_result(&spec, "r1", dt(), result);
        assert_eq!(response.code, 201);
        assert_eq!(response.message, "created");
        assert!(response.data.is_none());
    }

    #[tokio::test]
    async fn unknown_envelope_field_is_40000() {
        let registry = AlgorithmRegistry::new();
        let executor = DispatchingExecutor::new(
            Default::default(),
            algoserve_executor::pool::WorkerCommand::new("/bin/true"),
        );
        let body = serde_json::json!({
            "requestId": "r1",
            "datetime": "2026-01-01T00:00:00Z",
            "data": {},
            "unexpected": 1,
        });
        let response = dispatch(&registry, &executor, "double", "v1", body).await;
        assert_eq!(response.code, codes::BAD_ENVELOPE);
        assert_eq!(response.request_id, "r1");
    }

    #[tokio::test]
    async fn missing_algorithm_is_40400() {
        let registry = AlgorithmRegistry::new();
        let executor = DispatchingExecutor::new(
            Default::default(),
            algoserve_executor::pool::WorkerCommand::new("/bin/true"),
        );
        let body = serde_json::json!({
            "requestId": "r1",
            "datetime": "2026-01-01T00:00:00Z",
            "data": {"value": 1},
        });
        let response = dispatch(&registry, &executor, "nope", "v1", body).await;
        assert_eq!(response.code, codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_payload_is_40001() {
        let mut registry = AlgorithmRegistry::new();
        registry
            .register(
                AlgorithmDef::function("double", "v1", |inp: In| {
                    Ok::<_, RunError>(Out {
                        doubled: inp.value * 2,
                    })
                })
                .author("tests")
                .category("arithmetic")
                .created("2026-01-01"),
            )
            .unwrap();
        let executor = DispatchingExecutor::new(
            Default::default(),
            algoserve_executor::pool::WorkerCommand::new("/bin/true"),
        );
        let body = serde_json::json!({
            "requestId": "r1",
            "datetime": "2026-01-01T00:00:00Z",
            "data": {"value": "twenty-one"},
        });
        let response = dispatch(&registry, &executor, "double", "v1", body).await;
        assert_eq!(response.code, codes::INPUT_VALIDATION);
    }

    #[tokio::test]
    async fn undeclared_hyperparams_are_40001() {
        let mut registry = AlgorithmRegistry::new();
        registry
            .register(
                AlgorithmDef::function("double", "v1", |inp: In| {
                    Ok::<_, RunError>(Out {
                        doubled: inp.value * 2,
                    })
                })
                .author("tests")
                .category("arithmetic")
                .created("2026-01-01"),
            )
            .unwrap();
        let executor = DispatchingExecutor::new(
            Default::default(),
            algoserve_executor::pool::WorkerCommand::new("/bin/true"),
        );
        let body = serde_json::json!({
            "requestId": "r1",
            "datetime": "2026-01-01T00:00:00Z",
            "data": {"value": 1},
            "hyperParams": {"factor": 3},
        });
        let response = dispatch(&registry, &executor, "double", "v1", body).await;
        assert_eq!(response.code, codes::INPUT_VALIDATION);
        assert!(response.message.contains("hyperParams"));
    }

    #[test]
    fn schema_document_includes_models() {
        let spec = sample_spec();
        let doc = spec_schema(&spec);
        assert!(doc["input"]["properties"]["value"].is_object());
        assert!(doc["output"]["properties"]["doubled"].is_object());
        assert!(doc.get("hyperparams").is_none());
        assert_eq!(doc["execution"]["maxWorkers"], 1);
    }
}
