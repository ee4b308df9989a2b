//! Route table and handlers.
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | POST | `/algorithms/{name}/{version}` | Execute an algorithm |
//! | GET  | `/algorithms` | Enumerate registered specs |
//! | GET  | `/algorithms/{name}/{version}/schema` | Input/output schemas |
//! | GET  | `/healthz` | Liveness — 200 while the process responds |
//! | GET  | `/readyz` | Readiness — 200 only in `ready`/`running` |
//! | GET  | `/metrics` | Prometheus text exposition |
//! | GET  | `/openapi.json`, docs path | API docs (env-gated UI) |
//!
//! Business outcomes ride in the body `code` with HTTP 200; transport-level
//! statuses are reserved for pre-dispatch failures (unknown schema path,
//! not-ready gate).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use algoserve_core::config::ServiceConfig;
use algoserve_core::lifecycle::{Lifecycle, LifecycleState};
use algoserve_core::registry::AlgorithmRegistry;
use algoserve_executor::executors::{DispatchingExecutor, Executor};

use crate::dispatcher::{self, spec_schema, spec_summary};
use crate::metrics;
use crate::openapi;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AlgorithmRegistry>,
    pub executor: Arc<DispatchingExecutor>,
    pub lifecycle: Lifecycle,
    pub config: Arc<ServiceConfig>,
}

/// Assemble the application router.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/algorithms", get(list_handler))
        .route("/algorithms/{name}/{version}", post(execute_handler))
        .route("/algorithms/{name}/{version}/schema", get(schema_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_route))
        .route("/openapi.json", get(openapi_handler));

    if state.config.swagger_enabled {
        let docs_path = state.config.swagger_path.clone();
        router = router.route(&docs_path, get(docs_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

async fn execute_handler(
    Path((name, version)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let lifecycle_state: LifecycleState = state.lifecycle.current();
    if !lifecycle_state.accepts_requests() {
        // Pre-dispatch failure: the server never reached (or already left)
        // its serving states.
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "server is not accepting requests",
                "state": lifecycle_state,
            })),
        )
            .into_response();
    }

    let response =
        dispatcher::dispatch(&state.registry, &state.executor, &name, &version, body).await;
    Json(response).into_response()
}

async fn list_handler(State(state): State<AppState>) -> Json<Value> {
    let specs: Vec<Value> = state.registry.list().iter().map(spec_summary).collect();
    Json(Value::Array(specs))
}

async fn schema_handler(
    Path((name, version)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.registry.get(&name, &version) {
        Ok(spec) => Json(spec_schema(&spec)).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Liveness: always 200 while the process can answer at all.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness with a per-check breakdown; 503 outside `ready`/`running`.
async fn readyz_handler(State(state): State<AppState>) -> impl IntoResponse {
    let lifecycle_state = state.lifecycle.current();
    let executor_started = state.executor.is_started();
    let ready = lifecycle_state.is_ready() && executor_started;

    let body = json!({
        "status": if ready { "UP" } else { "DOWN" },
        "state": lifecycle_state,
        "checks": [
            {
                "name": "lifecycle",
                "status": if lifecycle_state.is_ready() { "UP" } else { "DOWN" },
                "state": lifecycle_state,
            },
            {
                "name": "executor",
                "status": if executor_started { "UP" } else { "DOWN" },
            },
        ],
    });
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn metrics_route(State(state): State<AppState>) -> impl IntoResponse {
    metrics::update_pool_gauges(&state.executor.stats());
    metrics::metrics_handler().await
}

async fn openapi_handler(State(state): State<AppState>) -> Json<Value> {
    Json(openapi::build_document(&state.registry))
}

async fn docs_handler() -> Html<String> {
    Html(openapi::swagger_ui_html())
}

#[cfg(test)]
mod tests {
    use super::*;
    use algoserve_core::def::AlgorithmDef;
    use algoserve_core::spec::RunError;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde::{Deserialize, Serialize};
    use tower::ServiceExt;

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct In {
        value: i64,
    }

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct Out {
        doubled: i64,
    }

    fn test_state(lifecycle: Lifecycle) -> AppState {
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
                .created("2026-01-01")
                .execution_mode(algoserve_core::spec::ExecutionMode::InProcess),
            )
            .unwrap();
        AppState {
            registry: Arc::new(registry),
            executor: Arc::new(DispatchingExecutor::new(
                Default::default(),
                algoserve_executor::pool::WorkerCommand::new("/bin/true"),
            )),
            lifecycle,
            config: Arc::new(ServiceConfig::default()),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let app = router(test_state(Lifecycle::new()));
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reports_not_ready_before_startup() {
        let app = router(test_state(Lifecycle::new()));
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "DOWN");
        assert_eq!(body["checks"][0]["name"], "lifecycle");
    }

    #[tokio::test]
    async fn execute_is_gated_before_ready() {
        let app = router(test_state(Lifecycle::new()));
        let request = Request::post("/algorithms/double/v1")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "requestId": "r1",
                    "datetime": "2026-01-01T00:00:00Z",
                    "data": {"value": 21},
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn list_returns_registered_specs() {
        let app = router(test_state(Lifecycle::new()));
        let response = app
            .oneshot(Request::get("/algorithms").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["name"], "double");
        assert_eq!(body[0]["version"], "v1");
        assert_eq!(body[0]["author"], "tests");
    }

    #[tokio::test]
    async fn schema_endpoint_404s_for_unknown() {
        let app = router(test_state(Lifecycle::new()));
        let response = app
            .oneshot(
                Request::get("/algorithms/missing/v9/schema")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn docs_route_is_absent_unless_enabled() {
        let state = test_state(Lifecycle::new());
        let app = router(state);
        let response = app
            .oneshot(Request::get("/docs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn execute_runs_inline_algorithm_when_running() {
        let lifecycle = Lifecycle::new();
        let state = test_state(lifecycle.clone());
        state.executor.inline().start().await.unwrap();
        lifecycle
            .advance(LifecycleState::Provisioning)
            .await
            .unwrap();
        lifecycle.advance(LifecycleState::Ready).await.unwrap();

        let app = router(state);
        let request = Request::post("/algorithms/double/v1")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "requestId": "r1",
                    "datetime": "2026-01-01T00:00:00Z",
                    "data": {"value": 21},
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["doubled"], 42);
        assert_eq!(body["context"], Value::Null);
        assert_eq!(body["datetime"], "2026-01-01T00:00:00Z");
    }
}
