//! Executor backends.
//!
//! Every backend exposes the same contract — `submit` resolving to exactly
//! one [`ExecutionResult`], plus `start`/`shutdown`/`is_started` — and the
//! [`DispatchingExecutor`] routes each request to the right one:
//!
//! | Backend | When |
//! |---|---|
//! | [`InlineExecutor`] | `executionMode = IN_PROCESS` (dev; advisory timeout) |
//! | [`SharedPoolExecutor`] | the default process pool shared by all algorithms |
//! | [`IsolatedPoolExecutor`] | specs with `isolatedPool = true` |
//!
//! The dispatcher itself never executes user code.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use algoserve_core::config::ExecutorSettings;
use algoserve_core::execution::{ExecutionError, ExecutionRequest, ExecutionResult};
use algoserve_core::spec::{AlgorithmInstance, ExecutionMode, SpecKey};
use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::context::TaskBindings;
use crate::pool::{PoolConfig, PoolStats, WorkerCommand, WorkerPool};
use crate::worker::invoke_inline;

/// Error type for executor lifecycle operations.
#[derive(Debug)]
pub enum ExecutorError {
    Start(String),
    Spawn(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::Start(msg) => write!(f, "executor start failed: {msg}"),
            ExecutorError::Spawn(msg) => write!(f, "worker spawn failed: {msg}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// The uniform submit contract shared by all backends.
pub trait Executor: Send + Sync {
    fn submit(&self, request: ExecutionRequest)
        -> impl Future<Output = ExecutionResult> + Send;

    fn start(&self) -> impl Future<Output = Result<(), ExecutorError>> + Send;

    fn shutdown(&self, wait: bool) -> impl Future<Output = ()> + Send;

    fn is_started(&self) -> bool;
}

// ── Inline ──────────────────────────────────────────────────────────────────

/// Runs user code on the blocking thread pool of the server process.
///
/// For development and `IN_PROCESS` specs only: there is no process to
/// kill, so the effective timeout is advisory — logged when exceeded,
/// never enforced.
pub struct InlineExecutor {
    started: AtomicBool,
    default_timeout_s: Option<f64>,
    /// Stateful instances for inline specs, keyed like a worker's cache.
    instances: Arc<Mutex<HashMap<SpecKey, Box<dyn AlgorithmInstance>>>>,
}

impl InlineExecutor {
    pub fn new(default_timeout_s: Option<f64>) -> Self {
        Self {
            started: AtomicBool::new(false),
            default_timeout_s,
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Executor for InlineExecutor {
    async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        if !self.is_started() {
            return ExecutionResult::failed_now(ExecutionError::rejected(
                "inline executor is not started",
            ));
        }
        let advisory_s = request.effective_timeout(self.default_timeout_s);
        let key = request.spec.key();
        let spec = request.spec.clone();
        let instances = self.instances.clone();
        let bindings = TaskBindings {
            request_id: Some(request.request_id.clone()),
            trace_id: request.trace_id.clone(),
            context: request.context.clone(),
            request_datetime: Some(request.request_datetime),
        };

        let started_at = Utc::now();
        let joined = tokio::task::spawn_blocking(move || {
            let key = spec.key();
            let mut cache = instances.lock().expect("inline instances lock poisoned");
            invoke_inline(
                &spec.entrypoint,
                &mut cache,
                &key,
                &request.payload,
                request.hyperparams.as_ref(),
                bindings,
            )
        })
        .await;
        let ended_at = Utc::now();

        if let Some(limit) = advisory_s {
            let elapsed = (ended_at - started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
            if elapsed > limit {
                warn!(
                    algorithm = %key,
                    elapsed_s = elapsed,
                    limit_s = limit,
                    "inline execution exceeded its advisory timeout"
                );
            }
        }

        let (outcome, meta) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                return ExecutionResult::err(
                    ExecutionError::system(format!("inline task panicked: {e}")),
                    started_at,
                    ended_at,
                );
            }
        };
        let result = match outcome {
            Ok(data) => ExecutionResult::ok(data, started_at, ended_at),
            Err(algoserve_core::spec::InvokeError::Validation(msg)) => {
                ExecutionResult::err(ExecutionError::validation(msg), started_at, ended_at)
            }
            Err(algoserve_core::spec::InvokeError::Runtime(err)) => {
                ExecutionResult::err(ExecutionError::runtime(err), started_at, ended_at)
            }
        };
        result.with_response_meta(meta)
    }

    async fn start(&self) -> Result<(), ExecutorError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, _wait: bool) {
        self.started.store(false, Ordering::SeqCst);
        let mut cache = self.instances.lock().expect("inline instances lock poisoned");
        for (_, mut instance) in cache.drain() {
            instance.shutdown();
        }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

// ── Shared pool ─────────────────────────────────────────────────────────────

/// One supervised pool shared by every `PROCESS_POOL` algorithm that does
/// not ask for isolation.
pub struct SharedPoolExecutor {
    pool: Arc<WorkerPool>,
}

impl SharedPoolExecutor {
    pub fn new(settings: &ExecutorSettings, command: WorkerCommand) -> Self {
        let mut config = PoolConfig::new("shared", settings.global_max_workers);
        config.queue_size = settings.global_queue_size;
        config.admit_timeout = Duration::from_secs_f64(settings.admit_timeout_s.max(0.0));
        config.default_timeout_s = settings.default_timeout_s;
        config.kill_grace = Duration::from_secs_f64(settings.kill_grace_s.max(0.0));
        config.kill_tree = settings.kill_tree;
        Self {
            pool: Arc::new(WorkerPool::new(config, command)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl Executor for SharedPoolExecutor {
    async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        self.pool.submit(request).await
    }

    async fn start(&self) -> Result<(), ExecutorError> {
        self.pool.start().await
    }

    async fn shutdown(&self, wait: bool) {
        self.pool.shutdown(wait).await;
    }

    fn is_started(&self) -> bool {
        self.pool.is_started()
    }
}

// ── Isolated pools ──────────────────────────────────────────────────────────

/// Lazily creates one supervised pool per `(name, version)` so a runaway
/// algorithm cannot starve its neighbors. Pools persist until shutdown.
pub struct IsolatedPoolExecutor {
    settings: ExecutorSettings,
    command: WorkerCommand,
    pools: DashMap<SpecKey, Arc<WorkerPool>>,
    started: AtomicBool,
}

impl IsolatedPoolExecutor {
    pub fn new(settings: ExecutorSettings, command: WorkerCommand) -> Self {
        Self {
            settings,
            command,
            pools: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    async fn pool_for(&self, request: &ExecutionRequest) -> Result<Arc<WorkerPool>, ExecutorError> {
        let key = request.spec.key();
        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool.clone());
        }
        let mut config = PoolConfig::new(key.to_string(), request.spec.execution.max_workers);
        config.queue_size = self.settings.global_queue_size;
        config.admit_timeout = Duration::from_secs_f64(self.settings.admit_timeout_s.max(0.0));
        config.default_timeout_s = self.settings.default_timeout_s;
        config.kill_grace =
            Duration::from_secs_f64(request.spec.execution.kill_grace_s.max(0.0));
        config.kill_tree = request.spec.execution.kill_tree || self.settings.kill_tree;
        let pool = Arc::new(WorkerPool::new(config, self.command.clone()));
        let pool = self
            .pools
            .entry(key.clone())
            .or_insert(pool)
            .clone();
        pool.start().await?;
        info!(pool = %key, "isolated pool ready");
        Ok(pool)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|entry| entry.value().stats()).collect()
    }
}

impl Executor for IsolatedPoolExecutor {
    async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        if !self.is_started() {
            return ExecutionResult::failed_now(ExecutionError::rejected(
                "isolated executor is not started",
            ));
        }
        match self.pool_for(&request).await {
            Ok(pool) => pool.submit(request).await,
            Err(e) => ExecutionResult::failed_now(ExecutionError::system(format!(
                "isolated pool unavailable: {e}"
            ))),
        }
    }

    async fn start(&self) -> Result<(), ExecutorError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self, wait: bool) {
        self.started.store(false, Ordering::SeqCst);
        let pools: Vec<Arc<WorkerPool>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        for pool in pools {
            pool.shutdown(wait).await;
        }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

// ── Dispatching ─────────────────────────────────────────────────────────────

/// Thin router over the three execution backends; never runs user code.
pub struct DispatchingExecutor {
    inline: InlineExecutor,
    shared: SharedPoolExecutor,
    isolated: IsolatedPoolExecutor,
}

impl DispatchingExecutor {
    pub fn new(settings: ExecutorSettings, command: WorkerCommand) -> Self {
        Self {
            inline: InlineExecutor::new(settings.default_timeout_s),
            shared: SharedPoolExecutor::new(&settings, command.clone()),
            isolated: IsolatedPoolExecutor::new(settings, command),
        }
    }

    /// Per-pool counters for the metrics endpoint.
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats = vec![self.shared.stats()];
        stats.extend(self.isolated.stats());
        stats
    }

    pub fn inline(&self) -> &InlineExecutor {
        &self.inline
    }

    pub fn shared(&self) -> &SharedPoolExecutor {
        &self.shared
    }

    pub fn isolated(&self) -> &IsolatedPoolExecutor {
        &self.isolated
    }
}

impl Executor for DispatchingExecutor {
    async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        let execution = &request.spec.execution;
        if execution.execution_mode == ExecutionMode::InProcess {
            self.inline.submit(request).await
        } else if execution.isolated_pool {
            self.isolated.submit(request).await
        } else {
            self.shared.submit(request).await
        }
    }

    async fn start(&self) -> Result<(), ExecutorError> {
        self.inline.start().await?;
        self.shared.start().await?;
        self.isolated.start().await?;
        Ok(())
    }

    async fn shutdown(&self, wait: bool) {
        self.isolated.shutdown(wait).await;
        self.shared.shutdown(wait).await;
        self.inline.shutdown(wait).await;
    }

    fn is_started(&self) -> bool {
        self.inline.is_started() && self.shared.is_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algoserve_core::def::AlgorithmDef;
    use algoserve_core::registry::AlgorithmRegistry;
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

    fn inline_request(value: i64) -> ExecutionRequest {
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
                .execution_mode(ExecutionMode::InProcess),
            )
            .unwrap();
        ExecutionRequest {
            spec: registry.get("double", "v1").unwrap(),
            payload: serde_json::json!({ "value": value }),
            hyperparams: None,
            request_id: "r1".to_string(),
            request_datetime: Utc::now(),
            trace_id: None,
            context: None,
            timeout_s: None,
        }
    }

    #[tokio::test]
    async fn inline_executes_and_reports_success() {
        let inline = InlineExecutor::new(None);
        inline.start().await.unwrap();
        let result = inline.submit(inline_request(21)).await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.data.unwrap()["doubled"], 42);
        assert!(result.response_meta.is_none());
    }

    #[tokio::test]
    async fn inline_rejects_before_start() {
        let inline = InlineExecutor::new(None);
        let result = inline.submit(inline_request(1)).await;
        assert_eq!(
            result.error.unwrap().kind,
            algoserve_core::execution::ErrorKind::Rejected
        );
    }

    #[tokio::test]
    async fn inline_captures_staged_response_meta() {
        let mut registry = AlgorithmRegistry::new();
        registry
            .register(
                AlgorithmDef::function("meta", "v1", |inp: In| {
                    crate::context::set_response_code(201);
                    crate::context::set_response_message("created");
                    Ok::<_, RunError>(Out {
                        doubled: inp.value,
                    })
                })
                .author("tests")
                .category("meta")
                .created("2026-01-01")
                .execution_mode(ExecutionMode::InProcess),
            )
            .unwrap();
        let request = ExecutionRequest {
            spec: registry.get("meta", "v1").unwrap(),
            payload: serde_json::json!({ "value": 1 }),
            hyperparams: None,
            request_id: "r1".to_string(),
            request_datetime: Utc::now(),
            trace_id: None,
            context: None,
            timeout_s: None,
        };

        let inline = InlineExecutor::new(None);
        inline.start().await.unwrap();
        let result = inline.submit(request).await;
        let meta = result.response_meta.unwrap();
        assert_eq!(meta.code, Some(201));
        assert_eq!(meta.message.as_deref(), Some("created"));
    }

    #[tokio::test]
    async fn inline_timeout_is_advisory_not_enforced() {
        let mut registry = AlgorithmRegistry::new();
        registry
            .register(
                AlgorithmDef::function("dawdle", "v1", |inp: In| {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    Ok::<_, RunError>(Out {
                        doubled: inp.value * 2,
                    })
                })
                .author("tests")
                .category("latency")
                .created("2026-01-01")
                .execution_mode(ExecutionMode::InProcess)
                .timeout_s(0.01),
            )
            .unwrap();
        let request = ExecutionRequest {
            spec: registry.get("dawdle", "v1").unwrap(),
            payload: serde_json::json!({ "value": 4 }),
            hyperparams: None,
            request_id: "r1".to_string(),
            request_datetime: Utc::now(),
            trace_id: None,
            context: None,
            timeout_s: None,
        };

        let inline = InlineExecutor::new(None);
        inline.start().await.unwrap();
        // The run blows well past the 10ms budget; inline only warns, so
        // the result still comes back successful.
        let result = inline.submit(request).await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.data.unwrap()["doubled"], 8);
        let elapsed = (result.ended_at - result.started_at)
            .to_std()
            .unwrap_or_default();
        assert!(elapsed >= std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn inline_maps_user_error_to_runtime() {
        let mut registry = AlgorithmRegistry::new();
        registry
            .register(
                AlgorithmDef::function("boom", "v1", |_inp: In| {
                    Err::<Out, _>(RunError::msg("deliberate"))
                })
                .author("tests")
                .category("errors")
                .created("2026-01-01")
                .execution_mode(ExecutionMode::InProcess),
            )
            .unwrap();
        let request = ExecutionRequest {
            spec: registry.get("boom", "v1").unwrap(),
            payload: serde_json::json!({ "value": 1 }),
            hyperparams: None,
            request_id: "r1".to_string(),
            request_datetime: Utc::now(),
            trace_id: None,
            context: None,
            timeout_s: None,
        };

        let inline = InlineExecutor::new(None);
        inline.start().await.unwrap();
        let result = inline.submit(request).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, algoserve_core::execution::ErrorKind::Runtime);
        assert_eq!(error.message, "deliberate");
    }
}
