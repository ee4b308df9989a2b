//! Algorithm descriptors.
//!
//! An [`AlgorithmSpec`] is the immutable, declarative description of one
//! registered algorithm: its identity, metadata, I/O model handles,
//! execution hints, and entrypoint. Specs are produced from
//! [`AlgorithmDef`](crate::def::AlgorithmDef) descriptors at registration
//! time and consumed by the executor and HTTP layers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form categorization of an algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmType {
    Prediction,
    Prepare,
    Programme,
    General,
}

impl Default for AlgorithmType {
    fn default() -> Self {
        AlgorithmType::General
    }
}

impl fmt::Display for AlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlgorithmType::Prediction => "prediction",
            AlgorithmType::Prepare => "prepare",
            AlgorithmType::Programme => "programme",
            AlgorithmType::General => "general",
        };
        write!(f, "{s}")
    }
}

/// Where user code runs for this algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// In the server process, on the blocking thread pool. No hard timeout.
    #[serde(rename = "IN_PROCESS")]
    InProcess,
    /// On a supervised pool of worker processes (the default).
    #[serde(rename = "PROCESS_POOL")]
    ProcessPool,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::ProcessPool
    }
}

/// Execution hints attached to a spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    pub execution_mode: ExecutionMode,
    /// Retain one algorithm instance per worker process across tasks.
    /// With `max_workers > 1` each worker holds its own instance; a single
    /// global instance additionally requires `isolated_pool` and
    /// `max_workers = 1`.
    pub stateful: bool,
    /// Run on a dedicated pool keyed by `(name, version)` instead of the
    /// shared pool.
    pub isolated_pool: bool,
    pub max_workers: usize,
    /// Hard execution timeout in seconds; merged with the request timeout
    /// by taking the minimum of whichever are set.
    pub timeout_s: Option<f64>,
    /// Opaque GPU placement hint, carried but not interpreted.
    pub gpu: Option<String>,
    /// Kill the worker's whole process group on timeout, not just the
    /// worker itself.
    pub kill_tree: bool,
    /// Seconds between SIGTERM and SIGKILL when a worker is reclaimed.
    pub kill_grace_s: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            stateful: false,
            isolated_pool: false,
            max_workers: 1,
            timeout_s: None,
            gpu: None,
            kill_tree: false,
            kill_grace_s: 1.0,
        }
    }
}

/// Per-spec request/payload logging switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub log_input: bool,
    pub log_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_input: false,
            log_output: false,
        }
    }
}

// ── Model handles ───────────────────────────────────────────────────────────

/// Marker for types usable as algorithm input/output models.
///
/// Blanket-implemented for anything serde- and schemars-capable; the
/// executor moves instances across the worker process boundary as JSON.
pub trait IoModel: Serialize + DeserializeOwned + schemars::JsonSchema + Send + 'static {}

impl<T> IoModel for T where T: Serialize + DeserializeOwned + schemars::JsonSchema + Send + 'static {}

fn schema_of<T: IoModel>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| Value::Object(Default::default()))
}

fn validate_as<T: IoModel>(value: &Value) -> Result<(), String> {
    serde_json::from_value::<T>(value.clone())
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Type-erased handle to an I/O model: a JSON schema plus a validating
/// decode, which doubles as the cross-process codec smoke test.
#[derive(Clone)]
pub struct ModelHandle {
    name: &'static str,
    schema: fn() -> Value,
    validate: fn(&Value) -> Result<(), String>,
}

impl ModelHandle {
    pub fn of<T: IoModel>() -> Self {
        let full = std::any::type_name::<T>();
        Self {
            name: full.rsplit("::").next().unwrap_or(full),
            schema: schema_of::<T>,
            validate: validate_as::<T>,
        }
    }

    /// Short type name of the underlying model.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The model's JSON schema.
    pub fn schema(&self) -> Value {
        (self.schema)()
    }

    /// Check that `value` decodes as the model type.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        (self.validate)(value)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle").field("name", &self.name).finish()
    }
}

// ── Entrypoints ─────────────────────────────────────────────────────────────

/// Error returned by user algorithm code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl RunError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RunError {}

impl From<String> for RunError {
    fn from(message: String) -> Self {
        RunError::msg(message)
    }
}

impl From<&str> for RunError {
    fn from(message: &str) -> Self {
        RunError::msg(message)
    }
}

/// How an entrypoint invocation failed.
///
/// `Validation` covers payload coercion inside the worker; `Runtime` wraps
/// errors thrown by user code. Both leave the worker process alive.
#[derive(Debug, Clone)]
pub enum InvokeError {
    Validation(String),
    Runtime(RunError),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::Validation(msg) => write!(f, "input validation failed: {msg}"),
            InvokeError::Runtime(err) => write!(f, "algorithm failed: {err}"),
        }
    }
}

/// Object-safe instance of an algorithm, as driven by the worker loop.
///
/// `initialize`/`shutdown` are exercised only for stateful entrypoints;
/// function and stateless entrypoints skip them entirely.
pub trait AlgorithmInstance: Send {
    fn initialize(&mut self) -> Result<(), RunError> {
        Ok(())
    }

    fn run(&mut self, input: &Value, hyperparams: Option<&Value>) -> Result<Value, InvokeError>;

    fn shutdown(&mut self) {}
}

/// Creates a fresh [`AlgorithmInstance`].
pub type InstanceFactory = Arc<dyn Fn() -> Box<dyn AlgorithmInstance> + Send + Sync>;

/// The registered unit of user code, as a tagged variant.
#[derive(Clone)]
pub enum Entrypoint {
    /// A stateless function; invoked directly.
    Function(Arc<dyn Fn(&Value, Option<&Value>) -> Result<Value, InvokeError> + Send + Sync>),
    /// A class instantiated per task and discarded afterwards.
    Stateless(InstanceFactory),
    /// A class cached per worker process; `initialize` runs once per
    /// instance and `shutdown` when the worker drains.
    Stateful(InstanceFactory),
}

impl Entrypoint {
    pub fn is_class(&self) -> bool {
        !matches!(self, Entrypoint::Function(_))
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self, Entrypoint::Stateful(_))
    }
}

impl fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Entrypoint::Function(_) => "Function",
            Entrypoint::Stateless(_) => "Stateless",
            Entrypoint::Stateful(_) => "Stateful",
        };
        write!(f, "Entrypoint::{kind}")
    }
}

// ── The spec ────────────────────────────────────────────────────────────────

/// Immutable descriptor of a registered algorithm.
///
/// The primary key is `(name, version)`. Everything except the key fields
/// (and `category`/`algorithm_type`) may later be adjusted by metadata
/// overrides; the spec itself never mutates after the registry hands out
/// a reference.
#[derive(Clone)]
pub struct AlgorithmSpec {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub algorithm_type: AlgorithmType,
    /// Registration date, `YYYY-MM-DD`.
    pub created_time: String,
    pub author: String,
    pub category: String,
    pub application_scenarios: Option<String>,
    pub extra: BTreeMap<String, String>,
    pub input_model: ModelHandle,
    pub output_model: ModelHandle,
    pub hyperparams_model: Option<ModelHandle>,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
    pub entrypoint: Entrypoint,
    pub is_class: bool,
}

impl AlgorithmSpec {
    pub fn key(&self) -> SpecKey {
        SpecKey {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

impl fmt::Debug for AlgorithmSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmSpec")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("algorithm_type", &self.algorithm_type)
            .field("category", &self.category)
            .field("execution", &self.execution)
            .field("entrypoint", &self.entrypoint)
            .finish_non_exhaustive()
    }
}

/// `(name, version)` registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpecKey {
    pub name: String,
    pub version: String,
}

impl fmt::Display for SpecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}
