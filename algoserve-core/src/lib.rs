//! Core types for the Algoserve algorithm execution server.
//!
//! This crate carries everything the executor and HTTP layers share:
//!
//! - wire envelopes and the response code catalog ([`envelope`]),
//! - algorithm descriptors and declarative registration ([`spec`], [`def`]),
//! - the `(name, version)` catalog with YAML metadata overrides
//!   ([`registry`], [`overrides`]),
//! - internal execution records and the error taxonomy ([`execution`]),
//! - the server lifecycle state machine ([`lifecycle`]),
//! - environment-driven service configuration ([`config`]).

pub mod config;
pub mod def;
pub mod envelope;
pub mod execution;
pub mod lifecycle;
pub mod overrides;
pub mod registry;
pub mod spec;

pub use config::{ConfigError, ExecutorSettings, ServiceConfig};
pub use def::{Algorithm, AlgorithmDef, AlgorithmPackage, HyperParams, NoParams};
pub use envelope::{codes, AlgorithmContext, AlgorithmRequest, AlgorithmResponse};
pub use execution::{
    effective_timeout, ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult, ResponseMeta,
};
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState};
pub use registry::{AlgorithmRegistry, RegistryError};
pub use spec::{
    AlgorithmInstance, AlgorithmSpec, AlgorithmType, Entrypoint, ExecutionConfig, ExecutionMode,
    InvokeError, IoModel, LoggingConfig, ModelHandle, RunError, SpecKey,
};
