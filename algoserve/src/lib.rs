//! Algoserve — an algorithm execution server.
//!
//! A long-lived HTTP process hosting a registry of algorithm
//! implementations, executed on supervised pools of OS worker processes
//! with hard timeouts, per-request context propagation, and user-staged
//! response metadata.
//!
//! # Quick start
//!
//! ```ignore
//! use algoserve::prelude::*;
//!
//! #[derive(Serialize, Deserialize, JsonSchema)]
//! struct DoubleInput { value: i64 }
//!
//! #[derive(Serialize, Deserialize, JsonSchema)]
//! struct DoubleOutput { doubled: i64 }
//!
//! fn package() -> AlgorithmPackage {
//!     AlgorithmPackage::new("demo").export(
//!         AlgorithmDef::function("double", "v1", |inp: DoubleInput| {
//!             Ok(DoubleOutput { doubled: inp.value * 2 })
//!         })
//!         .author("demo")
//!         .category("arithmetic")
//!         .created("2026-01-01")
//!         .timeout_s(5.0),
//!     )
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     Ok(algoserve::Server::new().package(package).launch()?)
//! }
//! ```
//!
//! `launch()` also serves the worker side: pool workers are re-invocations
//! of the same binary, so the one `main` covers both roles.

pub extern crate algoserve_core;
pub extern crate algoserve_executor;
pub extern crate algoserve_http;

pub mod server;

pub use server::{ServeError, Server};

// Re-export the core surface at the top level for convenience.
pub use algoserve_core::*;

/// The per-task context store, as user code sees it inside `run`.
pub use algoserve_executor::context;

/// Commonly needed imports for algorithm authors.
pub mod prelude {
    pub use crate::context;
    pub use crate::server::{ServeError, Server};
    pub use algoserve_core::def::{Algorithm, AlgorithmDef, AlgorithmPackage, HyperParams, NoParams};
    pub use algoserve_core::envelope::{AlgorithmContext, AlgorithmRequest, AlgorithmResponse};
    pub use algoserve_core::spec::{
        AlgorithmType, ExecutionConfig, ExecutionMode, LoggingConfig, RunError,
    };
}
