//! Demo algorithms for Algoserve.
//!
//! A small but representative catalog: a pure function, an in-process
//! variant, sleepers for timeout/rejection behavior, a stateful counter, a
//! response-metadata setter, a hyperparams consumer, and a deliberate
//! crasher. The end-to-end suite drives all of them through the compiled
//! server binary.

pub mod algorithms;

use algoserve::prelude::*;

/// The package the demo server registers; the worker process rebuilds the
/// same catalog from this same function.
pub fn package() -> AlgorithmPackage {
    AlgorithmPackage::new("demo")
        .export(
            AlgorithmDef::function("double", "v1", algorithms::double)
                .description("Doubles an integer")
                .author("demo")
                .category("arithmetic")
                .created("2026-01-01")
                .timeout_s(5.0),
        )
        .export(
            AlgorithmDef::function("double-inline", "v1", algorithms::double)
                .description("Doubles an integer in the server process")
                .author("demo")
                .category("arithmetic")
                .created("2026-01-01")
                .execution_mode(ExecutionMode::InProcess),
        )
        .export(
            AlgorithmDef::function_with_params("scale", "v1", algorithms::scale)
                .description("Multiplies by a hyperparameter factor")
                .author("demo")
                .category("arithmetic")
                .created("2026-01-01")
                .timeout_s(5.0),
        )
        .export(
            AlgorithmDef::stateless::<algorithms::Sleeper>("sleeper", "v1")
                .description("Sleeps, then doubles; short hard timeout")
                .author("demo")
                .category("latency")
                .created("2026-01-02")
                .isolated_pool(true)
                .max_workers(1)
                .timeout_s(0.5)
                .kill_grace_s(0.5),
        )
        .export(
            AlgorithmDef::stateless::<algorithms::Sleeper>("napper", "v1")
                .description("Sleeps, then doubles; generous timeout")
                .author("demo")
                .category("latency")
                .created("2026-01-02")
                .timeout_s(10.0),
        )
        .export(
            AlgorithmDef::function("quick", "v1", algorithms::double)
                .description("Doubles immediately on its own pool")
                .author("demo")
                .category("latency")
                .created("2026-01-02")
                .isolated_pool(true)
                .max_workers(1)
                .timeout_s(0.5),
        )
        .export(
            AlgorithmDef::stateful::<algorithms::Counter>("counter", "v1")
                .description("Accumulates across requests on one worker")
                .author("demo")
                .category("state")
                .created("2026-01-03")
                .isolated_pool(true)
                .max_workers(1)
                .timeout_s(1.0)
                .kill_grace_s(0.5),
        )
        .export(
            AlgorithmDef::stateless::<algorithms::Annotate>("annotate", "v1")
                .description("Stages response metadata, optionally failing")
                .author("demo")
                .category("meta")
                .created("2026-01-03")
                .timeout_s(5.0),
        )
        .export(
            AlgorithmDef::function("crasher", "v1", algorithms::crash)
                .description("Exits the worker process mid-task")
                .author("demo")
                .category("chaos")
                .created("2026-01-03")
                .isolated_pool(true)
                .max_workers(1)
                .timeout_s(5.0),
        )
}
