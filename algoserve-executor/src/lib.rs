//! Execution backends for Algoserve.
//!
//! The heart of the server: a supervised pool of OS worker processes with
//! hard deadline enforcement ([`pool`]), the worker-process loop and wire
//! protocol ([`worker`], [`protocol`]), the per-task context store user
//! code reads and writes during `run` ([`context`]), and the executor
//! backends routing requests to the right place ([`executors`]).

pub mod context;
pub mod executors;
pub mod pool;
pub mod protocol;
pub mod worker;

pub use executors::{
    DispatchingExecutor, Executor, ExecutorError, InlineExecutor, IsolatedPoolExecutor,
    SharedPoolExecutor,
};
pub use pool::{PoolConfig, PoolStats, WorkerCommand, WorkerPool};
pub use worker::{is_worker_process, run_worker, WORKER_ENV};
