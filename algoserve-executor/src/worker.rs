//! The worker-process loop.
//!
//! A worker is the server's own executable re-invoked with
//! [`WORKER_ENV`] set. It rebuilds the same algorithm registry as the
//! parent (so entrypoint references resolve identically), announces itself
//! with a `ready` frame, then serves tasks from stdin one at a time until
//! it receives a stop sentinel or its pipe closes.
//!
//! User code runs on this process's main thread with the task context
//! installed; anything it stages through the context store travels back in
//! the result frame. Uncaught user errors become `runtime` results — the
//! loop never exits on user failure. Only the supervisor kills workers.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use algoserve_core::execution::{ExecutionError, ResponseMeta};
use algoserve_core::registry::AlgorithmRegistry;
use algoserve_core::spec::{AlgorithmInstance, Entrypoint, InvokeError, SpecKey};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::context::{self, TaskBindings};
use crate::protocol::{self, FromWorker, ResultMessage, TaskMessage, ToWorker};

/// Set in a worker's environment by the pool; the facade entry checks this
/// before starting the HTTP server.
pub const WORKER_ENV: &str = "ALGOSERVE_WORKER";

/// Whether this process was launched as a pool worker.
pub fn is_worker_process() -> bool {
    std::env::var(WORKER_ENV).is_ok_and(|v| !v.is_empty())
}

/// Serve tasks until stdin closes or a stop sentinel arrives.
///
/// Returns the process exit code. Errors writing to stdout are fatal to the
/// worker (the parent is gone); everything else is reported in-band.
pub fn run_worker(registry: &AlgorithmRegistry) -> i32 {
    let pid = std::process::id();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    if write_frame(&mut stdout, &FromWorker::Ready { pid }).is_err() {
        return 1;
    }
    debug!(pid, "worker ready");

    // One instance per stateful entrypoint for the life of this process.
    let mut instances: HashMap<SpecKey, Box<dyn AlgorithmInstance>> = HashMap::new();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(pid, error = %e, "worker stdin read failed, exiting");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame = match protocol::decode::<ToWorker>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(pid, error = %e, "undecodable frame on worker stdin, ignoring");
                continue;
            }
        };
        match frame {
            ToWorker::Stop => {
                debug!(pid, "worker received stop sentinel");
                break;
            }
            ToWorker::Task(task) => {
                let result = execute_task(registry, &mut instances, task, pid);
                if write_frame(&mut stdout, &FromWorker::Result(result)).is_err() {
                    error!(pid, "worker cannot write results, exiting");
                    return 1;
                }
            }
        }
    }

    for (key, mut instance) in instances {
        debug!(pid, algorithm = %key, "shutting down stateful instance");
        instance.shutdown();
    }
    0
}

fn write_frame(out: &mut impl Write, frame: &FromWorker) -> std::io::Result<()> {
    let line = protocol::encode(frame).map_err(std::io::Error::other)?;
    writeln!(out, "{line}")?;
    out.flush()
}

/// Run one task with the context store installed, capturing staged
/// response metadata on every exit path.
fn execute_task(
    registry: &AlgorithmRegistry,
    instances: &mut HashMap<SpecKey, Box<dyn AlgorithmInstance>>,
    task: TaskMessage,
    pid: u32,
) -> ResultMessage {
    let started_at = Utc::now();
    let task_id = task.task_id;

    let spec = match registry.get(&task.name, &task.version) {
        Ok(spec) => spec,
        Err(e) => {
            // The parent resolved this spec before dispatch; a miss here
            // means the worker registry diverges from the parent's.
            return ResultMessage {
                task_id,
                success: false,
                data: None,
                error: Some(ExecutionError::system(format!(
                    "worker registry out of sync: {e}"
                ))),
                response_meta: None,
                started_at,
                ended_at: Utc::now(),
                pid,
            };
        }
    };

    let _guard = context::install(TaskBindings {
        request_id: Some(task.request_id.clone()),
        trace_id: task.trace_id.clone(),
        context: task.context.clone(),
        request_datetime: Some(task.request_datetime),
    });

    let outcome = invoke(&spec.entrypoint, instances, &spec.key(), &task);
    let response_meta = context::capture_response_meta();
    let ended_at = Utc::now();

    match outcome {
        Ok(data) => ResultMessage {
            task_id,
            success: true,
            data: Some(data),
            error: None,
            response_meta,
            started_at,
            ended_at,
            pid,
        },
        Err(err) => {
            let error = match err {
                InvokeError::Validation(message) => ExecutionError::validation(message),
                InvokeError::Runtime(run_error) => ExecutionError::runtime(run_error),
            };
            ResultMessage {
                task_id,
                success: false,
                data: None,
                error: Some(error),
                response_meta,
                started_at,
                ended_at,
                pid,
            }
        }
    }
}

fn invoke(
    entrypoint: &Entrypoint,
    instances: &mut HashMap<SpecKey, Box<dyn AlgorithmInstance>>,
    key: &SpecKey,
    task: &TaskMessage,
) -> Result<Value, InvokeError> {
    let hyperparams = task.hyperparams.as_ref();
    match entrypoint {
        Entrypoint::Function(runner) => runner(&task.input, hyperparams),
        Entrypoint::Stateless(factory) => {
            // No lifecycle for stateless classes: construct, run, drop.
            let mut instance = factory();
            instance.run(&task.input, hyperparams)
        }
        Entrypoint::Stateful(factory) => {
            if !instances.contains_key(key) {
                let mut instance = factory();
                instance.initialize().map_err(InvokeError::Runtime)?;
                instances.insert(key.clone(), instance);
            }
            let instance = instances
                .get_mut(key)
                .expect("stateful instance inserted above");
            instance.run(&task.input, hyperparams)
        }
    }
}

/// Capture helper used by the inline executor, which shares the worker's
/// invoke semantics but runs in the server process.
pub(crate) fn invoke_inline(
    entrypoint: &Entrypoint,
    instances: &mut HashMap<SpecKey, Box<dyn AlgorithmInstance>>,
    key: &SpecKey,
    input: &Value,
    hyperparams: Option<&Value>,
    bindings: TaskBindings,
) -> (Result<Value, InvokeError>, Option<ResponseMeta>) {
    let task = TaskMessage {
        task_id: 0,
        name: key.name.clone(),
        version: key.version.clone(),
        input: input.clone(),
        hyperparams: hyperparams.cloned(),
        request_id: bindings.request_id.clone().unwrap_or_default(),
        trace_id: bindings.trace_id.clone(),
        context: bindings.context.clone(),
        request_datetime: bindings.request_datetime.unwrap_or_else(Utc::now),
        stateful: false,
    };
    let _guard = context::install(bindings);
    let outcome = invoke(entrypoint, instances, key, &task);
    let meta = context::capture_response_meta();
    (outcome, meta)
}
