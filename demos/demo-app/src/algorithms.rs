//! The demo algorithm implementations.

use algoserve::context;
use algoserve::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct DoubleInput {
    pub value: i64,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct DoubleOutput {
    pub doubled: i64,
}

pub fn double(input: DoubleInput) -> Result<DoubleOutput, RunError> {
    Ok(DoubleOutput {
        doubled: input.value * 2,
    })
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct ScaleParams {
    pub factor: i64,
}

impl HyperParams for ScaleParams {}

pub fn scale(input: DoubleInput, params: Option<ScaleParams>) -> Result<DoubleOutput, RunError> {
    let factor = params.map(|p| p.factor).unwrap_or(2);
    Ok(DoubleOutput {
        doubled: input.value * factor,
    })
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SleepInput {
    pub value: i64,
    /// How long `run` blocks before answering.
    #[serde(default)]
    pub sleep_s: f64,
}

/// Sleeps, then doubles. The short-timeout registration exercises the
/// supervisor's kill-and-replace path.
#[derive(Default)]
pub struct Sleeper;

impl Algorithm for Sleeper {
    type Input = SleepInput;
    type Output = DoubleOutput;
    type Params = NoParams;

    fn run(&mut self, input: SleepInput, _params: Option<NoParams>) -> Result<DoubleOutput, RunError> {
        if input.sleep_s > 0.0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(input.sleep_s));
        }
        Ok(DoubleOutput {
            doubled: input.value * 2,
        })
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CountInput {
    pub add: i64,
    #[serde(default)]
    pub sleep_s: f64,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct CountOutput {
    pub count: i64,
    pub pid: u32,
}

/// Accumulates across tasks on the same worker; a timeout kill loses the
/// instance along with the worker.
#[derive(Default)]
pub struct Counter {
    count: i64,
}

impl Algorithm for Counter {
    type Input = CountInput;
    type Output = CountOutput;
    type Params = NoParams;

    fn initialize(&mut self) -> Result<(), RunError> {
        tracing::info!("counter instance initialized");
        Ok(())
    }

    fn run(&mut self, input: CountInput, _params: Option<NoParams>) -> Result<CountOutput, RunError> {
        if input.sleep_s > 0.0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(input.sleep_s));
        }
        self.count += input.add;
        Ok(CountOutput {
            count: self.count,
            pid: std::process::id(),
        })
    }

    fn shutdown(&mut self) {
        tracing::info!(count = self.count, "counter instance shut down");
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct AnnotateInput {
    /// Raise after staging the metadata instead of returning.
    #[serde(default)]
    pub fail: bool,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct AnnotateOutput {
    pub tagged: bool,
}

/// Stages a full response-meta override, then returns or fails on demand.
#[derive(Default)]
pub struct Annotate;

impl Algorithm for Annotate {
    type Input = AnnotateInput;
    type Output = AnnotateOutput;
    type Params = NoParams;

    fn run(&mut self, input: AnnotateInput, _params: Option<NoParams>) -> Result<AnnotateOutput, RunError> {
        context::set_response_code(201);
        context::set_response_message("created");
        let mut ctx = AlgorithmContext::default();
        ctx.trace_id = Some("rt".to_string());
        context::set_response_context(ctx);

        if input.fail {
            return Err(RunError::msg("annotated failure"));
        }
        Ok(AnnotateOutput { tagged: true })
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrashInput {
    #[serde(default)]
    pub exit_code: i32,
}

/// Kills the worker process from inside user code; the pool must answer
/// with a `system` error and a replacement worker.
pub fn crash(input: CrashInput) -> Result<DoubleOutput, RunError> {
    std::process::exit(input.exit_code);
}
