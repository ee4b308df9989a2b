//! Declarative algorithm registration.
//!
//! Authors describe an algorithm with an [`AlgorithmDef`]: the entrypoint
//! plus its input/output/hyperparams models and metadata, named explicitly
//! rather than reflected from a signature. Defs are grouped into
//! [`AlgorithmPackage`]s and handed to the registry, which derives the
//! immutable [`AlgorithmSpec`](crate::spec::AlgorithmSpec) from each one.
//!
//! # Example
//!
//! ```ignore
//! let def = AlgorithmDef::function("double", "v1", |inp: DoubleInput| {
//!     Ok(DoubleOutput { doubled: inp.value * 2 })
//! })
//! .author("demo")
//! .category("arithmetic")
//! .created("2026-01-01")
//! .timeout_s(5.0);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::spec::{
    AlgorithmInstance, AlgorithmSpec, AlgorithmType, Entrypoint, ExecutionConfig, ExecutionMode,
    InvokeError, IoModel, LoggingConfig, ModelHandle, RunError,
};

// ── Hyperparams marker ──────────────────────────────────────────────────────

/// Marker for types usable as an algorithm's secondary input bag.
///
/// Implement (or derive the serde/schemars requirements for) this on a
/// dedicated params struct; use [`NoParams`] when the algorithm takes none.
pub trait HyperParams: IoModel {
    /// Whether the spec advertises a hyperparams schema. `NoParams` opts out.
    const DECLARED: bool = true;
}

/// The "no hyperparams" placeholder.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct NoParams {}

impl HyperParams for NoParams {
    const DECLARED: bool = false;
}

// ── Typed algorithm trait ───────────────────────────────────────────────────

/// A class-style algorithm with an optional lifecycle.
///
/// `initialize` and `shutdown` are honored only when the algorithm is
/// registered as stateful; stateless registrations construct a fresh value
/// per task and drop it afterwards without calling either.
pub trait Algorithm: Default + Send + 'static {
    type Input: IoModel;
    type Output: IoModel;
    type Params: HyperParams;

    fn initialize(&mut self) -> Result<(), RunError> {
        Ok(())
    }

    fn run(
        &mut self,
        input: Self::Input,
        params: Option<Self::Params>,
    ) -> Result<Self::Output, RunError>;

    fn shutdown(&mut self) {}
}

/// Adapter driving a typed [`Algorithm`] through the erased
/// [`AlgorithmInstance`] contract: decode, run, encode.
struct TypedInstance<A: Algorithm>(A);

fn decode_input<T: IoModel>(value: &Value) -> Result<T, InvokeError> {
    serde_json::from_value(value.clone()).map_err(|e| InvokeError::Validation(e.to_string()))
}

fn decode_params<P: HyperParams>(value: Option<&Value>) -> Result<Option<P>, InvokeError> {
    match value {
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| InvokeError::Validation(format!("hyperparams: {e}"))),
        None => Ok(None),
    }
}

fn encode_output<T: IoModel>(output: T) -> Result<Value, InvokeError> {
    serde_json::to_value(output)
        .map_err(|e| InvokeError::Runtime(RunError::msg(format!("failed to encode output: {e}"))))
}

impl<A: Algorithm> AlgorithmInstance for TypedInstance<A> {
    fn initialize(&mut self) -> Result<(), RunError> {
        self.0.initialize()
    }

    fn run(&mut self, input: &Value, hyperparams: Option<&Value>) -> Result<Value, InvokeError> {
        let input = decode_input::<A::Input>(input)?;
        let params = decode_params::<A::Params>(hyperparams)?;
        let output = self.0.run(input, params).map_err(InvokeError::Runtime)?;
        encode_output(output)
    }

    fn shutdown(&mut self) {
        self.0.shutdown();
    }
}

// ── The def builder ─────────────────────────────────────────────────────────

/// Builder-style registration descriptor for one algorithm.
///
/// Constructed through [`function`](Self::function),
/// [`stateless`](Self::stateless), or [`stateful`](Self::stateful), then
/// refined with the chained setters and registered through
/// [`AlgorithmRegistry`](crate::registry::AlgorithmRegistry).
pub struct AlgorithmDef {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) description: Option<String>,
    pub(crate) algorithm_type: AlgorithmType,
    pub(crate) created_time: String,
    pub(crate) author: String,
    pub(crate) category: String,
    pub(crate) application_scenarios: Option<String>,
    pub(crate) extra: BTreeMap<String, String>,
    pub(crate) input_model: ModelHandle,
    pub(crate) output_model: ModelHandle,
    pub(crate) hyperparams_model: Option<ModelHandle>,
    pub(crate) execution: ExecutionConfig,
    pub(crate) logging: LoggingConfig,
    pub(crate) entrypoint: Entrypoint,
}

impl AlgorithmDef {
    fn new<I: IoModel, O: IoModel>(
        name: impl Into<String>,
        version: impl Into<String>,
        entrypoint: Entrypoint,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            algorithm_type: AlgorithmType::default(),
            created_time: String::new(),
            author: String::new(),
            category: String::new(),
            application_scenarios: None,
            extra: BTreeMap::new(),
            input_model: ModelHandle::of::<I>(),
            output_model: ModelHandle::of::<O>(),
            hyperparams_model: None,
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
            entrypoint,
        }
    }

    /// A stateless function entrypoint without hyperparams.
    pub fn function<I, O, F>(name: impl Into<String>, version: impl Into<String>, f: F) -> Self
    where
        I: IoModel,
        O: IoModel,
        F: Fn(I) -> Result<O, RunError> + Send + Sync + 'static,
    {
        let runner = Arc::new(move |input: &Value, _params: Option<&Value>| {
            let input = decode_input::<I>(input)?;
            let output = f(input).map_err(InvokeError::Runtime)?;
            encode_output(output)
        });
        Self::new::<I, O>(name, version, Entrypoint::Function(runner))
    }

    /// A stateless function entrypoint taking a hyperparams bag.
    pub fn function_with_params<I, O, P, F>(
        name: impl Into<String>,
        version: impl Into<String>,
        f: F,
    ) -> Self
    where
        I: IoModel,
        O: IoModel,
        P: HyperParams,
        F: Fn(I, Option<P>) -> Result<O, RunError> + Send + Sync + 'static,
    {
        let runner = Arc::new(move |input: &Value, params: Option<&Value>| {
            let input = decode_input::<I>(input)?;
            let params = decode_params::<P>(params)?;
            let output = f(input, params).map_err(InvokeError::Runtime)?;
            encode_output(output)
        });
        let mut def = Self::new::<I, O>(name, version, Entrypoint::Function(runner));
        def.hyperparams_model = Some(ModelHandle::of::<P>());
        def
    }

    /// A class entrypoint constructed per task and discarded afterwards.
    pub fn stateless<A: Algorithm>(name: impl Into<String>, version: impl Into<String>) -> Self {
        let factory: Arc<dyn Fn() -> Box<dyn AlgorithmInstance> + Send + Sync> =
            Arc::new(|| Box::new(TypedInstance(A::default())));
        let mut def =
            Self::new::<A::Input, A::Output>(name, version, Entrypoint::Stateless(factory));
        if A::Params::DECLARED {
            def.hyperparams_model = Some(ModelHandle::of::<A::Params>());
        }
        def
    }

    /// A class entrypoint cached per worker process across tasks.
    pub fn stateful<A: Algorithm>(name: impl Into<String>, version: impl Into<String>) -> Self {
        let factory: Arc<dyn Fn() -> Box<dyn AlgorithmInstance> + Send + Sync> =
            Arc::new(|| Box::new(TypedInstance(A::default())));
        let mut def =
            Self::new::<A::Input, A::Output>(name, version, Entrypoint::Stateful(factory));
        def.execution.stateful = true;
        if A::Params::DECLARED {
            def.hyperparams_model = Some(ModelHandle::of::<A::Params>());
        }
        def
    }

    // ── Metadata setters ────────────────────────────────────────────────

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn algorithm_type(mut self, algorithm_type: AlgorithmType) -> Self {
        self.algorithm_type = algorithm_type;
        self
    }

    /// Registration date, `YYYY-MM-DD`. Required.
    pub fn created(mut self, created_time: impl Into<String>) -> Self {
        self.created_time = created_time.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn application_scenarios(mut self, scenarios: impl Into<String>) -> Self {
        self.application_scenarios = Some(scenarios.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    // ── Execution setters ───────────────────────────────────────────────

    /// Replace the whole execution config.
    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution.execution_mode = mode;
        self
    }

    pub fn isolated_pool(mut self, isolated: bool) -> Self {
        self.execution.isolated_pool = isolated;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.execution.max_workers = max_workers;
        self
    }

    pub fn timeout_s(mut self, timeout_s: f64) -> Self {
        self.execution.timeout_s = Some(timeout_s);
        self
    }

    pub fn kill_tree(mut self, kill_tree: bool) -> Self {
        self.execution.kill_tree = kill_tree;
        self
    }

    pub fn kill_grace_s(mut self, kill_grace_s: f64) -> Self {
        self.execution.kill_grace_s = kill_grace_s;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Derive the immutable spec. Field validation happens at registration.
    pub(crate) fn into_spec(self) -> AlgorithmSpec {
        let is_class = self.entrypoint.is_class();
        AlgorithmSpec {
            name: self.name,
            version: self.version,
            description: self.description,
            algorithm_type: self.algorithm_type,
            created_time: self.created_time,
            author: self.author,
            category: self.category,
            application_scenarios: self.application_scenarios,
            extra: self.extra,
            input_model: self.input_model,
            output_model: self.output_model,
            hyperparams_model: self.hyperparams_model,
            execution: self.execution,
            logging: self.logging,
            entrypoint: self.entrypoint,
            is_class,
        }
    }
}

// ── Packages ────────────────────────────────────────────────────────────────

/// A named group of algorithm defs, the unit selected by `ALGO_MODULES`.
pub struct AlgorithmPackage {
    name: String,
    defs: Vec<AlgorithmDef>,
}

impl AlgorithmPackage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defs: Vec::new(),
        }
    }

    /// Export a def from this package.
    pub fn export(mut self, def: AlgorithmDef) -> Self {
        self.defs.push(def);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_defs(self) -> Vec<AlgorithmDef> {
        self.defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct In {
        value: i64,
    }

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct Out {
        doubled: i64,
    }

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct Scale {
        factor: i64,
    }

    impl HyperParams for Scale {}

    #[derive(Default)]
    struct Doubler;

    impl Algorithm for Doubler {
        type Input = In;
        type Output = Out;
        type Params = NoParams;

        fn run(&mut self, input: In, _params: Option<NoParams>) -> Result<Out, RunError> {
            Ok(Out {
                doubled: input.value * 2,
            })
        }
    }

    #[test]
    fn function_def_runs_through_erased_entrypoint() {
        let def = AlgorithmDef::function("double", "v1", |inp: In| {
            Ok(Out {
                doubled: inp.value * 2,
            })
        });
        let spec = def.into_spec();
        assert!(!spec.is_class);
        let Entrypoint::Function(runner) = &spec.entrypoint else {
            panic!("expected function entrypoint");
        };
        let out = runner(&serde_json::json!({"value": 21}), None).unwrap();
        assert_eq!(out["doubled"], 42);
    }

    #[test]
    fn function_rejects_undecodable_input() {
        let def = AlgorithmDef::function("double", "v1", |inp: In| {
            Ok(Out {
                doubled: inp.value * 2,
            })
        });
        let spec = def.into_spec();
        let Entrypoint::Function(runner) = &spec.entrypoint else {
            panic!("expected function entrypoint");
        };
        let err = runner(&serde_json::json!({"value": "x"}), None).unwrap_err();
        assert!(matches!(err, InvokeError::Validation(_)));
    }

    #[test]
    fn function_with_params_declares_schema() {
        let def = AlgorithmDef::function_with_params(
            "scale",
            "v1",
            |inp: In, params: Option<Scale>| {
                let factor = params.map(|p| p.factor).unwrap_or(1);
                Ok(Out {
                    doubled: inp.value * factor,
                })
            },
        );
        assert!(def.hyperparams_model.is_some());
        let spec = def.into_spec();
        let Entrypoint::Function(runner) = &spec.entrypoint else {
            panic!("expected function entrypoint");
        };
        let out = runner(
            &serde_json::json!({"value": 3}),
            Some(&serde_json::json!({"factor": 7})),
        )
        .unwrap();
        assert_eq!(out["doubled"], 21);
    }

    #[test]
    fn stateless_def_skips_hyperparams_for_no_params() {
        let def = AlgorithmDef::stateless::<Doubler>("double", "v2");
        assert!(def.hyperparams_model.is_none());
        let spec = def.into_spec();
        assert!(spec.is_class);
        assert!(!spec.execution.stateful);
    }

    #[test]
    fn stateful_def_marks_execution_stateful() {
        let def = AlgorithmDef::stateful::<Doubler>("double", "v3");
        assert!(def.execution.stateful);
        let spec = def.into_spec();
        assert!(spec.entrypoint.is_stateful());
    }

    #[test]
    fn typed_instance_maps_run_errors_to_runtime() {
        #[derive(Default)]
        struct Failing;
        impl Algorithm for Failing {
            type Input = In;
            type Output = Out;
            type Params = NoParams;

            fn run(&mut self, _input: In, _params: Option<NoParams>) -> Result<Out, RunError> {
                Err(RunError::msg("nope"))
            }
        }

        let mut instance = TypedInstance(Failing);
        let err = instance.run(&serde_json::json!({"value": 1}), None).unwrap_err();
        assert!(matches!(err, InvokeError::Runtime(e) if e.message == "nope"));
    }
}
