//! The algorithm catalog.
//!
//! [`AlgorithmRegistry`] owns every registered [`AlgorithmSpec`], keyed by
//! `(name, version)`. It is written during provisioning — package loading
//! and metadata-override loading — and read-only afterwards, so the server
//! shares it behind a plain `Arc` without locking.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::def::{AlgorithmDef, AlgorithmPackage};
use crate::overrides::{load_override_dir, OverrideEntry};
use crate::spec::{AlgorithmSpec, SpecKey};

/// Error type for registry operations.
#[derive(Debug)]
pub enum RegistryError {
    /// `(name, version)` is already taken.
    AlreadyRegistered(SpecKey),
    /// No spec under `(name, version)`.
    NotFound(SpecKey),
    /// The def failed registration-time validation.
    Validation { key: SpecKey, message: String },
    /// An override directory could not be read.
    ConfigLoad(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered(key) => {
                write!(f, "algorithm already registered: {key}")
            }
            RegistryError::NotFound(key) => write!(f, "algorithm not found: {key}"),
            RegistryError::Validation { key, message } => {
                write!(f, "invalid algorithm spec {key}: {message}")
            }
            RegistryError::ConfigLoad(msg) => write!(f, "metadata config load error: {msg}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Exclusive-ownership catalog of algorithm specs.
#[derive(Default)]
pub struct AlgorithmRegistry {
    specs: HashMap<SpecKey, Arc<AlgorithmSpec>>,
    /// Retained override table; applied to existing specs when loaded and
    /// to every spec registered afterwards. Later entries win.
    overrides: Vec<OverrideEntry>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one algorithm. Fails on duplicate keys or validation
    /// errors; retained overrides are applied before insertion.
    pub fn register(&mut self, def: AlgorithmDef) -> Result<(), RegistryError> {
        let mut spec = def.into_spec();
        let key = spec.key();
        validate_spec(&spec).map_err(|message| RegistryError::Validation {
            key: key.clone(),
            message,
        })?;
        if self.specs.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key));
        }
        for entry in &self.overrides {
            if entry.matches(&spec) {
                entry.apply(&mut spec);
            }
        }
        info!(algorithm = %key, stateful = spec.execution.stateful, "registered algorithm");
        self.specs.insert(key, Arc::new(spec));
        Ok(())
    }

    /// Resolve a spec by `(name, version)`.
    pub fn get(&self, name: &str, version: &str) -> Result<Arc<AlgorithmSpec>, RegistryError> {
        let key = SpecKey {
            name: name.to_string(),
            version: version.to_string(),
        };
        self.specs
            .get(&key)
            .cloned()
            .ok_or(RegistryError::NotFound(key))
    }

    /// All registered specs, in stable key order.
    pub fn list(&self) -> Vec<Arc<AlgorithmSpec>> {
        let mut specs: Vec<_> = self.specs.values().cloned().collect();
        specs.sort_by(|a, b| a.key().cmp(&b.key()));
        specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Register every def exported by the given packages, in lexical
    /// package order. Defs failing validation are skipped with a warning;
    /// duplicate keys are an error. `modules` filters packages by name
    /// (empty = all), mirroring `ALGO_MODULES`.
    pub fn load_packages(
        &mut self,
        packages: Vec<AlgorithmPackage>,
        modules: &[String],
    ) -> Result<usize, RegistryError> {
        let mut packages = packages;
        packages.sort_by(|a, b| a.name().cmp(b.name()));

        let mut registered = 0;
        for package in packages {
            if !modules.is_empty() && !modules.iter().any(|m| m == package.name()) {
                info!(package = package.name(), "package disabled, skipping");
                continue;
            }
            let package_name = package.name().to_string();
            for def in package.into_defs() {
                let key = SpecKey {
                    name: def.name.clone(),
                    version: def.version.clone(),
                };
                match self.register(def) {
                    Ok(()) => registered += 1,
                    Err(RegistryError::Validation { message, .. }) => {
                        warn!(
                            package = %package_name,
                            algorithm = %key,
                            %message,
                            "skipping invalid export"
                        );
                    }
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(registered)
    }

    /// Load `*.algometa.yaml` overrides from a directory.
    ///
    /// Files are read in lexical order, entries in file order; the table is
    /// retained so later registrations pick the overrides up as well.
    /// Returns the number of entries loaded.
    pub fn load_config(&mut self, dir: &Path) -> Result<usize, RegistryError> {
        let entries = load_override_dir(dir).map_err(RegistryError::ConfigLoad)?;
        let count = entries.len();
        self.overrides.extend(entries);

        // Re-apply the full table so later files win deterministically.
        for spec in self.specs.values_mut() {
            let mut updated = (**spec).clone();
            let mut touched = false;
            for entry in &self.overrides {
                if entry.matches(&updated) {
                    entry.apply(&mut updated);
                    touched = true;
                }
            }
            if touched {
                *spec = Arc::new(updated);
            }
        }
        info!(count, dir = %dir.display(), "loaded metadata overrides");
        Ok(count)
    }
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("specs", &self.specs.len())
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

/// Registration-time validation: required metadata present, a real
/// `YYYY-MM-DD` date, a sane pool size, and I/O schemas that survive a
/// JSON round-trip (the cross-process codec smoke test).
fn validate_spec(spec: &AlgorithmSpec) -> Result<(), String> {
    if spec.name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if spec.version.is_empty() {
        return Err("version must not be empty".to_string());
    }
    if spec.author.is_empty() {
        return Err("author is required".to_string());
    }
    if spec.category.is_empty() {
        return Err("category is required".to_string());
    }
    if NaiveDate::parse_from_str(&spec.created_time, "%Y-%m-%d").is_err() {
        return Err(format!(
            "createdTime must be a valid YYYY-MM-DD date, got {:?}",
            spec.created_time
        ));
    }
    if spec.execution.max_workers < 1 {
        return Err("maxWorkers must be >= 1".to_string());
    }
    if spec.execution.kill_grace_s < 0.0 {
        return Err("killGraceS must be >= 0".to_string());
    }

    smoke_test_schema("input", &spec.input_model)?;
    smoke_test_schema("output", &spec.output_model)?;
    if let Some(handle) = &spec.hyperparams_model {
        smoke_test_schema("hyperparams", handle)?;
    }
    Ok(())
}

fn smoke_test_schema(which: &str, handle: &crate::spec::ModelHandle) -> Result<(), String> {
    let schema = handle.schema();
    if !schema.is_object() {
        return Err(format!("{which} model {} yields no object schema", handle.name()));
    }
    let encoded = serde_json::to_string(&schema)
        .map_err(|e| format!("{which} schema does not encode: {e}"))?;
    serde_json::from_str::<serde_json::Value>(&encoded)
        .map_err(|e| format!("{which} schema does not round-trip: {e}"))?;
    Ok(())
}
