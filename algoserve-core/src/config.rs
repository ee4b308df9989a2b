//! Service configuration from the environment.
//!
//! All knobs come from environment variables (a `.env` file is honored but
//! never overrides already-set variables). Malformed values are fatal at
//! startup rather than silently defaulted.

use std::fmt;
use std::path::PathBuf;

/// Error type for configuration loading.
#[derive(Debug)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value for {}: {:?} (expected {})",
            self.key, self.value, self.expected
        )
    }
}

impl std::error::Error for ConfigError {}

/// Executor/pool sizing and kill policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    /// Shared-pool worker count (`EXECUTOR_GLOBAL_MAX_WORKERS`).
    pub global_max_workers: usize,
    /// Admission queue capacity (`EXECUTOR_GLOBAL_QUEUE_SIZE`).
    pub global_queue_size: usize,
    /// Fallback effective timeout (`EXECUTOR_DEFAULT_TIMEOUT_S`).
    pub default_timeout_s: Option<f64>,
    /// How long a submit may wait for admission (`EXECUTOR_ADMIT_TIMEOUT_S`).
    pub admit_timeout_s: f64,
    /// SIGTERM-to-SIGKILL grace (`EXECUTOR_KILL_GRACE_S`).
    pub kill_grace_s: f64,
    /// Kill the whole process group on reclaim (`EXECUTOR_KILL_TREE`).
    pub kill_tree: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            global_max_workers: 4,
            global_queue_size: 16,
            default_timeout_s: None,
            admit_timeout_s: 5.0,
            kill_grace_s: 1.0,
            kill_tree: false,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Listener (`SERVICE_BIND_HOST` / `SERVICE_PORT`).
    pub bind_host: String,
    pub port: u16,
    /// Advertised URL pieces for catalog publishing (`SERVICE_HOST` /
    /// `SERVICE_PROTOCOL`).
    pub advertised_host: Option<String>,
    pub advertised_protocol: String,
    /// Enabled package names (`ALGO_MODULES`, comma-separated; empty = all).
    pub modules: Vec<String>,
    /// `ALGO_MODULE_DIR` — accepted for compatibility; packages are
    /// compiled in, so a set value only produces a startup warning.
    pub module_dir: Option<PathBuf>,
    /// Directory of `*.algometa.yaml` overrides (`ALGO_METADATA_CONFIG_DIR`).
    pub metadata_config_dir: Option<PathBuf>,
    /// Swagger UI gating (`SERVICE_SWAGGER_ENABLED` / `_OPEN_ON_STARTUP` /
    /// `_PATH`).
    pub swagger_enabled: bool,
    pub swagger_open_on_startup: bool,
    pub swagger_path: String,
    /// Distributed catalog publishing toggle (`SERVICE_REGISTRY_ENABLED`);
    /// the publisher itself is an external collaborator.
    pub registry_enabled: bool,
    pub executor: ExecutorSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8000,
            advertised_host: None,
            advertised_protocol: "http".to_string(),
            modules: Vec::new(),
            module_dir: None,
            metadata_config_dir: None,
            swagger_enabled: false,
            swagger_open_on_startup: false,
            swagger_path: "/docs".to_string(),
            registry_enabled: false,
            executor: ExecutorSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // .env never overwrites already-set variables.
        let _ = dotenvy::dotenv();

        let defaults = ServiceConfig::default();
        let executor_defaults = ExecutorSettings::default();

        Ok(Self {
            bind_host: env_string("SERVICE_BIND_HOST").unwrap_or(defaults.bind_host),
            port: env_parse("SERVICE_PORT", "a port number")?.unwrap_or(defaults.port),
            advertised_host: env_string("SERVICE_HOST"),
            advertised_protocol: env_string("SERVICE_PROTOCOL")
                .unwrap_or(defaults.advertised_protocol),
            modules: env_string("ALGO_MODULES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            module_dir: env_string("ALGO_MODULE_DIR").map(PathBuf::from),
            metadata_config_dir: env_string("ALGO_METADATA_CONFIG_DIR").map(PathBuf::from),
            swagger_enabled: env_bool("SERVICE_SWAGGER_ENABLED")?.unwrap_or(false),
            swagger_open_on_startup: env_bool("SERVICE_SWAGGER_OPEN_ON_STARTUP")?.unwrap_or(false),
            swagger_path: env_string("SERVICE_SWAGGER_PATH").unwrap_or(defaults.swagger_path),
            registry_enabled: env_bool("SERVICE_REGISTRY_ENABLED")?.unwrap_or(false),
            executor: ExecutorSettings {
                global_max_workers: env_parse("EXECUTOR_GLOBAL_MAX_WORKERS", "an integer >= 1")?
                    .map(|n: usize| n.max(1))
                    .unwrap_or(executor_defaults.global_max_workers),
                global_queue_size: env_parse("EXECUTOR_GLOBAL_QUEUE_SIZE", "an integer >= 1")?
                    .map(|n: usize| n.max(1))
                    .unwrap_or(executor_defaults.global_queue_size),
                default_timeout_s: env_parse("EXECUTOR_DEFAULT_TIMEOUT_S", "seconds")?,
                admit_timeout_s: env_parse("EXECUTOR_ADMIT_TIMEOUT_S", "seconds")?
                    .unwrap_or(executor_defaults.admit_timeout_s),
                kill_grace_s: env_parse("EXECUTOR_KILL_GRACE_S", "seconds >= 0")?
                    .map(|g: f64| g.max(0.0))
                    .unwrap_or(executor_defaults.kill_grace_s),
                kill_tree: env_bool("EXECUTOR_KILL_TREE")?.unwrap_or(false),
            },
        })
    }

    /// The socket address the listener binds.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// The externally advertised base URL.
    pub fn advertised_url(&self) -> String {
        let host = self.advertised_host.as_deref().unwrap_or(&self.bind_host);
        format!("{}://{}:{}", self.advertised_protocol, host, self.port)
    }
}

fn env_string(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(
    key: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError {
            key,
            value: raw,
            expected,
        }),
        None => Ok(None),
    }
}

fn env_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match env_string(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError {
                key,
                value: raw,
                expected: "a boolean (true/false)",
            }),
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "SERVICE_BIND_HOST",
            "SERVICE_PORT",
            "SERVICE_HOST",
            "SERVICE_PROTOCOL",
            "ALGO_MODULES",
            "ALGO_MODULE_DIR",
            "ALGO_METADATA_CONFIG_DIR",
            "SERVICE_SWAGGER_ENABLED",
            "SERVICE_SWAGGER_OPEN_ON_STARTUP",
            "SERVICE_SWAGGER_PATH",
            "SERVICE_REGISTRY_ENABLED",
            "EXECUTOR_GLOBAL_MAX_WORKERS",
            "EXECUTOR_GLOBAL_QUEUE_SIZE",
            "EXECUTOR_DEFAULT_TIMEOUT_S",
            "EXECUTOR_ADMIT_TIMEOUT_S",
            "EXECUTOR_KILL_GRACE_S",
            "EXECUTOR_KILL_TREE",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_when_env_is_empty() {
        clear_env();
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.executor.global_max_workers, 4);
        assert!(config.executor.default_timeout_s.is_none());
        assert!(!config.swagger_enabled);
    }

    #[test]
    #[serial]
    fn reads_listener_and_executor_settings() {
        clear_env();
        std::env::set_var("SERVICE_BIND_HOST", "127.0.0.1");
        std::env::set_var("SERVICE_PORT", "9100");
        std::env::set_var("EXECUTOR_GLOBAL_MAX_WORKERS", "8");
        std::env::set_var("EXECUTOR_DEFAULT_TIMEOUT_S", "30.5");
        std::env::set_var("EXECUTOR_KILL_TREE", "true");
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:9100");
        assert_eq!(config.executor.global_max_workers, 8);
        assert_eq!(config.executor.default_timeout_s, Some(30.5));
        assert!(config.executor.kill_tree);
        clear_env();
    }

    #[test]
    #[serial]
    fn module_list_is_split_and_trimmed() {
        clear_env();
        std::env::set_var("ALGO_MODULES", "alpha, beta ,,gamma");
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.modules, ["alpha", "beta", "gamma"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn malformed_port_is_fatal() {
        clear_env();
        std::env::set_var("SERVICE_PORT", "not-a-port");
        let err = ServiceConfig::from_env().unwrap_err();
        assert_eq!(err.key, "SERVICE_PORT");
        clear_env();
    }

    #[test]
    #[serial]
    fn malformed_bool_is_fatal() {
        clear_env();
        std::env::set_var("SERVICE_SWAGGER_ENABLED", "maybe");
        assert!(ServiceConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn advertised_url_prefers_service_host() {
        clear_env();
        std::env::set_var("SERVICE_HOST", "algo.internal");
        std::env::set_var("SERVICE_PROTOCOL", "https");
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.advertised_url(), "https://algo.internal:8000");
        clear_env();
    }
}
