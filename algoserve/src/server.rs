//! Server assembly and entry point.
//!
//! [`Server`] collects algorithm packages and configuration, then
//! [`launch`](Server::launch) runs the whole show:
//!
//! 1. If the process carries the worker marker, rebuild the registry and
//!    serve tasks over stdin/stdout instead of binding HTTP — worker
//!    processes are re-invocations of this same binary, so entrypoints
//!    resolve against an identical catalog.
//! 2. Otherwise drive the lifecycle `provisioning → ready → running`:
//!    load config and packages, apply metadata overrides, start the
//!    executors, and serve until Ctrl-C/SIGTERM drains everything down to
//!    `stopped`.

use std::fmt;
use std::sync::Arc;

use algoserve_core::config::ServiceConfig;
use algoserve_core::def::AlgorithmPackage;
use algoserve_core::lifecycle::{Lifecycle, LifecycleState};
use algoserve_core::registry::AlgorithmRegistry;
use algoserve_executor::executors::{DispatchingExecutor, Executor};
use algoserve_executor::pool::WorkerCommand;
use algoserve_http::routes::{router, AppState};
use tracing::{info, warn};

/// Error type for server startup.
#[derive(Debug)]
pub enum ServeError {
    Config(String),
    Registry(String),
    Executor(String),
    Io(std::io::Error),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeError::Config(msg) => write!(f, "configuration error: {msg}"),
            ServeError::Registry(msg) => write!(f, "registry load error: {msg}"),
            ServeError::Executor(msg) => write!(f, "executor error: {msg}"),
            ServeError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ServeError {}

impl From<std::io::Error> for ServeError {
    fn from(e: std::io::Error) -> Self {
        ServeError::Io(e)
    }
}

type PackageFactory = Box<dyn Fn() -> AlgorithmPackage + Send + Sync>;

/// Builder for the algorithm execution server.
///
/// Packages are registered as factories so the worker process can rebuild
/// the exact same registry from the same code.
pub struct Server {
    packages: Vec<PackageFactory>,
    config: Option<ServiceConfig>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            packages: Vec::new(),
            config: None,
        }
    }

    /// Register an algorithm package.
    pub fn package<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> AlgorithmPackage + Send + Sync + 'static,
    {
        self.packages.push(Box::new(factory));
        self
    }

    /// Use an explicit configuration instead of reading the environment.
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Run the server (or the worker loop, in a worker process).
    ///
    /// This is the whole `main` of an Algoserve application; it builds its
    /// own runtime so the worker divert happens before tokio exists.
    pub fn launch(self) -> Result<(), ServeError> {
        init_tracing();

        let config = match &self.config {
            Some(config) => config.clone(),
            None => ServiceConfig::from_env().map_err(|e| ServeError::Config(e.to_string()))?,
        };

        if algoserve_executor::worker::is_worker_process() {
            let registry = self.build_registry(&config, true)?;
            let code = algoserve_executor::worker::run_worker(&registry);
            std::process::exit(code);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.serve(config))
    }

    fn build_registry(
        &self,
        config: &ServiceConfig,
        quiet: bool,
    ) -> Result<AlgorithmRegistry, ServeError> {
        let mut registry = AlgorithmRegistry::new();
        let packages: Vec<AlgorithmPackage> =
            self.packages.iter().map(|factory| factory()).collect();
        let count = registry
            .load_packages(packages, &config.modules)
            .map_err(|e| ServeError::Registry(e.to_string()))?;
        if let Some(dir) = &config.metadata_config_dir {
            registry
                .load_config(dir)
                .map_err(|e| ServeError::Registry(e.to_string()))?;
        }
        if !quiet {
            if let Some(dir) = &config.module_dir {
                warn!(
                    dir = %dir.display(),
                    "ALGO_MODULE_DIR is set but packages are compiled in; ignoring"
                );
            }
            info!(algorithms = count, "registry loaded");
        }
        Ok(registry)
    }

    async fn serve(self, config: ServiceConfig) -> Result<(), ServeError> {
        let lifecycle = Lifecycle::new();
        lifecycle
            .advance(LifecycleState::Provisioning)
            .await
            .map_err(|e| ServeError::Config(e.to_string()))?;

        let registry = Arc::new(self.build_registry(&config, false)?);
        let command = WorkerCommand::current_exe()?;
        let executor = Arc::new(DispatchingExecutor::new(config.executor.clone(), command));

        // Pool start rides the ready transition; drain rides draining.
        {
            let executor = executor.clone();
            lifecycle.on_enter(LifecycleState::Ready, move || async move {
                executor.start().await.map_err(|e| e.to_string())
            });
        }
        {
            let executor = executor.clone();
            lifecycle.on_enter(LifecycleState::Draining, move || async move {
                executor.shutdown(true).await;
                Ok(())
            });
        }

        let started = lifecycle.advance(LifecycleState::Ready).await;
        if let Err(e) = started {
            // Inability to spawn the initial workers is fatal to the server.
            return Err(ServeError::Executor(e.to_string()));
        }

        let state = AppState {
            registry,
            executor,
            lifecycle: lifecycle.clone(),
            config: Arc::new(config.clone()),
        };
        let app = router(state);

        let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
        lifecycle
            .advance(LifecycleState::Running)
            .await
            .map_err(|e| ServeError::Config(e.to_string()))?;
        info!(addr = %config.bind_addr(), url = %config.advertised_url(), "algoserve listening");
        if config.registry_enabled {
            // Catalog publishing is an external collaborator; only announce
            // that it would be fed from here.
            info!(url = %config.advertised_url(), "service catalog publishing enabled");
        }
        if config.swagger_enabled {
            info!(path = %config.swagger_path, "swagger ui enabled");
            if config.swagger_open_on_startup {
                // No browser on a server host; print the URL instead.
                info!(
                    url = %format!("{}{}", config.advertised_url(), config.swagger_path),
                    "open the swagger ui here"
                );
            }
        }

        let lifecycle_for_shutdown = lifecycle.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        lifecycle_for_shutdown
            .advance(LifecycleState::Draining)
            .await
            .map_err(|e| ServeError::Executor(e.to_string()))?;
        lifecycle_for_shutdown
            .advance(LifecycleState::Stopped)
            .await
            .map_err(|e| ServeError::Executor(e.to_string()))?;
        info!("algoserve stopped");
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl-C");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining");
}
