// # abookd - Address Book Bridge Daemon
//
// Thin integration layer: configuration, logging, runtime and backend
// registration. Synchronization logic lives in abook-core.
//
// The daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing the runtime
// 3. Registering native store backends and contact caches
// 4. Running the synchronization controller until SIGINT/SIGTERM
//
// ## Configuration
//
// ### Backend
// - `ABOOK_BACKEND_TYPE`: Native store backend (local, rpc)
// - `ABOOK_BACKEND_EXECUTABLE`: Backend executable (for rpc)
// - `ABOOK_BACKEND_ARGS`: Space-separated backend arguments (for rpc)
// - `ABOOK_BACKEND_ENDPOINT`: Endpoint the backend listens on (for rpc)
// - `ABOOK_BACKEND_LOG_DIR`: Backend log directory (for rpc)
// - `ABOOK_BACKEND_DUMP_DIR`: Backend crash dump directory (for rpc)
//
// ### Contact Cache
// - `ABOOK_CACHE_TYPE`: Cache type (file, memory)
// - `ABOOK_CACHE_PATH`: Path to the cache file (for file cache)
//
// ### Tuning
// - `ABOOK_QUIET_PERIOD_MS`: Notification quiet period
// - `ABOOK_QUERY_FILTER`: Filter for the startup full query
// - `ABOOK_PROBE_INTERVAL_MS`: Backend liveness probe interval
// - `ABOOK_MAX_RESTARTS`: Restarts before the backend is given up on
// - `ABOOK_MAX_RETRIES`: Retries of a request interrupted by a crash
// - `ABOOK_DUMP_TIMEOUT_SECS`: Diagnostic dump timeout
// - `ABOOK_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export ABOOK_BACKEND_TYPE=rpc
// export ABOOK_BACKEND_EXECUTABLE=/usr/lib/abook/abook-backend
// export ABOOK_BACKEND_ENDPOINT=127.0.0.1:5432
// export ABOOK_BACKEND_LOG_DIR=/var/log/abook
// export ABOOK_BACKEND_DUMP_DIR=/var/lib/abook/dumps
// export ABOOK_CACHE_TYPE=file
// export ABOOK_CACHE_PATH=/var/lib/abook/contacts.json
//
// abookd
// ```

use abook_core::config::{BackendConfig, BridgeConfig, CacheConfig};
use abook_core::sync::{SyncController, SyncEvent};
use abook_core::BackendRegistry;
use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Time the controller gets to flush and stop the backend
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum AbookExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<AbookExitCode> for ExitCode {
    fn from(code: AbookExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    backend_type: String,
    backend_executable: Option<String>,
    backend_args: Vec<String>,
    backend_endpoint: String,
    backend_log_dir: Option<String>,
    backend_dump_dir: Option<String>,
    cache_type: String,
    cache_path: Option<String>,
    quiet_period_ms: Option<u64>,
    query_filter: String,
    probe_interval_ms: Option<u64>,
    max_restarts: Option<u32>,
    max_retries: Option<usize>,
    dump_timeout_secs: Option<u64>,
    log_level: String,
}

/// Parse an optional numeric variable
fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a number. Got: {}", name, raw)),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            backend_type: env::var("ABOOK_BACKEND_TYPE").unwrap_or_else(|_| "local".to_string()),
            backend_executable: env::var("ABOOK_BACKEND_EXECUTABLE").ok(),
            backend_args: env::var("ABOOK_BACKEND_ARGS")
                .unwrap_or_default()
                .split_whitespace()
                .map(String::from)
                .collect(),
            backend_endpoint: env::var("ABOOK_BACKEND_ENDPOINT")
                .unwrap_or_else(|_| "127.0.0.1:5432".to_string()),
            backend_log_dir: env::var("ABOOK_BACKEND_LOG_DIR").ok(),
            backend_dump_dir: env::var("ABOOK_BACKEND_DUMP_DIR").ok(),
            cache_type: env::var("ABOOK_CACHE_TYPE").unwrap_or_else(|_| "file".to_string()),
            cache_path: env::var("ABOOK_CACHE_PATH").ok(),
            quiet_period_ms: parse_var("ABOOK_QUIET_PERIOD_MS")?,
            query_filter: env::var("ABOOK_QUERY_FILTER").unwrap_or_default(),
            probe_interval_ms: parse_var("ABOOK_PROBE_INTERVAL_MS")?,
            max_restarts: parse_var("ABOOK_MAX_RESTARTS")?,
            max_retries: parse_var("ABOOK_MAX_RETRIES")?,
            dump_timeout_secs: parse_var("ABOOK_DUMP_TIMEOUT_SECS")?,
            log_level: env::var("ABOOK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the environment-level settings
    ///
    /// Structural checks shared with every other configuration source run
    /// afterwards in `BridgeConfig::validate`.
    fn validate(&self) -> Result<()> {
        match self.backend_type.as_str() {
            "local" => {}
            "rpc" => {
                if self.backend_executable.as_ref().is_none_or(|e| e.is_empty()) {
                    anyhow::bail!(
                        "ABOOK_BACKEND_EXECUTABLE is required when ABOOK_BACKEND_TYPE=rpc. \
                        Set it via: export ABOOK_BACKEND_EXECUTABLE=/path/to/backend"
                    );
                }
                if self.backend_log_dir.is_none() || self.backend_dump_dir.is_none() {
                    anyhow::bail!(
                        "ABOOK_BACKEND_LOG_DIR and ABOOK_BACKEND_DUMP_DIR are required \
                        when ABOOK_BACKEND_TYPE=rpc"
                    );
                }
            }
            _ => anyhow::bail!(
                "ABOOK_BACKEND_TYPE '{}' is not supported. \
                Supported backends: local, rpc",
                self.backend_type
            ),
        }

        match self.cache_type.as_str() {
            "memory" => {}
            "file" => match &self.cache_path {
                None => anyhow::bail!(
                    "ABOOK_CACHE_PATH is required when ABOOK_CACHE_TYPE=file. \
                    Set it via: export ABOOK_CACHE_PATH=/var/lib/abook/contacts.json"
                ),
                Some(path) => {
                    if let Some(parent) = std::path::Path::new(path).parent()
                        && !parent.as_os_str().is_empty()
                        && !parent.exists()
                    {
                        anyhow::bail!(
                            "ABOOK_CACHE_PATH parent directory does not exist: {}. \
                            Create it first: mkdir -p {}",
                            parent.display(),
                            parent.display()
                        );
                    }
                }
            },
            _ => anyhow::bail!(
                "ABOOK_CACHE_TYPE '{}' is not supported. \
                Supported types: file, memory",
                self.cache_type
            ),
        }

        if let Some(quiet) = self.quiet_period_ms
            && !(10..=60_000).contains(&quiet)
        {
            anyhow::bail!(
                "ABOOK_QUIET_PERIOD_MS must be between 10 and 60000. Got: {}",
                quiet
            );
        }

        if let Some(max_retries) = self.max_retries
            && max_retries > 10
        {
            anyhow::bail!("ABOOK_MAX_RETRIES must be at most 10. Got: {}", max_retries);
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "ABOOK_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Build the bridge configuration
    fn to_bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::new();

        config.backend = match self.backend_type.as_str() {
            "rpc" => BackendConfig::Rpc {
                executable: PathBuf::from(self.backend_executable.clone().unwrap_or_default()),
                args: self.backend_args.clone(),
                endpoint: self.backend_endpoint.clone(),
                log_dir: PathBuf::from(self.backend_log_dir.clone().unwrap_or_default()),
                dump_dir: PathBuf::from(self.backend_dump_dir.clone().unwrap_or_default()),
            },
            _ => BackendConfig::Local,
        };

        config.cache = match &self.cache_path {
            Some(path) if self.cache_type == "file" => CacheConfig::File {
                path: PathBuf::from(path),
            },
            _ => CacheConfig::Memory,
        };

        if let Some(quiet) = self.quiet_period_ms {
            config.coalescer.quiet_period_ms = quiet;
        }
        config.sync.query_filter = self.query_filter.clone();
        if let Some(interval) = self.probe_interval_ms {
            config.supervisor.probe_interval_ms = interval;
        }
        if let Some(max_restarts) = self.max_restarts {
            config.supervisor.max_restarts = max_restarts;
        }
        if let Some(max_retries) = self.max_retries {
            config.transport.max_retries = max_retries;
        }
        if let Some(timeout) = self.dump_timeout_secs {
            config.transport.dump_timeout_secs = timeout;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return AbookExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return AbookExitCode::ConfigError.into();
    }

    let bridge_config = match config.to_bridge_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration validation error: {}", e);
            return AbookExitCode::ConfigError.into();
        }
    };

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return AbookExitCode::ConfigError.into();
    }

    info!("Starting abookd daemon");
    info!(
        "Configuration loaded: backend={}, cache={}",
        bridge_config.backend.type_name(),
        bridge_config.cache.type_name()
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return AbookExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(bridge_config).await {
            error!("Daemon error: {}", e);
            AbookExitCode::RuntimeError
        } else {
            AbookExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Register every backend compiled into this binary
fn build_registry() -> BackendRegistry {
    let registry = BackendRegistry::with_builtin_caches();

    #[cfg(feature = "rpc")]
    {
        info!("Registering RPC backend");
        abook_backend_rpc::register(&registry);
    }

    #[cfg(feature = "local")]
    {
        info!("Registering local backend");
        abook_backend_local::register(
            &registry,
            Arc::new(abook_backend_local::InMemoryAddressBook::new()),
        );
    }

    registry
}

/// Run the daemon
async fn run_daemon(config: BridgeConfig) -> Result<()> {
    let registry = build_registry();

    let store = registry.create_store(&config).await?;
    let cache = registry.create_cache(&config.cache).await?;
    info!("Native store backend: {}", store.backend_name());

    let (controller, events) = SyncController::new(store, cache, &config)?;
    let controller = Arc::new(controller);
    tokio::spawn(log_events(events));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut running = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run_with_shutdown(shutdown_rx).await })
    };

    tokio::select! {
        signal = wait_for_shutdown() => {
            info!("Received shutdown signal: {}", signal?);
        }
        finished = &mut running => {
            // The controller only returns on its own when startup failed
            finished??;
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, running).await {
        Ok(finished) => finished??,
        Err(_) => anyhow::bail!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT),
    }

    info!("Daemon stopped");
    Ok(())
}

/// Log controller events
async fn log_events(mut events: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::BackendFailed { reason } => error!("Native address book failed: {}", reason),
            SyncEvent::WriteRejected { contact, reason } => {
                warn!("Edit of contact {} was not saved: {}", contact, reason)
            }
            other => info!("{:?}", other),
        }
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
