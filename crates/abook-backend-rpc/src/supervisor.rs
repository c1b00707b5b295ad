//! Crash supervisor
//!
//! Probes the backend process on a fixed interval and restarts it when the
//! probe fails. Restarts are counted; once the budget is spent the backend
//! is declared permanently failed and the transport gate is closed for
//! good.
//!
//! ## Restart Sequence
//!
//! 1. Hold the transport gate so new requests wait
//! 2. Report a crash dump younger than `dump_max_age`, if one exists
//! 3. Stop the process, rotate its log files and prune old dumps
//! 4. Start the process and reopen the gate

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use abook_core::Result;
use abook_core::config::SupervisorConfig;

use crate::transport::{FailureOracle, StopReason, TransportGate};

/// Name of the backend's current log file
pub const LOG_FILE_NAME: &str = "backend.log";

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// The backend passed its last probe (or was just restarted)
    Alive,
    /// A restart is in progress or the last restart attempt failed
    Restarting,
    /// The restart budget is exhausted; probing has stopped
    PermanentlyFailed,
}

/// Health bookkeeping for the backend process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendHealth {
    /// When the backend was last restarted
    pub last_restart: Option<Instant>,
    /// Restarts since the backend was last stable
    pub consecutive_failures: u32,
    /// Set while the bridge shuts the backend down
    pub uninitializing: bool,
}

/// Lifecycle of the backend process
#[async_trait]
pub trait BackendProcess: Send + Sync {
    /// Start the process and wait until it accepts requests
    async fn start(&self) -> Result<()>;

    /// Stop the process
    async fn stop(&self) -> Result<()>;

    /// Liveness check
    async fn is_alive(&self) -> bool;
}

/// Receives crash evidence and terminal failures
#[async_trait]
pub trait DiagnosticsReporter: Send + Sync {
    /// A crash dump corroborates a backend failure
    async fn crash_report(&self, dump: &Path);

    /// The backend will not be restarted again
    async fn permanent_failure(&self, reason: &str);
}

/// Reporter that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReporter;

#[async_trait]
impl DiagnosticsReporter for LoggingReporter {
    async fn crash_report(&self, dump: &Path) {
        warn!("Backend crash dump available: {}", dump.display());
    }

    async fn permanent_failure(&self, reason: &str) {
        error!("Native address book unavailable: {}", reason);
    }
}

#[derive(Debug, Clone)]
struct ArtifactDirs {
    log_dir: PathBuf,
    dump_dir: PathBuf,
}

/// Watches the backend process and restarts it when it dies
pub struct CrashSupervisor {
    process: Arc<dyn BackendProcess>,
    gate: Arc<TransportGate>,
    reporter: Arc<dyn DiagnosticsReporter>,
    config: SupervisorConfig,
    artifacts: Option<ArtifactDirs>,
    state: RwLock<SupervisorState>,
    health: Mutex<BackendHealth>,
    restart_lock: tokio::sync::Mutex<()>,
}

impl CrashSupervisor {
    /// Create a supervisor for a running backend
    pub fn new(
        process: Arc<dyn BackendProcess>,
        gate: Arc<TransportGate>,
        config: &SupervisorConfig,
    ) -> Self {
        Self {
            process,
            gate,
            reporter: Arc::new(LoggingReporter),
            config: config.clone(),
            artifacts: None,
            state: RwLock::new(SupervisorState::Alive),
            health: Mutex::new(BackendHealth::default()),
            restart_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Rotate logs in `log_dir` and inspect/prune dumps in `dump_dir` on restart
    pub fn with_artifacts(mut self, log_dir: impl Into<PathBuf>, dump_dir: impl Into<PathBuf>) -> Self {
        self.artifacts = Some(ArtifactDirs {
            log_dir: log_dir.into(),
            dump_dir: dump_dir.into(),
        });
        self
    }

    /// Send crash evidence and terminal failures to `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn DiagnosticsReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Current state
    pub fn state(&self) -> SupervisorState {
        *self.state.read()
    }

    /// Snapshot of the health bookkeeping
    pub fn health(&self) -> BackendHealth {
        self.health.lock().clone()
    }

    /// Stop restarting the backend; it is being shut down on purpose
    pub fn begin_shutdown(&self) {
        self.health.lock().uninitializing = true;
    }

    /// Probe on the configured interval until `shutdown` fires or the
    /// backend fails permanently
    pub async fn run_with_shutdown(&self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!("Probing backend every {:?}", self.config.probe_interval());
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Supervisor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if self.probe().await == SupervisorState::PermanentlyFailed {
                        info!("Backend permanently failed, probing stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Run one liveness probe, restarting the backend when it fails
    pub async fn probe(&self) -> SupervisorState {
        let uninitializing = self.health.lock().uninitializing;
        if uninitializing || self.state() == SupervisorState::PermanentlyFailed {
            return self.state();
        }

        let observed_at = Instant::now();
        if self.process.is_alive().await {
            self.note_healthy();
            return self.state();
        }

        self.restart_if_needed(observed_at).await
    }

    /// Restart the backend unless a restart completed after `observed_at`
    pub async fn restart_if_needed(&self, observed_at: Instant) -> SupervisorState {
        let _restart = self.restart_lock.lock().await;

        {
            let health = self.health.lock();
            if health.uninitializing {
                return self.state();
            }
            if health.last_restart.is_some_and(|at| at >= observed_at) {
                debug!("Backend already restarted");
                return self.state();
            }
        }
        if self.state() == SupervisorState::PermanentlyFailed {
            return SupervisorState::PermanentlyFailed;
        }

        let failures = self.health.lock().consecutive_failures;
        if failures >= self.config.max_restarts {
            let reason = format!("backend failed {} times in a row", failures);
            error!("Giving up on the backend: {}", reason);
            self.set_state(SupervisorState::PermanentlyFailed);
            self.gate.stop(StopReason::Permanent(reason.clone()));
            self.reporter.permanent_failure(&reason).await;
            return SupervisorState::PermanentlyFailed;
        }

        warn!(
            "Backend failed its liveness probe, restarting ({}/{})",
            failures + 1,
            self.config.max_restarts
        );
        self.set_state(SupervisorState::Restarting);
        self.gate.hold();

        if let Some(dirs) = &self.artifacts {
            match fresh_dump(&dirs.dump_dir, self.config.dump_max_age()).await {
                Ok(Some(dump)) => self.reporter.crash_report(&dump).await,
                Ok(None) => debug!("No recent crash dump"),
                Err(e) => warn!("Cannot inspect crash dumps: {}", e),
            }
        }

        if let Err(e) = self.process.stop().await {
            warn!("Failed to stop the backend: {}", e);
        }

        if let Some(dirs) = &self.artifacts {
            if let Err(e) = rotate_logs(&dirs.log_dir, self.config.log_retention).await {
                warn!("Failed to rotate backend logs: {}", e);
            }
            if let Err(e) = prune_dumps(&dirs.dump_dir, self.config.dump_retention).await {
                warn!("Failed to prune crash dumps: {}", e);
            }
        }

        let started = self.process.start().await;
        {
            let mut health = self.health.lock();
            health.consecutive_failures += 1;
            health.last_restart = Some(Instant::now());
        }

        match started {
            Ok(()) => {
                self.set_state(SupervisorState::Alive);
                let generation = self.gate.open();
                info!("Backend restarted (generation {})", generation);
                SupervisorState::Alive
            }
            Err(e) => {
                warn!("Backend restart failed: {}", e);
                SupervisorState::Restarting
            }
        }
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.write() = state;
    }

    fn note_healthy(&self) {
        let mut health = self.health.lock();
        if health.consecutive_failures == 0 {
            return;
        }
        let stable = health
            .last_restart
            .is_none_or(|at| at.elapsed() >= self.config.stable_period());
        if stable {
            info!(
                "Backend stable for {:?}, clearing {} failures",
                self.config.stable_period(),
                health.consecutive_failures
            );
            health.consecutive_failures = 0;
        }
    }
}

#[async_trait]
impl FailureOracle for CrashSupervisor {
    async fn has_server_failed(&self, since: Instant) -> bool {
        let (restarted, uninitializing) = {
            let health = self.health.lock();
            (
                health.last_restart.is_some_and(|at| at >= since),
                health.uninitializing,
            )
        };
        if restarted {
            return true;
        }

        match self.state() {
            SupervisorState::PermanentlyFailed | SupervisorState::Restarting => return true,
            SupervisorState::Alive => {}
        }

        if uninitializing {
            return false;
        }

        // No restart yet: probe now rather than wait for the next tick
        let observed_at = Instant::now();
        if self.process.is_alive().await {
            return false;
        }
        self.restart_if_needed(observed_at).await;
        true
    }
}

fn rotated_log(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{}.{}", LOG_FILE_NAME, index))
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn rename_if_exists(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Shift `backend.log` to `backend.log.1`, `.1` to `.2` and so on, keeping
/// `retention` rotated files
pub async fn rotate_logs(dir: &Path, retention: usize) -> std::io::Result<()> {
    let current = dir.join(LOG_FILE_NAME);
    if retention == 0 {
        return remove_if_exists(&current).await;
    }

    remove_if_exists(&rotated_log(dir, retention)).await?;
    for index in (1..retention).rev() {
        rename_if_exists(&rotated_log(dir, index), &rotated_log(dir, index + 1)).await?;
    }
    rename_if_exists(&current, &rotated_log(dir, 1)).await
}

/// Dump files in `dir`, newest first
async fn dumps_by_age(dir: &Path) -> std::io::Result<Vec<(PathBuf, SystemTime)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut dumps = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            dumps.push((entry.path(), metadata.modified()?));
        }
    }
    dumps.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(dumps)
}

/// Newest dump younger than `max_age`
pub async fn fresh_dump(dir: &Path, max_age: std::time::Duration) -> std::io::Result<Option<PathBuf>> {
    let now = SystemTime::now();
    let newest = dumps_by_age(dir).await?.into_iter().next();
    Ok(newest.and_then(|(path, modified)| {
        let age = now.duration_since(modified).unwrap_or_default();
        (age < max_age).then_some(path)
    }))
}

/// Delete all but the `retention` newest dumps
pub async fn prune_dumps(dir: &Path, retention: usize) -> std::io::Result<()> {
    for (path, _) in dumps_by_age(dir).await?.into_iter().skip(retention) {
        debug!("Pruning crash dump {}", path.display());
        remove_if_exists(&path).await?;
    }
    Ok(())
}
