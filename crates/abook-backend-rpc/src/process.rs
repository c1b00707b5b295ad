//! Backend child process
//!
//! Spawns the backend executable with its output appended to
//! `log_dir/backend.log` and waits until it listens on its endpoint.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use abook_core::{Error, Result};

use crate::supervisor::{BackendProcess, LOG_FILE_NAME};

/// Environment variable telling the backend where to listen
pub const ENDPOINT_ENV: &str = "ABOOK_BACKEND_ENDPOINT";

/// Time the backend gets to start listening
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

const STARTUP_POLL: Duration = Duration::from_millis(50);

/// Backend executable run as a child process
pub struct ChildProcessBackend {
    executable: PathBuf,
    args: Vec<String>,
    endpoint: String,
    log_dir: PathBuf,
    startup_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl ChildProcessBackend {
    /// Create a backend launcher
    pub fn new(
        executable: impl Into<PathBuf>,
        args: Vec<String>,
        endpoint: impl Into<String>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executable: executable.into(),
            args,
            endpoint: endpoint.into(),
            log_dir: log_dir.into(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            child: Mutex::new(None),
        }
    }

    /// Override the startup timeout
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn spawn(&self) -> Result<Child> {
        std::fs::create_dir_all(&self.log_dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(LOG_FILE_NAME))?;
        let stderr = log.try_clone()?;

        let child = Command::new(&self.executable)
            .args(&self.args)
            .env(ENDPOINT_ENV, &self.endpoint)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::native_store(format!(
                    "cannot start backend {}: {}",
                    self.executable.display(),
                    e
                ))
            })?;
        Ok(child)
    }

    async fn wait_listening(&self, child: &mut Child) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            if TcpStream::connect(&self.endpoint).await.is_ok() {
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::crashed(format!("backend exited during startup ({})", status)));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::crashed(format!(
                    "backend did not listen on {} within {:?}",
                    self.endpoint, self.startup_timeout
                )));
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
    }
}

#[async_trait]
impl BackendProcess for ChildProcessBackend {
    async fn start(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        if let Some(mut old) = slot.take() {
            warn!("Starting the backend while a previous instance exists; killing it");
            let _ = old.kill().await;
        }

        let mut child = self.spawn()?;
        debug!("Backend spawned (pid {:?})", child.id());

        if let Err(e) = self.wait_listening(&mut child).await {
            let _ = child.kill().await;
            return Err(e);
        }

        info!("Backend listening on {}", self.endpoint);
        *slot = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Backend already exited ({})", status);
            return Ok(());
        }
        child.kill().await?;
        debug!("Backend stopped");
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}
