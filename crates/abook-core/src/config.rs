//! Configuration types for the address book bridge
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Native store backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Local contact cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Notification coalescing settings
    #[serde(default)]
    pub coalescer: CoalescerConfig,

    /// Synchronization controller settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Crash supervisor settings (RPC backend only)
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// RPC transport settings (RPC backend only)
    #[serde(default)]
    pub transport: TransportConfig,

    /// Exposed slots of multi-valued native properties
    #[serde(default)]
    pub layout: SlotLayout,
}

impl BridgeConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.backend.validate()?;
        self.cache.validate()?;

        if self.coalescer.quiet_period_ms == 0 {
            return Err(crate::Error::config("Coalescer quiet period must be > 0"));
        }
        if self.sync.drain_poll_ms == 0 {
            return Err(crate::Error::config("Drain poll interval must be > 0"));
        }
        if self.sync.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        if self.supervisor.probe_interval_ms == 0 {
            return Err(crate::Error::config("Liveness probe interval must be > 0"));
        }
        if self.transport.dump_timeout_secs == 0 {
            return Err(crate::Error::config("Dump timeout must be > 0"));
        }
        if self.layout.email_slots == 0 {
            return Err(crate::Error::config("At least one email slot must be exposed"));
        }

        Ok(())
    }
}

/// Native store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Process-isolated backend reached over a local RPC channel
    Rpc {
        /// Backend executable
        executable: PathBuf,
        /// Extra arguments for the executable
        #[serde(default)]
        args: Vec<String>,
        /// Local endpoint the backend listens on (e.g. "127.0.0.1:5432")
        endpoint: String,
        /// Directory receiving the backend's rotated log files
        log_dir: PathBuf,
        /// Directory the backend writes crash dumps to
        dump_dir: PathBuf,
    },

    /// In-process native address book
    Local,

    /// Custom backend
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl BackendConfig {
    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            BackendConfig::Rpc {
                executable,
                endpoint,
                ..
            } => {
                if executable.as_os_str().is_empty() {
                    return Err(crate::Error::config("RPC backend executable cannot be empty"));
                }
                if endpoint.is_empty() {
                    return Err(crate::Error::config("RPC backend endpoint cannot be empty"));
                }
                Ok(())
            }
            BackendConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("Custom backend factory cannot be empty"));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom backend config cannot be null"));
                }
                Ok(())
            }
            BackendConfig::Local => Ok(()),
        }
    }

    /// Get the backend type name
    pub fn type_name(&self) -> &str {
        match self {
            BackendConfig::Rpc { .. } => "rpc",
            BackendConfig::Local => "local",
            BackendConfig::Custom { factory, .. } => factory,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local
    }
}

/// Contact cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheConfig {
    /// File-based cache
    File {
        /// Path to the cache file
        path: PathBuf,
    },

    /// In-memory cache (not persistent)
    #[default]
    Memory,

    /// Custom cache
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl CacheConfig {
    /// Validate the cache configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            CacheConfig::File { path } if path.as_os_str().is_empty() => {
                Err(crate::Error::config("Contact cache path cannot be empty"))
            }
            CacheConfig::Custom { factory, .. } if factory.is_empty() => {
                Err(crate::Error::config("Custom cache factory cannot be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Get the cache type name
    pub fn type_name(&self) -> &str {
        match self {
            CacheConfig::File { .. } => "file",
            CacheConfig::Memory => "memory",
            CacheConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Notification coalescer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// Quiet period before the pending queue is drained
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
}

impl CoalescerConfig {
    /// Quiet period as a duration
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
        }
    }
}

/// Synchronization controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Poll interval while waiting for the queue to drain after the full query
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,

    /// Capacity of the sync event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Filter passed to the native store's enumerate-all query
    #[serde(default)]
    pub query_filter: String,
}

impl SyncConfig {
    /// Drain poll interval as a duration
    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drain_poll_ms: default_drain_poll_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            query_filter: String::new(),
        }
    }
}

/// Crash supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Liveness probe interval
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Restarts allowed before the backend is declared permanently failed
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Rotated backend log files to keep
    #[serde(default = "default_retention")]
    pub log_retention: usize,

    /// Crash dump files to keep
    #[serde(default = "default_retention")]
    pub dump_retention: usize,

    /// Crash dumps older than this are unrelated to the current failure
    #[serde(default = "default_dump_max_age_secs")]
    pub dump_max_age_secs: u64,

    /// Healthy time after a restart that clears the failure counter
    #[serde(default = "default_stable_period_secs")]
    pub stable_period_secs: u64,
}

impl SupervisorConfig {
    /// Probe interval as a duration
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Maximum crash dump age as a duration
    pub fn dump_max_age(&self) -> Duration {
        Duration::from_secs(self.dump_max_age_secs)
    }

    /// Stable period as a duration
    pub fn stable_period(&self) -> Duration {
        Duration::from_secs(self.stable_period_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            max_restarts: default_max_restarts(),
            log_retention: default_retention(),
            dump_retention: default_retention(),
            dump_max_age_secs: default_dump_max_age_secs(),
            stable_period_secs: default_stable_period_secs(),
        }
    }
}

/// RPC transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Retries of a request whose channel broke while the backend restarted
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Time after which a diagnostic dump request is abandoned
    #[serde(default = "default_dump_timeout_secs")]
    pub dump_timeout_secs: u64,
}

impl TransportConfig {
    /// Dump timeout as a duration
    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.dump_timeout_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            dump_timeout_secs: default_dump_timeout_secs(),
        }
    }
}

/// Number of individually addressable slots per multi-valued property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLayout {
    /// Email addresses shown as primary details
    #[serde(default = "default_email_slots")]
    pub email_slots: usize,

    /// Instant messaging addresses shown as primary details
    #[serde(default = "default_im_slots")]
    pub im_slots: usize,
}

impl Default for SlotLayout {
    fn default() -> Self {
        Self {
            email_slots: default_email_slots(),
            im_slots: default_im_slots(),
        }
    }
}

fn default_quiet_period_ms() -> u64 {
    500
}

fn default_drain_poll_ms() -> u64 {
    200
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_max_restarts() -> u32 {
    10
}

fn default_retention() -> usize {
    3
}

fn default_dump_max_age_secs() -> u64 {
    600
}

fn default_stable_period_secs() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_dump_timeout_secs() -> u64 {
    30
}

fn default_email_slots() -> usize {
    2
}

fn default_im_slots() -> usize {
    1
}
