//! RPC transport
//!
//! Serializes requests onto the backend channel, holds callers while the
//! backend restarts and retries requests whose channel broke because the
//! backend went down.
//!
//! ## Retry Policy
//!
//! A request that fails at the transport level is retried only when the
//! [`FailureOracle`] confirms the backend failed after the request started,
//! and at most `max_retries` times. Without that confirmation the failure is
//! surfaced immediately. Requests the backend answered with `result: error`
//! are never retried.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use abook_core::config::TransportConfig;
use abook_core::{Error, Result};

use crate::channel::{Connector, RpcChannel};
use crate::protocol::{Command, RpcRequest, RpcResponse};

/// Why the gate was closed for good
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The bridge is shutting down
    Shutdown,
    /// The restart budget is exhausted
    Permanent(String),
}

/// Phase of the transport gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatePhase {
    /// The backend is (re)starting; requests wait
    Starting,
    /// The backend is up; the value is the start generation
    Ready(u64),
    /// No further requests are accepted
    Stopped(StopReason),
}

/// Start/stop condition shared by the transport and the supervisor
///
/// Every [`open`](Self::open) starts a new generation so the transport can
/// tell that the backend behind its channel was replaced.
#[derive(Debug)]
pub struct TransportGate {
    phase: watch::Sender<GatePhase>,
    generation: AtomicU64,
}

impl TransportGate {
    /// Create a gate in the `Starting` phase
    pub fn new() -> Self {
        let (phase, _) = watch::channel(GatePhase::Starting);
        Self {
            phase,
            generation: AtomicU64::new(0),
        }
    }

    /// Current phase
    pub fn phase(&self) -> GatePhase {
        self.phase.borrow().clone()
    }

    /// Hold new requests until the next [`open`](Self::open)
    pub fn hold(&self) {
        self.phase.send_modify(|phase| {
            if !matches!(phase, GatePhase::Stopped(_)) {
                *phase = GatePhase::Starting;
            }
        });
    }

    /// Signal that the backend has started
    ///
    /// Returns the new generation. A stopped gate stays stopped.
    pub fn open(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.phase.send_modify(|phase| {
            if !matches!(phase, GatePhase::Stopped(_)) {
                *phase = GatePhase::Ready(generation);
            }
        });
        generation
    }

    /// Close the gate and release every waiter with an error
    pub fn stop(&self, reason: StopReason) {
        self.phase.send_replace(GatePhase::Stopped(reason));
    }

    /// Wait until the backend is ready
    ///
    /// # Errors
    ///
    /// - `Shutdown` once the gate is stopped for shutdown
    /// - `PermanentFailure` once the restart budget is exhausted
    pub async fn wait_ready(&self) -> Result<u64> {
        let mut phase = self.phase.subscribe();
        loop {
            {
                let current = phase.borrow_and_update();
                match &*current {
                    GatePhase::Ready(generation) => return Ok(*generation),
                    GatePhase::Stopped(StopReason::Shutdown) => return Err(Error::Shutdown),
                    GatePhase::Stopped(StopReason::Permanent(reason)) => {
                        return Err(Error::permanent(reason.clone()));
                    }
                    GatePhase::Starting => {}
                }
            }
            phase.changed().await.map_err(|_| Error::Shutdown)?;
        }
    }
}

impl Default for TransportGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Answers whether the backend failed within a time window
#[async_trait]
pub trait FailureOracle: Send + Sync {
    /// Whether the backend failed (or was restarted) after `since`
    async fn has_server_failed(&self, since: Instant) -> bool;
}

/// Result of a diagnostic dump request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpOutcome {
    /// The backend wrote a dump
    Received {
        /// Location reported by the backend
        path: Option<String>,
    },
    /// The backend did not answer in time
    NotReceived,
}

struct ChannelSlot {
    channel: Option<Box<dyn RpcChannel>>,
    generation: u64,
}

/// Request/response transport to the backend process
pub struct RpcTransport {
    connector: Arc<dyn Connector>,
    slot: Mutex<ChannelSlot>,
    gate: Arc<TransportGate>,
    oracle: Arc<dyn FailureOracle>,
    max_retries: usize,
    dump_timeout: Duration,
    client_endpoint: Option<String>,
}

impl RpcTransport {
    /// Create a transport
    ///
    /// # Parameters
    ///
    /// - `connector`: Opens channels to the backend
    /// - `gate`: Start/stop condition shared with the supervisor
    /// - `oracle`: Confirms backend failures before a retry
    /// - `config`: Retry budget and dump timeout
    pub fn new(
        connector: Arc<dyn Connector>,
        gate: Arc<TransportGate>,
        oracle: Arc<dyn FailureOracle>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            connector,
            slot: Mutex::new(ChannelSlot {
                channel: None,
                generation: 0,
            }),
            gate,
            oracle,
            max_retries: config.max_retries,
            dump_timeout: config.dump_timeout(),
            client_endpoint: None,
        }
    }

    /// Announce `endpoint` with `client/start` on every new connection
    pub fn with_client_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.client_endpoint = Some(endpoint.into());
        self
    }

    /// Override the dump timeout
    pub fn with_dump_timeout(mut self, timeout: Duration) -> Self {
        self.dump_timeout = timeout;
        self
    }

    /// Shared gate
    pub fn gate(&self) -> &Arc<TransportGate> {
        &self.gate
    }

    /// Send a command and return the extra fields of its success response
    ///
    /// # Errors
    ///
    /// - `RequestFailed`: the backend answered `result: error`
    /// - `TransportFailure`: the channel broke and no backend failure
    ///   explains it, or the retry budget ran out
    /// - `PermanentFailure` / `Shutdown`: the gate is stopped
    pub async fn request(&self, command: Command, data: Value) -> Result<Map<String, Value>> {
        let started = Instant::now();
        let request = RpcRequest::new(command, data);
        let mut retries = 0;

        loop {
            match self.attempt(&request).await {
                Ok(response) => return response.into_result(command),
                Err(Error::TransportFailure(reason)) => {
                    if retries >= self.max_retries {
                        warn!(
                            "{} failed after {} retries: {}",
                            command, retries, reason
                        );
                        return Err(Error::TransportFailure(reason));
                    }
                    if !self.oracle.has_server_failed(started).await {
                        debug!("{} failed with the backend healthy: {}", command, reason);
                        return Err(Error::TransportFailure(reason));
                    }
                    retries += 1;
                    warn!(
                        "{} interrupted by a backend failure ({}); retry {}/{}",
                        command, reason, retries, self.max_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask the backend to exit
    ///
    /// A broken channel or a backend that is not running counts as success:
    /// the backend is already gone.
    pub async fn quit(&self) -> Result<()> {
        if !matches!(self.gate.phase(), GatePhase::Ready(_)) {
            debug!("Backend not running, nothing to quit");
            return Ok(());
        }

        match self.attempt(&RpcRequest::new(Command::Quit, json!({}))).await {
            Ok(response) => response.into_result(Command::Quit).map(|_| ()),
            Err(Error::TransportFailure(reason)) => {
                debug!("Channel already broken on quit: {}", reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Request a diagnostic dump
    ///
    /// Never retried. Gives up after the dump timeout and reports
    /// [`DumpOutcome::NotReceived`].
    pub async fn dump(&self) -> Result<DumpOutcome> {
        let request = RpcRequest::new(Command::Dump, json!({}));
        match tokio::time::timeout(self.dump_timeout, self.attempt(&request)).await {
            Err(_) => {
                warn!("No dump received within {:?}", self.dump_timeout);
                Ok(DumpOutcome::NotReceived)
            }
            Ok(Err(Error::TransportFailure(reason))) => {
                warn!("Dump request failed: {}", reason);
                Ok(DumpOutcome::NotReceived)
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(response)) => {
                let extra = response.into_result(Command::Dump)?;
                let path = extra.get("path").and_then(Value::as_str).map(String::from);
                info!("Backend wrote a dump: {:?}", path);
                Ok(DumpOutcome::Received { path })
            }
        }
    }

    /// Stop accepting requests and close the channel
    ///
    /// Callers waiting for the backend to start are released with
    /// `Shutdown`.
    pub fn stop(&self) {
        self.gate.stop(StopReason::Shutdown);
        if let Ok(mut slot) = self.slot.try_lock() {
            slot.channel = None;
        }
    }

    /// One exchange, with no retry
    async fn attempt(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let generation = self.gate.wait_ready().await?;
        self.exchange_at(generation, request).await
    }

    /// Exchange on the channel of `generation` or a later one
    ///
    /// A caller that observed an older generation uses the current channel;
    /// the slot generation only moves forward.
    async fn exchange_at(&self, generation: u64, request: &RpcRequest) -> Result<RpcResponse> {
        let mut slot = self.slot.lock().await;

        if generation > slot.generation {
            if slot.channel.take().is_some() {
                debug!("Backend restarted, dropping the old channel");
            }
            slot.generation = generation;
        }

        // Taken out for the exchange: a failed or abandoned exchange leaves
        // the slot empty and the next request reconnects.
        let mut channel = match slot.channel.take() {
            Some(channel) => channel,
            None => self.connect().await?,
        };

        let response = channel.exchange(request).await?;
        slot.channel = Some(channel);
        Ok(response)
    }

    async fn connect(&self) -> Result<Box<dyn RpcChannel>> {
        let mut channel = self.connector.connect().await?;
        if let Some(endpoint) = &self.client_endpoint {
            let handshake = RpcRequest::new(Command::ClientStart, json!({ "endpoint": endpoint }));
            channel
                .exchange(&handshake)
                .await?
                .into_result(Command::ClientStart)?;
            debug!("Announced inbound endpoint {}", endpoint);
        }
        Ok(channel)
    }
}
