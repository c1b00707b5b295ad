//! Test doubles for the RPC backend contract tests
//!
//! - [`ScriptedBackend`]: in-process channel/connector with failure injection
//! - [`MockOracle`]: failure oracle with a fixed answer
//! - [`MockProcess`]: backend process whose liveness the test controls
//! - [`RecordingReporter`]: diagnostics reporter that records its calls
//! - [`FakeServer`]: a TCP backend speaking the wire protocol

#![allow(dead_code)]

use abook_backend_rpc::protocol::{
    Command, RpcRequest, RpcResponse, decode_line, encode_line,
};
use abook_backend_rpc::{
    BackendProcess, Connector, CrashSupervisor, DiagnosticsReporter, FailureOracle, RpcChannel,
    RpcTransport, TransportGate,
};
use abook_core::config::{SupervisorConfig, TransportConfig};
use abook_core::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Scripted channel
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptState {
    exchanges: Vec<String>,
    connects: usize,
    break_next: usize,
    responses: HashMap<String, RpcResponse>,
    hanging: HashSet<String>,
}

/// Connector whose channels answer from a script
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` exchanges fail with a broken channel
    pub fn break_next(&self, n: usize) {
        self.state.lock().unwrap().break_next = n;
    }

    /// Answer `command` with `response`
    pub fn respond(&self, command: Command, response: RpcResponse) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(command.path().to_string(), response);
    }

    /// Never answer `command`
    pub fn hang(&self, command: Command) {
        self.state
            .lock()
            .unwrap()
            .hanging
            .insert(command.path().to_string());
    }

    /// Command paths of every exchange, failed ones included
    pub fn exchanges(&self) -> Vec<String> {
        self.state.lock().unwrap().exchanges.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }
}

struct ScriptedChannel {
    state: Arc<Mutex<ScriptState>>,
}

#[async_trait]
impl RpcChannel for ScriptedChannel {
    async fn exchange(&mut self, request: &RpcRequest) -> Result<RpcResponse> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.exchanges.push(request.command.clone());
            if state.hanging.contains(&request.command) {
                None
            } else if state.break_next > 0 {
                state.break_next -= 1;
                Some(Err(Error::transport("broken pipe")))
            } else {
                Some(Ok(state
                    .responses
                    .get(&request.command)
                    .cloned()
                    .unwrap_or_else(RpcResponse::success)))
            }
        };

        match outcome {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Connector for ScriptedBackend {
    async fn connect(&self) -> Result<Box<dyn RpcChannel>> {
        self.state.lock().unwrap().connects += 1;
        Ok(Box::new(ScriptedChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

// ---------------------------------------------------------------------------
// Failure oracle
// ---------------------------------------------------------------------------

/// Oracle with a fixed answer that counts its calls
pub struct MockOracle {
    failed: AtomicBool,
    calls: AtomicUsize,
}

impl MockOracle {
    pub fn new(failed: bool) -> Arc<Self> {
        Arc::new(Self {
            failed: AtomicBool::new(failed),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FailureOracle for MockOracle {
    async fn has_server_failed(&self, _since: Instant) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.failed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Backend process
// ---------------------------------------------------------------------------

/// Process double: alive until killed, alive again after a start
#[derive(Default)]
pub struct MockProcess {
    alive: AtomicBool,
    refuse_start: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockProcess {
    /// A process that is already running
    pub fn running() -> Arc<Self> {
        let process = Self::default();
        process.alive.store(true, Ordering::SeqCst);
        Arc::new(process)
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Later starts fail and leave the process dead
    pub fn refuse_start(&self) {
        self.refuse_start.store(true, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendProcess for MockProcess {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.refuse_start.load(Ordering::SeqCst) {
            return Err(Error::crashed("backend exited during startup"));
        }
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Diagnostics reporter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingReporter {
    crash_reports: Mutex<Vec<PathBuf>>,
    permanent_failures: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn crash_reports(&self) -> Vec<PathBuf> {
        self.crash_reports.lock().unwrap().clone()
    }

    pub fn permanent_failures(&self) -> Vec<String> {
        self.permanent_failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiagnosticsReporter for RecordingReporter {
    async fn crash_report(&self, dump: &Path) {
        self.crash_reports.lock().unwrap().push(dump.to_path_buf());
    }

    async fn permanent_failure(&self, reason: &str) {
        self.permanent_failures.lock().unwrap().push(reason.to_string());
    }
}

// ---------------------------------------------------------------------------
// Assembly helpers
// ---------------------------------------------------------------------------

/// Supervisor settings with a fast probe
pub fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        probe_interval_ms: 20,
        ..SupervisorConfig::default()
    }
}

/// An open gate (generation 1)
pub fn open_gate() -> Arc<TransportGate> {
    let gate = Arc::new(TransportGate::new());
    gate.open();
    gate
}

/// Transport over a scripted backend with a fixed oracle
pub fn scripted_transport(
    backend: &ScriptedBackend,
    gate: &Arc<TransportGate>,
    oracle: Arc<dyn FailureOracle>,
) -> RpcTransport {
    RpcTransport::new(
        Arc::new(backend.clone()),
        Arc::clone(gate),
        oracle,
        &TransportConfig::default(),
    )
}

/// Supervisor over a mock process
pub fn supervisor(
    process: &Arc<MockProcess>,
    gate: &Arc<TransportGate>,
    config: &SupervisorConfig,
) -> Arc<CrashSupervisor> {
    Arc::new(CrashSupervisor::new(
        Arc::clone(process) as Arc<dyn BackendProcess>,
        Arc::clone(gate),
        config,
    ))
}

// ---------------------------------------------------------------------------
// TCP backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    records: BTreeMap<String, Map<String, Value>>,
    next_id: usize,
    commands: Vec<String>,
    read_only: HashSet<String>,
    client_endpoint: Option<String>,
}

/// Backend double serving the wire protocol over loopback TCP
pub struct FakeServer {
    endpoint: String,
    state: Arc<Mutex<ServerState>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(ServerState::default()));

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&state)));
                }
            })
        };

        Self {
            endpoint,
            state,
            task,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Store a record; `props` maps wire names to values
    pub fn put(&self, id: &str, props: Value) {
        let props = props.as_object().cloned().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .records
            .insert(id.to_string(), props);
    }

    pub fn record(&self, id: &str) -> Option<Map<String, Value>> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    pub fn read_only(&self, prop: &str) {
        self.state
            .lock()
            .unwrap()
            .read_only
            .insert(prop.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn client_endpoint(&self) -> Option<String> {
        self.state.lock().unwrap().client_endpoint.clone()
    }

    /// Deliver a notification to the announced client endpoint
    pub async fn notify(&self, command: Command, data: Value) -> RpcResponse {
        let endpoint = self
            .client_endpoint()
            .expect("client/start was not received");
        let stream = TcpStream::connect(endpoint).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let line = encode_line(&RpcRequest::new(command, data)).unwrap();
        writer.write_all(line.as_bytes()).await.unwrap();

        let mut reply = String::new();
        BufReader::new(reader).read_line(&mut reply).await.unwrap();
        decode_line(&reply).unwrap()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: RpcRequest = match decode_line(&line) {
            Ok(request) => request,
            Err(_) => break,
        };
        let response = handle(&state, &request);
        let reply = encode_line(&response).unwrap();
        if writer.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
        if request.command() == Some(Command::Quit) {
            break;
        }
    }
}

fn handle(state: &Mutex<ServerState>, request: &RpcRequest) -> RpcResponse {
    let mut state = state.lock().unwrap();
    state.commands.push(request.command.clone());
    let data = &request.data;
    let id = data.get("id").and_then(Value::as_str).map(String::from);

    match request.command() {
        Some(Command::ClientStart) => {
            state.client_endpoint = data.get("endpoint").and_then(Value::as_str).map(String::from);
            RpcResponse::success()
        }
        Some(Command::Query) => {
            let ids: Vec<Value> = state.records.keys().map(|id| json!(id)).collect();
            RpcResponse::success_with("ids", Value::Array(ids))
        }
        Some(Command::PropsGet) => {
            let Some(record) = id.as_deref().and_then(|id| state.records.get(id)) else {
                return RpcResponse::error("no such record");
            };
            let values: Vec<Value> = data
                .get("props")
                .and_then(Value::as_array)
                .map(|names| {
                    names
                        .iter()
                        .map(|name| {
                            name.as_str()
                                .and_then(|name| record.get(name))
                                .cloned()
                                .unwrap_or(Value::Null)
                        })
                        .collect()
                })
                .unwrap_or_default();
            RpcResponse::success_with("props", Value::Array(values))
        }
        Some(Command::PropsSet) => {
            let prop = data.get("prop").and_then(Value::as_str).unwrap_or_default().to_string();
            if state.read_only.contains(&prop) {
                return RpcResponse::error(format!("{} is read-only", prop));
            }
            let value = data.get("value").cloned().unwrap_or(Value::Null);
            let record = match id {
                Some(id) => state.records.get_mut(&id),
                None => None,
            };
            let Some(record) = record else {
                return RpcResponse::error("no such record");
            };
            if value.is_null() {
                record.remove(&prop);
            } else {
                record.insert(prop, value);
            }
            RpcResponse::success()
        }
        Some(Command::ContactAdd) => {
            state.next_id += 1;
            let id = format!("new{}", state.next_id);
            state.records.insert(id.clone(), Map::new());
            RpcResponse::success_with("id", json!(id))
        }
        Some(Command::ContactDelete) => match id.and_then(|id| state.records.remove(&id)) {
            Some(_) => RpcResponse::success(),
            None => RpcResponse::error("no such record"),
        },
        Some(Command::CompareIds) => {
            let a = data.get("id1").and_then(Value::as_str).unwrap_or_default();
            let b = data.get("id2").and_then(Value::as_str).unwrap_or_default();
            RpcResponse::success_with("equal", json!(a.eq_ignore_ascii_case(b)))
        }
        Some(Command::GetDefaultContactsFolder) => {
            RpcResponse::success_with("folder", json!("Contacts"))
        }
        Some(Command::Dump) => RpcResponse::success_with("path", json!("/tmp/backend.dmp")),
        Some(Command::Quit) => RpcResponse::success(),
        _ => RpcResponse::error(format!("unsupported {}", request.command)),
    }
}
