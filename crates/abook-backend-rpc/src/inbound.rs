//! Inbound notification listener
//!
//! The backend connects back to this listener (announced through
//! `client/start`) and reports native changes and store availability:
//!
//! - `contact/add`, `contact/update`, `contact/delete` with `{"id": ...}`
//! - `mapi/status` with `{"status": true | false}`
//!
//! Every request is answered on the same connection.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use abook_core::model::{ChangeKind, NativeChange};
use abook_core::Result;

use crate::protocol::{Command, RpcRequest, RpcResponse, decode_line, encode_line};

/// Loopback listener for backend notifications
pub struct InboundListener {
    endpoint: String,
    changes: broadcast::Sender<NativeChange>,
    store_available: Arc<AtomicBool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InboundListener {
    /// Bind to an ephemeral loopback port and start accepting connections
    ///
    /// `capacity` bounds the change backlog of slow subscribers.
    pub async fn bind(capacity: usize) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = listener.local_addr()?.to_string();
        let (changes, _) = broadcast::channel(capacity.max(1));
        let store_available = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(accept_loop(
            listener,
            changes.clone(),
            Arc::clone(&store_available),
            shutdown_rx,
        ));

        info!("Listening for backend notifications on {}", endpoint);
        Ok(Self {
            endpoint,
            changes,
            store_available,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Address the backend connects to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Receive changes reported after this call
    pub fn subscribe(&self) -> broadcast::Receiver<NativeChange> {
        self.changes.subscribe()
    }

    /// Last availability the backend reported for the native store
    pub fn store_available(&self) -> bool {
        self.store_available.load(Ordering::SeqCst)
    }

    /// Stop accepting and close every connection
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for InboundListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    changes: broadcast::Sender<NativeChange>,
    store_available: Arc<AtomicBool>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Backend connected from {}", peer);
                    connections.spawn(serve_connection(
                        stream,
                        changes.clone(),
                        Arc::clone(&store_available),
                    ));
                }
                Err(e) => warn!("Failed to accept backend connection: {}", e),
            },
        }
    }
    connections.shutdown().await;
    debug!("Inbound listener stopped");
}

async fn serve_connection(
    stream: TcpStream,
    changes: broadcast::Sender<NativeChange>,
    store_available: Arc<AtomicBool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Backend notification channel failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match decode_line::<RpcRequest>(&line) {
            Ok(request) => handle_request(&request, &changes, &store_available),
            Err(e) => RpcResponse::error(e.to_string()),
        };
        let written = match encode_line(&response) {
            Ok(reply) => writer.write_all(reply.as_bytes()).await,
            Err(e) => {
                warn!("Cannot encode notification reply: {}", e);
                break;
            }
        };
        if let Err(e) = written {
            warn!("Cannot answer backend notification: {}", e);
            break;
        }
    }
}

fn handle_request(
    request: &RpcRequest,
    changes: &broadcast::Sender<NativeChange>,
    store_available: &AtomicBool,
) -> RpcResponse {
    let Some(command) = request.command() else {
        return RpcResponse::error(format!("unknown command {}", request.command));
    };

    let kind = match command {
        Command::ContactAdd => ChangeKind::Inserted,
        Command::ContactUpdate => ChangeKind::Updated,
        Command::ContactDelete => ChangeKind::Deleted,
        Command::MapiStatus => {
            let Some(status) = request.data.get("status").and_then(Value::as_bool) else {
                return RpcResponse::error("missing status");
            };
            if store_available.swap(status, Ordering::SeqCst) != status {
                if status {
                    info!("Native store available");
                } else {
                    warn!("Native store unavailable");
                }
            }
            return RpcResponse::success();
        }
        other => {
            return RpcResponse::error(format!("{} is not accepted on the notification channel", other));
        }
    };

    let Some(id) = request.data.get("id").and_then(Value::as_str) else {
        return RpcResponse::error(format!("{} without id", command));
    };
    debug!("Native change {:?} for {}", kind, id);
    // No subscriber yet is not an error: nothing is watching
    let _ = changes.send(NativeChange::new(id, kind));
    RpcResponse::success()
}
