//! `NativeStore` over the RPC transport

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use abook_core::model::{NativeRecordId, PropertyId, PropertyValue};
use abook_core::traits::{ChangeStream, NativeStore};
use abook_core::{Error, Result};

use crate::inbound::InboundListener;
use crate::protocol::Command;
use crate::supervisor::{BackendProcess, CrashSupervisor};
use crate::transport::{DumpOutcome, RpcTransport};

/// Native store living in a supervised backend process
pub struct RpcNativeStore {
    transport: Arc<RpcTransport>,
    supervisor: Arc<CrashSupervisor>,
    process: Arc<dyn BackendProcess>,
    inbound: InboundListener,
    probe_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl RpcNativeStore {
    /// Assemble the store and start probing the backend
    pub fn new(
        transport: Arc<RpcTransport>,
        supervisor: Arc<CrashSupervisor>,
        process: Arc<dyn BackendProcess>,
        inbound: InboundListener,
    ) -> Self {
        let (probe_tx, probe_rx) = oneshot::channel();
        let probing = Arc::clone(&supervisor);
        tokio::spawn(async move {
            probing.run_with_shutdown(probe_rx).await;
        });

        Self {
            transport,
            supervisor,
            process,
            inbound,
            probe_shutdown: Mutex::new(Some(probe_tx)),
        }
    }

    /// Supervisor watching the backend
    pub fn supervisor(&self) -> &Arc<CrashSupervisor> {
        &self.supervisor
    }

    /// Ask the backend for a diagnostic dump
    pub async fn dump(&self) -> Result<DumpOutcome> {
        self.transport.dump().await
    }

    /// Last availability the backend reported for the native store
    pub fn store_available(&self) -> bool {
        self.inbound.store_available()
    }

    /// Endpoint the backend delivers notifications to
    pub fn inbound_endpoint(&self) -> &str {
        self.inbound.endpoint()
    }
}

fn field<'a>(extra: &'a Map<String, Value>, command: Command, name: &str) -> Result<&'a Value> {
    extra
        .get(name)
        .ok_or_else(|| Error::transport(format!("{} response without {}", command, name)))
}

/// `Ok(false)` for a refused request, the error otherwise
fn refused(result: Result<Map<String, Value>>, id: &NativeRecordId) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(Error::RequestFailed { command, reason }) => {
            warn!("{} refused for {}: {}", command, id, reason);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl NativeStore for RpcNativeStore {
    async fn query(
        &self,
        filter: &str,
        on_record: &mut (dyn FnMut(NativeRecordId) + Send),
    ) -> Result<usize> {
        let extra = self
            .transport
            .request(Command::Query, json!({ "filter": filter }))
            .await?;
        let ids = field(&extra, Command::Query, "ids")?
            .as_array()
            .ok_or_else(|| Error::transport("/query ids is not a list"))?;

        let mut count = 0;
        for id in ids {
            match id.as_str() {
                Some(id) => {
                    on_record(NativeRecordId::new(id));
                    count += 1;
                }
                None => warn!("Ignoring malformed record id {}", id),
            }
        }
        debug!("Query '{}' reported {} records", filter, count);
        Ok(count)
    }

    async fn get_properties(
        &self,
        id: &NativeRecordId,
        properties: &[PropertyId],
    ) -> Result<Vec<PropertyValue>> {
        let names: Vec<&str> = properties.iter().map(|p| p.wire_name()).collect();
        let extra = self
            .transport
            .request(Command::PropsGet, json!({ "id": id, "props": names }))
            .await?;

        let values: Vec<PropertyValue> =
            serde_json::from_value(field(&extra, Command::PropsGet, "props")?.clone())
                .map_err(|e| Error::transport(format!("malformed properties of {}: {}", id, e)))?;
        if values.len() != properties.len() {
            return Err(Error::transport(format!(
                "asked {} properties of {}, got {}",
                properties.len(),
                id,
                values.len()
            )));
        }
        Ok(values)
    }

    async fn set_property(
        &self,
        id: &NativeRecordId,
        property: PropertyId,
        value: &PropertyValue,
    ) -> Result<bool> {
        let result = self
            .transport
            .request(
                Command::PropsSet,
                json!({ "id": id, "prop": property.wire_name(), "value": value }),
            )
            .await;
        refused(result, id)
    }

    async fn create_record(&self) -> Result<Option<NativeRecordId>> {
        match self.transport.request(Command::ContactAdd, json!({})).await {
            Ok(extra) => match extra.get("id").and_then(Value::as_str) {
                Some(id) => Ok(Some(NativeRecordId::new(id))),
                None => {
                    warn!("Backend created a record without reporting its id");
                    Ok(None)
                }
            },
            Err(Error::RequestFailed { reason, .. }) => {
                warn!("Backend refused to create a record: {}", reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_record(&self, id: &NativeRecordId) -> Result<bool> {
        let result = self
            .transport
            .request(Command::ContactDelete, json!({ "id": id }))
            .await;
        refused(result, id)
    }

    fn watch(&self) -> ChangeStream {
        let stream = BroadcastStream::new(self.inbound.subscribe()).filter_map(|change| match change {
            Ok(change) => Some(change),
            Err(e) => {
                warn!("Change stream lagged: {}", e);
                None
            }
        });
        Box::pin(stream)
    }

    async fn compare_ids(&self, a: &NativeRecordId, b: &NativeRecordId) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        let extra = self
            .transport
            .request(Command::CompareIds, json!({ "id1": a, "id2": b }))
            .await?;
        field(&extra, Command::CompareIds, "equal")?
            .as_bool()
            .ok_or_else(|| Error::transport("/compareids equal is not a boolean"))
    }

    async fn default_folder(&self) -> Result<Option<String>> {
        let extra = self
            .transport
            .request(Command::GetDefaultContactsFolder, json!({}))
            .await?;
        Ok(extra.get("folder").and_then(Value::as_str).map(String::from))
    }

    async fn shutdown(&self) -> Result<()> {
        self.supervisor.begin_shutdown();
        if let Some(tx) = self.probe_shutdown.lock().take() {
            let _ = tx.send(());
        }

        if let Err(e) = self.transport.quit().await {
            warn!("Backend did not acknowledge quit: {}", e);
        }
        self.transport.stop();

        if let Err(e) = self.process.stop().await {
            warn!("Failed to stop the backend: {}", e);
        }
        self.inbound.shutdown().await;
        info!("RPC backend shut down");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "rpc"
    }
}
