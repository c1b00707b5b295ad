// # RPC Native Store Backend
//
// This crate runs the native address book in a separate, supervised process
// and talks to it over a local newline-delimited JSON channel.
//
// ## Components
//
// - `protocol`: wire messages and command paths
// - `channel`: request/response channel over loopback TCP
// - `transport`: serialized requests, restart gate and bounded retry
// - `supervisor`: liveness probe, restart budget, log rotation, crash dumps
// - `process`: the backend child process
// - `inbound`: listener for change notifications sent by the backend
// - `store`: the `NativeStore` implementation tying it all together
//
// ## Usage
//
// ```rust,ignore
// let registry = BackendRegistry::with_builtin_caches();
// abook_backend_rpc::register(&registry);
// let store = registry.create_store(&config).await?;
// ```

pub mod channel;
pub mod inbound;
pub mod process;
pub mod protocol;
pub mod store;
pub mod supervisor;
pub mod transport;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use abook_core::config::{BackendConfig, BridgeConfig};
use abook_core::traits::{NativeStore, NativeStoreFactory};
use abook_core::{BackendRegistry, Error, Result};

pub use channel::{Connector, RpcChannel, TcpChannel, TcpConnector};
pub use inbound::InboundListener;
pub use process::ChildProcessBackend;
pub use protocol::{Command, RpcRequest, RpcResponse, RpcResult};
pub use store::RpcNativeStore;
pub use supervisor::{
    BackendHealth, BackendProcess, CrashSupervisor, DiagnosticsReporter, LoggingReporter,
    SupervisorState,
};
pub use transport::{DumpOutcome, FailureOracle, GatePhase, RpcTransport, StopReason, TransportGate};

/// Factory for [`RpcNativeStore`]
pub struct RpcNativeStoreFactory;

#[async_trait]
impl NativeStoreFactory for RpcNativeStoreFactory {
    async fn create(&self, config: &BridgeConfig) -> Result<Arc<dyn NativeStore>> {
        let BackendConfig::Rpc {
            executable,
            args,
            endpoint,
            log_dir,
            dump_dir,
        } = &config.backend
        else {
            return Err(Error::config(format!(
                "RPC factory cannot build a '{}' backend",
                config.backend.type_name()
            )));
        };

        let inbound = InboundListener::bind(config.sync.event_channel_capacity).await?;

        let process: Arc<dyn BackendProcess> = Arc::new(ChildProcessBackend::new(
            executable.clone(),
            args.clone(),
            endpoint.clone(),
            log_dir.clone(),
        ));
        process.start().await?;

        let gate = Arc::new(TransportGate::new());
        let supervisor = Arc::new(
            CrashSupervisor::new(Arc::clone(&process), Arc::clone(&gate), &config.supervisor)
                .with_artifacts(log_dir.clone(), dump_dir.clone()),
        );
        let transport = Arc::new(
            RpcTransport::new(
                Arc::new(TcpConnector::new(endpoint.clone())),
                Arc::clone(&gate),
                Arc::clone(&supervisor) as Arc<dyn FailureOracle>,
                &config.transport,
            )
            .with_client_endpoint(inbound.endpoint()),
        );
        gate.open();

        info!("RPC backend {} running on {}", executable.display(), endpoint);
        Ok(Arc::new(RpcNativeStore::new(transport, supervisor, process, inbound)))
    }
}

/// Register the RPC backend under `rpc`
pub fn register(registry: &BackendRegistry) {
    registry.register_store("rpc", Box::new(RpcNativeStoreFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register() {
        let registry = BackendRegistry::new();
        register(&registry);
        assert!(registry.has_store("rpc"));
    }

    #[tokio::test]
    async fn test_factory_rejects_other_backends() {
        let config = BridgeConfig::new();
        let result = RpcNativeStoreFactory.create(&config).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
