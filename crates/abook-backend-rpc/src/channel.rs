//! Local byte channel to the backend process
//!
//! One request occupies the channel at a time: a line is written, then one
//! line is read back. Any I/O problem, an unexpected end of stream or a
//! line that is not a response is a `TransportFailure`.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::trace;

use abook_core::{Error, Result};

use crate::protocol::{RpcRequest, RpcResponse, decode_line, encode_line};

/// A connected request/response channel
#[async_trait]
pub trait RpcChannel: Send {
    /// Send one request and read its response
    async fn exchange(&mut self, request: &RpcRequest) -> Result<RpcResponse>;
}

/// Opens channels to the backend
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the backend
    async fn connect(&self) -> Result<Box<dyn RpcChannel>>;
}

/// Newline-delimited JSON over a TCP loopback connection
pub struct TcpChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TcpChannel {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

#[async_trait]
impl RpcChannel for TcpChannel {
    async fn exchange(&mut self, request: &RpcRequest) -> Result<RpcResponse> {
        let line = encode_line(request)?;
        trace!("-> {}", line.trim_end());

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::transport(format!("write {} failed: {}", request.command, e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::transport(format!("flush {} failed: {}", request.command, e)))?;

        let mut response = String::new();
        let read = self
            .reader
            .read_line(&mut response)
            .await
            .map_err(|e| Error::transport(format!("read {} failed: {}", request.command, e)))?;
        if read == 0 {
            return Err(Error::transport(format!(
                "channel closed before {} was answered",
                request.command
            )));
        }

        trace!("<- {}", response.trim_end());
        decode_line(&response)
    }
}

/// Connects [`TcpChannel`]s to a fixed endpoint
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: String,
}

impl TcpConnector {
    /// Create a connector for `endpoint` (e.g. "127.0.0.1:5432")
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Target endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn RpcChannel>> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(io_failure(format!("cannot connect to {}", self.endpoint)))?;
        stream
            .set_nodelay(true)
            .map_err(io_failure(format!("cannot configure {}", self.endpoint)))?;
        Ok(Box::new(TcpChannel::new(stream)))
    }
}

/// Map an I/O error on the channel to a `TransportFailure`
fn io_failure(context: String) -> impl FnOnce(std::io::Error) -> Error {
    move |e| Error::transport(format!("{}: {}", context, e))
}
