//! Wire protocol
//!
//! Every message is one JSON object on its own line.
//!
//! ```text
//! request  = {"command": "/props/get", "data": {...}}
//! response = {"result": "success" | "error", "reason"?: "...", ...extra}
//! ```

use abook_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Commands exchanged with the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Create a record (outbound) or report a created record (inbound)
    ContactAdd,
    /// Report a modified record (inbound)
    ContactUpdate,
    /// Delete a record (outbound) or report a deleted record (inbound)
    ContactDelete,
    /// Read properties of a record
    PropsGet,
    /// Write one property of a record
    PropsSet,
    /// Enumerate record ids
    Query,
    /// Identifier of the default contacts folder
    GetDefaultContactsFolder,
    /// Whether two record ids name the same record
    CompareIds,
    /// Ask the backend to write a diagnostic dump
    Dump,
    /// Ask the backend to exit
    Quit,
    /// Announce the endpoint inbound notifications are delivered to
    ClientStart,
    /// Native store availability (inbound)
    MapiStatus,
}

impl Command {
    /// Every command
    pub const ALL: [Command; 12] = [
        Command::ContactAdd,
        Command::ContactUpdate,
        Command::ContactDelete,
        Command::PropsGet,
        Command::PropsSet,
        Command::Query,
        Command::GetDefaultContactsFolder,
        Command::CompareIds,
        Command::Dump,
        Command::Quit,
        Command::ClientStart,
        Command::MapiStatus,
    ];

    /// Command path as sent on the wire
    pub fn path(self) -> &'static str {
        match self {
            Command::ContactAdd => "/contact/add",
            Command::ContactUpdate => "/contact/update",
            Command::ContactDelete => "/contact/delete",
            Command::PropsGet => "/props/get",
            Command::PropsSet => "/props/set",
            Command::Query => "/query",
            Command::GetDefaultContactsFolder => "/getdefaultcontactsfolder",
            Command::CompareIds => "/compareids",
            Command::Dump => "/dump",
            Command::Quit => "/quit",
            Command::ClientStart => "/client/start",
            Command::MapiStatus => "/mapi/status",
        }
    }

    /// Parse a command path
    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.path() == path)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// A request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Command path
    pub command: String,
    /// Command arguments
    #[serde(default)]
    pub data: Value,
}

impl RpcRequest {
    /// Create a request
    pub fn new(command: Command, data: Value) -> Self {
        Self {
            command: command.path().to_string(),
            data,
        }
    }

    /// Parsed command, if known
    pub fn command(&self) -> Option<Command> {
        Command::from_path(&self.command)
    }
}

/// Outcome field of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcResult {
    Success,
    Error,
}

/// A response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Whether the command succeeded
    pub result: RpcResult,
    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Command-specific fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RpcResponse {
    /// A bare success response
    pub fn success() -> Self {
        Self {
            result: RpcResult::Success,
            reason: None,
            extra: Map::new(),
        }
    }

    /// A success response carrying one extra field
    pub fn success_with(key: &str, value: Value) -> Self {
        let mut response = Self::success();
        response.extra.insert(key.to_string(), value);
        response
    }

    /// An error response
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            result: RpcResult::Error,
            reason: Some(reason.into()),
            extra: Map::new(),
        }
    }

    /// Extra fields of a successful response
    ///
    /// # Errors
    ///
    /// `RequestFailed` when the backend answered with `result: error`.
    pub fn into_result(self, command: Command) -> Result<Map<String, Value>> {
        match self.result {
            RpcResult::Success => Ok(self.extra),
            RpcResult::Error => Err(Error::request_failed(
                command.path(),
                self.reason.unwrap_or_else(|| "no reason given".to_string()),
            )),
        }
    }
}

/// Serialize a message as one line, newline included
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line into a message
///
/// Malformed input is a transport failure: the peer is not speaking the
/// protocol.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| Error::transport(format!("malformed message: {}", e)))
}
