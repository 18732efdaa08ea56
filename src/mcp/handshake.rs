//! Purpose: Track the initialize/initialized exchange and gate methods on it.
//! Exports: `HandshakeState`, `Handshake`, `ServerMetadata`, `InitializeResult` and capability types.
//! Role: Owned by the dispatcher; consulted for every request and notification in arrival order.
//! Invariants: Only `initialize` and `ping` are legal before `Ready`.
//! Invariants: The reply always advertises the server's own protocol version, never the client's.
//! Invariants: `Ready` is terminal for the lifetime of the process.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::JsonRpcError;

pub const MCP_PROTOCOL_VERSION: &str = "2025-11-25";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Uninitialized,
    Initializing,
    Ready,
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    client: Option<ClientInfo>,
    requested_version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Uninitialized,
            client: None,
            requested_version: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn client(&self) -> Option<&ClientInfo> {
        self.client.as_ref()
    }

    pub fn requested_version(&self) -> Option<&str> {
        self.requested_version.as_deref()
    }

    /// Reject anything but the pre-handshake methods until the peer is `Ready`.
    pub fn check(&self, method: &str) -> Result<(), JsonRpcError> {
        if self.state == HandshakeState::Ready || matches!(method, "initialize" | "ping") {
            return Ok(());
        }
        Err(JsonRpcError::not_initialized(format!(
            "server not initialized: `{method}` requires a completed initialize handshake"
        )))
    }

    /// Handle `initialize`. Re-initializing after `Ready` is answered but does not regress state.
    pub fn begin(&mut self, params: Option<&Value>) {
        if let Some(params) = params {
            self.requested_version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            self.client = params
                .get("clientInfo")
                .cloned()
                .and_then(|info| serde_json::from_value(info).ok());
        }
        if self.state == HandshakeState::Uninitialized {
            self.state = HandshakeState::Initializing;
        }
    }

    /// Handle `notifications/initialized`; returns whether the state advanced.
    pub fn complete(&mut self) -> bool {
        match self.state {
            HandshakeState::Initializing => {
                self.state = HandshakeState::Ready;
                true
            }
            HandshakeState::Uninitialized | HandshakeState::Ready => false,
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerMetadata {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

impl Default for ServerMetadata {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
        }
    }
}

impl ServerMetadata {
    pub fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: self.protocol_version.clone(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: self.name.clone(),
                version: self.version.clone(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub tools: ToolsCapability,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}
