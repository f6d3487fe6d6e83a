//! Wire protocol for the sandbox control channel.
//!
//! Requests are newline-delimited JSON-RPC 2.0 messages. Each [`Command`]
//! serializes to the `method`/`params` pair of a request; the transport adds
//! `jsonrpc` and `id`.

use crate::session::SandboxId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Error codes returned by the control endpoint.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The sandbox id is not known to the remote.
    pub const SESSION_NOT_FOUND: i32 = -32001;
    /// The remote refused to provision a sandbox.
    pub const PROVISION_FAILED: i32 = -32002;
    /// The desktop surface was reset and needs a refresh.
    pub const SURFACE_RESET: i32 = -32003;
    /// No stream is running for the sandbox.
    pub const STREAM_NOT_STARTED: i32 = -32004;
}

/// Mouse button identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// Scroll wheel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
}

/// Parameters for provisioning a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionParams {
    /// Client-generated token identifying this provisioning attempt.
    pub client_token: Uuid,
    pub template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub display: String,
    /// Remote lifetime of the sandbox in seconds.
    pub sandbox_timeout_secs: u64,
    pub enable_stream_auth: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// A typed command for the control endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Command {
    CreateSession(CreateSessionParams),
    CancelCreate { client_token: Uuid },
    Refresh { sandbox_id: SandboxId },
    Kill { sandbox_id: SandboxId },
    MoveMouse { sandbox_id: SandboxId, x: u32, y: u32 },
    LeftClick { sandbox_id: SandboxId },
    RightClick { sandbox_id: SandboxId },
    MiddleClick { sandbox_id: SandboxId },
    DoubleClick { sandbox_id: SandboxId },
    Scroll {
        sandbox_id: SandboxId,
        direction: ScrollDirection,
        amount: u32,
    },
    MousePress { sandbox_id: SandboxId, button: MouseButton },
    MouseRelease { sandbox_id: SandboxId, button: MouseButton },
    TypeText {
        sandbox_id: SandboxId,
        text: String,
        delay_ms: u32,
    },
    PressKeys { sandbox_id: SandboxId, keys: Vec<String> },
    Open { sandbox_id: SandboxId, target: String },
    GetCursorPosition { sandbox_id: SandboxId },
    GetScreenSize { sandbox_id: SandboxId },
    TakeScreenshot { sandbox_id: SandboxId },
    StartStream {
        sandbox_id: SandboxId,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
        token_ttl_secs: u64,
    },
    StopStream { sandbox_id: SandboxId },
    GetStreamUrl { sandbox_id: SandboxId },
    Ping,
}

impl Command {
    /// JSON-RPC method name.
    pub fn method(&self) -> &'static str {
        match self {
            Self::CreateSession(_) => "create_session",
            Self::CancelCreate { .. } => "cancel_create",
            Self::Refresh { .. } => "refresh",
            Self::Kill { .. } => "kill",
            Self::MoveMouse { .. } => "move_mouse",
            Self::LeftClick { .. } => "left_click",
            Self::RightClick { .. } => "right_click",
            Self::MiddleClick { .. } => "middle_click",
            Self::DoubleClick { .. } => "double_click",
            Self::Scroll { .. } => "scroll",
            Self::MousePress { .. } => "mouse_press",
            Self::MouseRelease { .. } => "mouse_release",
            Self::TypeText { .. } => "type_text",
            Self::PressKeys { .. } => "press_keys",
            Self::Open { .. } => "open",
            Self::GetCursorPosition { .. } => "get_cursor_position",
            Self::GetScreenSize { .. } => "get_screen_size",
            Self::TakeScreenshot { .. } => "take_screenshot",
            Self::StartStream { .. } => "start_stream",
            Self::StopStream { .. } => "stop_stream",
            Self::GetStreamUrl { .. } => "get_stream_url",
            Self::Ping => "ping",
        }
    }

    /// The sandbox this command targets, if any.
    pub fn sandbox_id(&self) -> Option<&SandboxId> {
        match self {
            Self::CreateSession(_) | Self::CancelCreate { .. } | Self::Ping => None,
            Self::Refresh { sandbox_id }
            | Self::Kill { sandbox_id }
            | Self::MoveMouse { sandbox_id, .. }
            | Self::LeftClick { sandbox_id }
            | Self::RightClick { sandbox_id }
            | Self::MiddleClick { sandbox_id }
            | Self::DoubleClick { sandbox_id }
            | Self::Scroll { sandbox_id, .. }
            | Self::MousePress { sandbox_id, .. }
            | Self::MouseRelease { sandbox_id, .. }
            | Self::TypeText { sandbox_id, .. }
            | Self::PressKeys { sandbox_id, .. }
            | Self::Open { sandbox_id, .. }
            | Self::GetCursorPosition { sandbox_id }
            | Self::GetScreenSize { sandbox_id }
            | Self::TakeScreenshot { sandbox_id }
            | Self::StartStream { sandbox_id, .. }
            | Self::StopStream { sandbox_id }
            | Self::GetStreamUrl { sandbox_id } => Some(sandbox_id),
        }
    }

    /// Whether re-sending this command cannot change remote state.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::GetCursorPosition { .. }
                | Self::GetScreenSize { .. }
                | Self::TakeScreenshot { .. }
                | Self::GetStreamUrl { .. }
                | Self::Ping
        )
    }

    /// Build the full JSON-RPC request object for this command.
    pub fn to_request(&self, id: u64) -> Result<Value, serde_json::Error> {
        let mut request = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = request {
            map.insert("jsonrpc".into(), Value::from("2.0"));
            map.insert("id".into(), Value::from(id));
        }
        Ok(request)
    }
}

/// JSON-RPC 2.0 response as read off the wire.
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    /// Request identifier (matches request). Absent on some parse errors.
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

// Reply payloads

#[derive(Debug, Deserialize)]
pub(crate) struct CreateSessionReply {
    pub sandbox_id: SandboxId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScreenshotReply {
    /// Base64-encoded PNG.
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamUrlReply {
    pub url: String,
}
