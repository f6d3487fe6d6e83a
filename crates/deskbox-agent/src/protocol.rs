//! JSON-RPC 2.0 protocol types for deskbox-agent.
//!
//! Request and response types for JSON-RPC 2.0 over TCP, plus method params.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// JSON-RPC 2.0 standard error codes, plus the deskbox-specific ones.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The sandbox id is not known to this agent.
    pub const SESSION_NOT_FOUND: i32 = -32001;
    /// The agent refused to provision a desktop.
    pub const PROVISION_FAILED: i32 = -32002;
    /// The desktop session logged out or crashed.
    pub const SURFACE_RESET: i32 = -32003;
    /// No stream is running for the sandbox.
    pub const STREAM_NOT_STARTED: i32 = -32004;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Protocol version, must be "2.0".
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// Request identifier.
    pub id: u64,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct Response {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier (matches request).
    pub id: u64,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

/// Mouse button as sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    /// xdotool button number.
    pub fn xdotool_button(self) -> &'static str {
        match self {
            Self::Left => "1",
            Self::Middle => "2",
            Self::Right => "3",
        }
    }
}

/// Scroll direction as sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
}

impl ScrollDirection {
    /// xdotool wheel button number.
    pub fn xdotool_button(self) -> &'static str {
        match self {
            Self::Up => "4",
            Self::Down => "5",
        }
    }
}

// Parameter types for various methods

/// Parameters for `create_session`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionParams {
    pub client_token: Uuid,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub region: Option<String>,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub display: String,
    pub sandbox_timeout_secs: u64,
    #[serde(default)]
    pub enable_stream_auth: bool,
}

fn default_template() -> String {
    "desktop".to_string()
}

/// Parameters for `cancel_create`.
#[derive(Debug, Deserialize)]
pub struct CancelCreateParams {
    pub client_token: Uuid,
}

/// Parameters carrying only the sandbox id.
#[derive(Debug, Deserialize)]
pub struct SandboxParams {
    pub sandbox_id: String,
}

/// Parameters for `move_mouse`.
#[derive(Debug, Deserialize)]
pub struct MoveMouseParams {
    pub sandbox_id: String,
    pub x: u32,
    pub y: u32,
}

/// Parameters for `scroll`.
#[derive(Debug, Deserialize)]
pub struct ScrollParams {
    pub sandbox_id: String,
    #[serde(default)]
    pub direction: ScrollDirection,
    #[serde(default = "default_scroll_amount")]
    pub amount: u32,
}

fn default_scroll_amount() -> u32 {
    1
}

/// Parameters for `mouse_press` and `mouse_release`.
#[derive(Debug, Deserialize)]
pub struct ButtonParams {
    pub sandbox_id: String,
    #[serde(default)]
    pub button: MouseButton,
}

/// Parameters for `type_text`.
#[derive(Debug, Deserialize)]
pub struct TypeTextParams {
    pub sandbox_id: String,
    pub text: String,
    #[serde(default = "default_type_delay")]
    pub delay_ms: u32,
}

fn default_type_delay() -> u32 {
    75
}

/// Parameters for `press_keys`.
#[derive(Debug, Deserialize)]
pub struct PressKeysParams {
    pub sandbox_id: String,
    pub keys: Vec<String>,
}

/// Parameters for `open`.
#[derive(Debug, Deserialize)]
pub struct OpenParams {
    pub sandbox_id: String,
    pub target: String,
}

/// Parameters for `start_stream`.
#[derive(Debug, Deserialize)]
pub struct StartStreamParams {
    pub sandbox_id: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub token_ttl_secs: u64,
}
