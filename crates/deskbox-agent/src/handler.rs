//! Request handler for deskbox-agent.
//!
//! Routes JSON-RPC requests to the desktop host.

use crate::desktop::DesktopHost;
use crate::error::DesktopError;
use crate::protocol::{
    error_codes, ButtonParams, CancelCreateParams, CreateSessionParams, MouseButton,
    MoveMouseParams, OpenParams, PressKeysParams, Request, Response, SandboxParams, ScrollParams,
    StartStreamParams, TypeTextParams,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Methods that drive the pointer or keyboard. These run in arrival order
/// per connection.
const INPUT_METHODS: &[&str] = &[
    "move_mouse",
    "left_click",
    "right_click",
    "middle_click",
    "double_click",
    "scroll",
    "mouse_press",
    "mouse_release",
    "type_text",
    "press_keys",
    "open",
    "get_cursor_position",
];

/// Whether `method` must be ordered with other input on its connection.
pub fn is_input_method(method: &str) -> bool {
    INPUT_METHODS.contains(&method)
}

#[derive(Debug, Error)]
enum HandlerError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(#[from] serde_json::Error),

    #[error(transparent)]
    Desktop(#[from] DesktopError),
}

impl HandlerError {
    fn code(&self) -> i32 {
        match self {
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => error_codes::INVALID_PARAMS,
            Self::Desktop(e) => e.code(),
        }
    }
}

fn params<T: DeserializeOwned>(value: Value) -> Result<T, HandlerError> {
    Ok(serde_json::from_value(value)?)
}

fn ok() -> Value {
    json!({"ok": true})
}

/// Dispatches requests against a shared [`DesktopHost`].
#[derive(Clone)]
pub struct Handler {
    host: Arc<DesktopHost>,
}

impl Handler {
    pub fn new(host: Arc<DesktopHost>) -> Self {
        Self { host }
    }

    /// Handle a JSON-RPC request and return a response.
    pub async fn handle_request(&self, req: Request) -> Response {
        debug!(method = %req.method, id = req.id, "handling request");
        trace!(params = ?req.params, "request params");

        match self.dispatch(&req.method, req.params).await {
            Ok(result) => {
                debug!(id = req.id, "request succeeded");
                trace!(result = ?result, "response result");
                Response::success(req.id, result)
            }
            Err(e) => {
                match &e {
                    HandlerError::MethodNotFound(_) | HandlerError::InvalidParams(_) => {
                        warn!(id = req.id, method = %req.method, error = %e, "rejected request")
                    }
                    HandlerError::Desktop(_) => {
                        debug!(id = req.id, method = %req.method, error = %e, "request failed")
                    }
                }
                Response::error(req.id, e.code(), e.to_string())
            }
        }
    }

    async fn dispatch(&self, method: &str, raw: Value) -> Result<Value, HandlerError> {
        let host = &self.host;
        let result = match method {
            "ping" => json!({"pong": true}),

            "create_session" => {
                let p: CreateSessionParams = params(raw)?;
                let sandbox_id = host.create_session(p).await?;
                json!({"sandbox_id": sandbox_id})
            }

            "cancel_create" => {
                let p: CancelCreateParams = params(raw)?;
                host.cancel_create(p.client_token).await?;
                json!({"cancelled": true})
            }

            "refresh" => {
                let p: SandboxParams = params(raw)?;
                host.refresh(&p.sandbox_id).await?;
                ok()
            }

            "kill" => {
                let p: SandboxParams = params(raw)?;
                host.kill(&p.sandbox_id).await?;
                ok()
            }

            "move_mouse" => {
                let p: MoveMouseParams = params(raw)?;
                host.get(&p.sandbox_id).await?.move_mouse(p.x, p.y).await?;
                ok()
            }

            "left_click" | "right_click" | "middle_click" => {
                let p: SandboxParams = params(raw)?;
                let button = match method {
                    "right_click" => MouseButton::Right,
                    "middle_click" => MouseButton::Middle,
                    _ => MouseButton::Left,
                };
                host.get(&p.sandbox_id).await?.click(button).await?;
                ok()
            }

            "double_click" => {
                let p: SandboxParams = params(raw)?;
                host.get(&p.sandbox_id).await?.double_click().await?;
                ok()
            }

            "scroll" => {
                let p: ScrollParams = params(raw)?;
                host.get(&p.sandbox_id)
                    .await?
                    .scroll(p.direction, p.amount)
                    .await?;
                ok()
            }

            "mouse_press" => {
                let p: ButtonParams = params(raw)?;
                host.get(&p.sandbox_id).await?.mouse_press(p.button).await?;
                ok()
            }

            "mouse_release" => {
                let p: ButtonParams = params(raw)?;
                host.get(&p.sandbox_id).await?.mouse_release(p.button).await?;
                ok()
            }

            "type_text" => {
                let p: TypeTextParams = params(raw)?;
                debug!(text_len = p.text.len(), delay_ms = p.delay_ms, "typing text");
                host.get(&p.sandbox_id)
                    .await?
                    .type_text(&p.text, p.delay_ms)
                    .await?;
                ok()
            }

            "press_keys" => {
                let p: PressKeysParams = params(raw)?;
                host.get(&p.sandbox_id).await?.press_keys(&p.keys).await?;
                ok()
            }

            "open" => {
                let p: OpenParams = params(raw)?;
                host.get(&p.sandbox_id).await?.open(&p.target).await?;
                ok()
            }

            "get_cursor_position" => {
                let p: SandboxParams = params(raw)?;
                let (x, y) = host.get(&p.sandbox_id).await?.cursor_position().await?;
                json!({"x": x, "y": y})
            }

            "get_screen_size" => {
                let p: SandboxParams = params(raw)?;
                let (width, height) = host.get(&p.sandbox_id).await?.screen_size().await?;
                json!({"width": width, "height": height})
            }

            "take_screenshot" => {
                let p: SandboxParams = params(raw)?;
                let data = host.get(&p.sandbox_id).await?.screenshot().await?;
                json!({"data": data})
            }

            "start_stream" => {
                let p: StartStreamParams = params(raw)?;
                let desktop = host.get(&p.sandbox_id).await?;
                let url = desktop
                    .start_stream(
                        host.config(),
                        p.auth_token.as_deref(),
                        Duration::from_secs(p.token_ttl_secs),
                    )
                    .await?;
                json!({"url": url})
            }

            "stop_stream" => {
                let p: SandboxParams = params(raw)?;
                if !host.get(&p.sandbox_id).await?.stop_stream().await {
                    return Err(DesktopError::StreamNotStarted(p.sandbox_id).into());
                }
                ok()
            }

            "get_stream_url" => {
                let p: SandboxParams = params(raw)?;
                let url = host.get(&p.sandbox_id).await?.stream_url().await?;
                json!({"url": url})
            }

            other => return Err(HandlerError::MethodNotFound(other.to_string())),
        };
        Ok(result)
    }
}
