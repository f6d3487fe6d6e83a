//! Read-only queries against the remote desktop.
//!
//! Every result is a point-in-time snapshot of remote state; nothing is
//! cached between calls. Queries are retried on transport failures.

use crate::error::{DeskError, Result};
use crate::protocol::{Command, ScreenshotReply};
use crate::retry::RetryPolicy;
use crate::session::{CallOptions, SandboxId, SessionRegistry, SessionSlot};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Screen dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

/// Pointer position in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: u32,
    pub y: u32,
}

/// How a screenshot is handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScreenshotEncoding {
    /// Raw PNG bytes.
    #[default]
    Bytes,
    /// Standard base64 of the PNG bytes.
    Base64,
}

/// A single full-frame PNG capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screenshot {
    Bytes(Bytes),
    Base64(String),
}

impl Screenshot {
    fn decode(reply: ScreenshotReply, encoding: ScreenshotEncoding) -> Result<Self> {
        match encoding {
            ScreenshotEncoding::Base64 => Ok(Self::Base64(reply.data)),
            ScreenshotEncoding::Bytes => STANDARD
                .decode(reply.data.as_bytes())
                .map(|raw| Self::Bytes(Bytes::from(raw)))
                .map_err(|e| DeskError::Protocol(format!("screenshot is not valid base64: {e}"))),
        }
    }

    /// The PNG bytes, decoding if needed.
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Base64(text) => STANDARD
                .decode(text.as_bytes())
                .map(Bytes::from)
                .map_err(|e| DeskError::Protocol(format!("screenshot is not valid base64: {e}"))),
        }
    }

    /// The base64 text, encoding if needed.
    pub fn to_base64(&self) -> String {
        match self {
            Self::Bytes(bytes) => STANDARD.encode(bytes),
            Self::Base64(text) => text.clone(),
        }
    }

    pub fn encoding(&self) -> ScreenshotEncoding {
        match self {
            Self::Bytes(_) => ScreenshotEncoding::Bytes,
            Self::Base64(_) => ScreenshotEncoding::Base64,
        }
    }
}

/// Screen size, cursor position and screenshot queries.
#[derive(Clone)]
pub struct DisplayQuery {
    registry: SessionRegistry,
    options: CallOptions,
}

impl DisplayQuery {
    pub(crate) fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            options: CallOptions::default(),
        }
    }

    /// Use `timeout` for each attempt made through this handle.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Abort queries made through this handle when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.options.cancel = Some(token);
        self
    }

    async fn query(&self, slot: &SessionSlot, command: Command) -> Result<Value> {
        let policy = RetryPolicy::for_command(&command, slot.config().query_attempts);
        let label = command.method();
        policy
            .run(label, move || slot.call(command.clone(), &self.options))
            .await
    }

    /// Current screen dimensions.
    pub async fn screen_size(&self, id: &SandboxId) -> Result<ScreenSize> {
        let slot = self.registry.active(id)?;
        let value = self
            .query(&slot, Command::GetScreenSize { sandbox_id: id.clone() })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Current pointer position.
    ///
    /// Not ordered against input commands in flight; use
    /// [`InputDispatcher::get_cursor_position`](crate::InputDispatcher::get_cursor_position)
    /// to read the position after previously submitted moves.
    pub async fn cursor_position(&self, id: &SandboxId) -> Result<CursorPosition> {
        let slot = self.registry.active(id)?;
        let value = self
            .query(&slot, Command::GetCursorPosition { sandbox_id: id.clone() })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Capture the full screen as PNG in the requested encoding.
    pub async fn take_screenshot(&self, id: &SandboxId, encoding: ScreenshotEncoding) -> Result<Screenshot> {
        let slot = self.registry.active(id)?;
        let value = self
            .query(&slot, Command::TakeScreenshot { sandbox_id: id.clone() })
            .await?;
        let reply: ScreenshotReply = serde_json::from_value(value)?;
        tracing::debug!(sandbox_id = %id, encoded_len = reply.data.len(), "Screenshot captured");
        Screenshot::decode(reply, encoding)
    }

    /// Capture the full screen as raw PNG bytes.
    pub async fn screenshot(&self, id: &SandboxId) -> Result<Bytes> {
        self.take_screenshot(id, ScreenshotEncoding::Bytes)
            .await?
            .to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    fn reply() -> ScreenshotReply {
        ScreenshotReply {
            data: STANDARD.encode(PNG_MAGIC),
        }
    }

    #[test]
    fn test_decode_bytes() {
        let shot = Screenshot::decode(reply(), ScreenshotEncoding::Bytes).unwrap();
        assert_eq!(shot, Screenshot::Bytes(Bytes::from_static(PNG_MAGIC)));
        assert_eq!(shot.encoding(), ScreenshotEncoding::Bytes);
    }

    #[test]
    fn test_encodings_carry_same_frame() {
        let raw = Screenshot::decode(reply(), ScreenshotEncoding::Bytes).unwrap();
        let text = Screenshot::decode(reply(), ScreenshotEncoding::Base64).unwrap();
        assert_eq!(raw.to_base64(), text.to_base64());
        assert_eq!(text.to_bytes().unwrap(), raw.to_bytes().unwrap());
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        let bad = ScreenshotReply {
            data: "***".to_string(),
        };
        let result = Screenshot::decode(bad, ScreenshotEncoding::Bytes);
        assert!(matches!(result, Err(DeskError::Protocol(_))));
    }

    #[test]
    fn test_screen_size_parses() {
        let size: ScreenSize = serde_json::from_str(r#"{"width":1024,"height":768}"#).unwrap();
        assert_eq!(size, ScreenSize { width: 1024, height: 768 });
    }
}
