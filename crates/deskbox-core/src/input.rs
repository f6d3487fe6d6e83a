//! Pointer and keyboard input.
//!
//! Commands for one session travel through a FIFO lane: each is sent only
//! after the previous one was answered, so the remote applies them in the
//! order they were submitted. Clicks carry no coordinates and act wherever
//! the preceding move left the pointer.

use crate::display::CursorPosition;
use crate::error::{DeskError, Result};
use crate::protocol::{Command, MouseButton, ScrollDirection};
use crate::retry::RetryPolicy;
use crate::session::{CallOptions, SandboxId, SessionRegistry, SessionSlot};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Characters sent per `type_text` call.
const TYPE_CHUNK_CHARS: usize = 25;

/// Delay between keystrokes when typing, in milliseconds.
const TYPE_DELAY_MS: u32 = 75;

/// A single input action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    MoveMouse { x: u32, y: u32 },
    LeftClick,
    RightClick,
    MiddleClick,
    DoubleClick,
    Scroll { direction: ScrollDirection, amount: u32 },
    MousePress(MouseButton),
    MouseRelease(MouseButton),
    /// Press at `from`, move to `to`, release. Left button.
    Drag { from: (u32, u32), to: (u32, u32) },
    /// Type text as keystrokes.
    Write(String),
    /// Press a key or a chord, e.g. `["ctrl", "c"]`.
    Press(Vec<String>),
    /// Open a file or URL with the desktop's default handler.
    Open(String),
    QueryCursorPosition,
}

impl InputCommand {
    /// The wire command for a single-step input. `None` for composite
    /// commands, which the dispatcher expands.
    fn to_wire(&self, sandbox_id: &SandboxId) -> Option<Command> {
        let sandbox_id = sandbox_id.clone();
        let command = match self {
            Self::MoveMouse { x, y } => Command::MoveMouse { sandbox_id, x: *x, y: *y },
            Self::LeftClick => Command::LeftClick { sandbox_id },
            Self::RightClick => Command::RightClick { sandbox_id },
            Self::MiddleClick => Command::MiddleClick { sandbox_id },
            Self::DoubleClick => Command::DoubleClick { sandbox_id },
            Self::Scroll { direction, amount } => Command::Scroll {
                sandbox_id,
                direction: *direction,
                amount: *amount,
            },
            Self::MousePress(button) => Command::MousePress { sandbox_id, button: *button },
            Self::MouseRelease(button) => Command::MouseRelease { sandbox_id, button: *button },
            Self::Press(keys) => Command::PressKeys {
                sandbox_id,
                keys: keys.clone(),
            },
            Self::Open(target) => Command::Open {
                sandbox_id,
                target: target.clone(),
            },
            Self::QueryCursorPosition => Command::GetCursorPosition { sandbox_id },
            Self::Drag { .. } | Self::Write(_) => return None,
        };
        Some(command)
    }
}

/// Split `text` into chunks of at most `size` characters.
fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Sends input to sessions.
#[derive(Clone)]
pub struct InputDispatcher {
    registry: SessionRegistry,
    options: CallOptions,
}

impl InputDispatcher {
    pub(crate) fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            options: CallOptions::default(),
        }
    }

    /// Use `timeout` for each command sent through this dispatcher.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Abort commands sent through this dispatcher when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.options.cancel = Some(token);
        self
    }

    /// Send one input command in submission order.
    ///
    /// Returns the pointer position for [`InputCommand::QueryCursorPosition`]
    /// and `None` for everything else.
    ///
    /// # Errors
    ///
    /// [`DeskError::InvalidSessionState`](crate::DeskError::InvalidSessionState)
    /// if the session is not `Active` when the command reaches the front of
    /// the lane. Nothing is sent in that case.
    pub async fn dispatch(&self, id: &SandboxId, command: InputCommand) -> Result<Option<CursorPosition>> {
        let slot = self.registry.active(id)?;
        let _lane = slot.input_lane.lock().await;
        slot.ensure_active()?;

        match command {
            InputCommand::Drag { from, to } => {
                self.drag_locked(&slot, from, to).await?;
                Ok(None)
            }
            InputCommand::Write(text) => {
                self.write_locked(&slot, &text).await?;
                Ok(None)
            }
            InputCommand::QueryCursorPosition => {
                let command = Command::GetCursorPosition { sandbox_id: id.clone() };
                let policy = RetryPolicy::for_command(&command, slot.config().query_attempts);
                let value = policy
                    .run(command.method(), || slot.call(command.clone(), &self.options))
                    .await?;
                Ok(Some(serde_json::from_value(value)?))
            }
            other => {
                let wire = other
                    .to_wire(id)
                    .ok_or_else(|| DeskError::Protocol(format!("cannot send {other:?} directly")))?;
                self.send_locked(&slot, wire).await?;
                Ok(None)
            }
        }
    }

    async fn send_locked(&self, slot: &SessionSlot, wire: Command) -> Result<()> {
        tracing::debug!(sandbox_id = %slot.id(), method = wire.method(), "Sending input");
        slot.call(wire, &self.options).await?;
        Ok(())
    }

    async fn drag_locked(&self, slot: &SessionSlot, from: (u32, u32), to: (u32, u32)) -> Result<()> {
        let sandbox_id = slot.id().clone();
        self.send_locked(slot, Command::MoveMouse { sandbox_id: sandbox_id.clone(), x: from.0, y: from.1 })
            .await?;
        self.send_locked(slot, Command::MousePress { sandbox_id: sandbox_id.clone(), button: MouseButton::Left })
            .await?;

        let moved = self
            .send_locked(slot, Command::MoveMouse { sandbox_id: sandbox_id.clone(), x: to.0, y: to.1 })
            .await;
        // Release even if the second move failed so the button is not left held.
        let released = self
            .send_locked(slot, Command::MouseRelease { sandbox_id, button: MouseButton::Left })
            .await;
        if moved.is_err() && released.is_err() {
            tracing::warn!(sandbox_id = %slot.id(), "Drag aborted; left button may still be held");
        }
        moved.and(released)
    }

    async fn write_locked(&self, slot: &SessionSlot, text: &str) -> Result<()> {
        for chunk in chunk_text(text, TYPE_CHUNK_CHARS) {
            let command = Command::TypeText {
                sandbox_id: slot.id().clone(),
                text: chunk,
                delay_ms: TYPE_DELAY_MS,
            };
            slot.call(command, &self.options).await?;
        }
        Ok(())
    }

    /// Move the pointer to `(x, y)`.
    pub async fn move_mouse(&self, id: &SandboxId, x: u32, y: u32) -> Result<()> {
        self.dispatch(id, InputCommand::MoveMouse { x, y }).await?;
        Ok(())
    }

    /// Left click at the current pointer position.
    pub async fn left_click(&self, id: &SandboxId) -> Result<()> {
        self.dispatch(id, InputCommand::LeftClick).await?;
        Ok(())
    }

    /// Right click at the current pointer position.
    pub async fn right_click(&self, id: &SandboxId) -> Result<()> {
        self.dispatch(id, InputCommand::RightClick).await?;
        Ok(())
    }

    pub async fn middle_click(&self, id: &SandboxId) -> Result<()> {
        self.dispatch(id, InputCommand::MiddleClick).await?;
        Ok(())
    }

    pub async fn double_click(&self, id: &SandboxId) -> Result<()> {
        self.dispatch(id, InputCommand::DoubleClick).await?;
        Ok(())
    }

    /// Scroll the wheel `amount` notches.
    pub async fn scroll(&self, id: &SandboxId, direction: ScrollDirection, amount: u32) -> Result<()> {
        self.dispatch(id, InputCommand::Scroll { direction, amount }).await?;
        Ok(())
    }

    pub async fn mouse_press(&self, id: &SandboxId, button: MouseButton) -> Result<()> {
        self.dispatch(id, InputCommand::MousePress(button)).await?;
        Ok(())
    }

    pub async fn mouse_release(&self, id: &SandboxId, button: MouseButton) -> Result<()> {
        self.dispatch(id, InputCommand::MouseRelease(button)).await?;
        Ok(())
    }

    /// Drag with the left button from `from` to `to`.
    ///
    /// The whole gesture holds the lane, so no other input interleaves.
    pub async fn drag(&self, id: &SandboxId, from: (u32, u32), to: (u32, u32)) -> Result<()> {
        self.dispatch(id, InputCommand::Drag { from, to }).await?;
        Ok(())
    }

    /// Type `text`, sent in chunks with a fixed keystroke delay.
    pub async fn write(&self, id: &SandboxId, text: &str) -> Result<()> {
        self.dispatch(id, InputCommand::Write(text.to_string())).await?;
        Ok(())
    }

    /// Press a key or chord. Common aliases such as `enter` or `ctrl` are
    /// mapped to key names by the remote.
    pub async fn press<I, S>(&self, id: &SandboxId, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys.into_iter().map(Into::into).collect();
        self.dispatch(id, InputCommand::Press(keys)).await?;
        Ok(())
    }

    /// Open a file path or URL on the desktop.
    pub async fn open(&self, id: &SandboxId, target: &str) -> Result<()> {
        self.dispatch(id, InputCommand::Open(target.to_string())).await?;
        Ok(())
    }

    /// Pointer position after every previously submitted input command.
    pub async fn get_cursor_position(&self, id: &SandboxId) -> Result<CursorPosition> {
        let position = self.dispatch(id, InputCommand::QueryCursorPosition).await?;
        position.ok_or_else(|| DeskError::Protocol("cursor query returned no position".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_text() {
        let text = "a".repeat(60);
        let chunks = chunk_text(&text, 25);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 25);
        assert_eq!(chunks[2].len(), 10);
        assert!(chunk_text("", 25).is_empty());
    }

    #[test]
    fn test_chunk_text_splits_on_chars() {
        let chunks = chunk_text("héllo wörld", 4);
        assert_eq!(chunks, vec!["héll", "o wö", "rld"]);
    }

    #[test]
    fn test_to_wire() {
        let id = SandboxId::from("sbx");
        assert_eq!(
            InputCommand::MoveMouse { x: 3, y: 4 }.to_wire(&id),
            Some(Command::MoveMouse {
                sandbox_id: id.clone(),
                x: 3,
                y: 4
            })
        );
        assert_eq!(
            InputCommand::Press(vec!["ctrl".into(), "c".into()])
                .to_wire(&id)
                .map(|c| c.method()),
            Some("press_keys")
        );
        assert!(InputCommand::Write("hi".into()).to_wire(&id).is_none());
    }
}
