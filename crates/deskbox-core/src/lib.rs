//! # deskbox-core
//!
//! Client for remote desktop sandboxes.
//!
//! This crate manages the lifecycle of remote virtual-desktop sessions over
//! a JSON-RPC control channel, drives pointer and keyboard input against
//! them, captures screenshots, and controls a live video stream bound to
//! each session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   deskbox-core (client)                  │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ SessionManager  │────▶│  HashMap<SandboxId,      │   │
//! │  │   - create()    │     │           SessionSlot>   │   │
//! │  │   - refresh()   │     └──────────────────────────┘   │
//! │  │   - kill()      │                  ▲                 │
//! │  └─────────────────┘                  │ lookup by id    │
//! │                                       │                 │
//! │  ┌─────────────────┐ ┌────────────┐ ┌─────────────────┐ │
//! │  │ InputDispatcher │ │  Display   │ │ StreamController│ │
//! │  │  (FIFO lane)    │ │   Query    │ │ start/stop/url  │ │
//! │  └─────────────────┘ └────────────┘ └─────────────────┘ │
//! │           │                │                 │          │
//! │           ▼                ▼                 ▼          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  ControlClient  │────▶│  TCP, one per session    │   │
//! │  │  - send()       │     │  (line-delimited JSON)   │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  deskbox-agent (remote)                  │
//! │          Xvfb + xfce4 + xdotool + x11vnc/noVNC           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use deskbox_core::{ClientConfig, SessionConfig, SessionManager};
//!
//! # async fn example() -> deskbox_core::Result<()> {
//! let manager = SessionManager::connect(ClientConfig::new("127.0.0.1:4870"));
//!
//! let config = SessionConfig::builder()
//!     .enable_stream_auth(true)
//!     .resolution(1280, 800)
//!     .build()?;
//! let session = manager.create(config).await?;
//! let id = session.id();
//!
//! // Watch the desktop from a browser
//! let stream = manager.stream().start(id).await?;
//! println!("stream: {}", stream.url().unwrap_or_default());
//!
//! // Drive it
//! let input = manager.input();
//! input.move_mouse(id, 100, 100).await?;
//! input.left_click(id).await?;
//! input.write(id, "hello").await?;
//! input.press(id, ["ctrl", "s"]).await?;
//!
//! // Look at it
//! let size = manager.display().screen_size(id).await?;
//! let png = manager.display().screenshot(id).await?;
//! println!("{}x{} frame, {} bytes", size.width, size.height, png.len());
//!
//! manager.kill(id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Session Lifecycle**: Create, refresh after a desktop reset, and kill sandboxes
//! - **Ordered Input**: Per-session FIFO delivery of mouse and keyboard commands
//! - **Display Queries**: Screen size, cursor position and screenshots, retried on transport errors
//! - **Live Stream**: noVNC stream URLs with optional per-start auth tokens
//! - **Orphan-Safe Create**: Provisioning survives caller cancellation and is reconciled remotely

mod client;
mod config;
mod display;
mod error;
mod input;
mod manager;
mod protocol;
mod retry;
mod session;
mod stream;
mod transport;

pub use client::{ControlClient, TcpConnector};
pub use config::{ClientConfig, SessionConfig, SessionConfigBuilder};
pub use display::{CursorPosition, DisplayQuery, ScreenSize, Screenshot, ScreenshotEncoding};
pub use error::{DeskError, Result, TransportError};
pub use input::{InputCommand, InputDispatcher};
pub use manager::SessionManager;
pub use protocol::{error_codes, Command, CreateSessionParams, MouseButton, RpcError, RpcResponse, ScrollDirection};
pub use retry::RetryPolicy;
pub use session::{SandboxId, SandboxSession, SessionState};
pub use stream::{StreamController, StreamHandle, StreamStatus, StreamToken, UrlOptions};
pub use transport::{Connector, Transport};
