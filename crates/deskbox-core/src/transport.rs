//! Transport abstraction for the control channel.
//!
//! The session layer only talks to the remote through [`Transport`], so the
//! wire client can be swapped for an in-process fake in tests.

use crate::error::Result;
use crate::protocol::Command;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// A request/response channel to the sandbox control endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a command and wait up to `timeout` for its result.
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::Transport`](crate::DeskError::Transport) for
    /// channel failures (a timeout is [`TransportError::Timeout`](crate::TransportError::Timeout)),
    /// or [`DeskError::Remote`](crate::DeskError::Remote) when the endpoint
    /// answered with an error object.
    async fn send(&self, command: &Command, timeout: Duration) -> Result<Value>;

    /// Release the channel. Outstanding requests fail with `Closed`.
    fn close(&self);

    /// Whether the channel can still carry requests.
    fn is_open(&self) -> bool;
}

/// Opens transports. Each session owns the connection it was created on.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new control channel.
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}
