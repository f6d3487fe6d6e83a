//! Error types for deskbox-core.

use crate::session::{SandboxId, SessionState};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for deskbox-core operations.
pub type Result<T> = std::result::Result<T, DeskError>;

/// Failures of the control channel itself.
///
/// These say nothing about the remote sandbox: the request may or may not
/// have reached it.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish a connection to the control endpoint.
    #[error("connection failed: {0}")]
    Connection(String),

    /// No response arrived within the per-call timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was closed while the request was outstanding.
    #[error("connection closed")]
    Closed,

    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during session, input, display and stream operations.
#[derive(Debug, Error)]
pub enum DeskError {
    /// Control channel failure (connection, timeout, closed).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Remote refused to provision a sandbox (capacity, auth).
    #[error("provisioning refused: {0}")]
    Provision(String),

    /// Provisioning timed out and its cancellation could not be confirmed.
    ///
    /// The remote may hold a sandbox created for `client_token`.
    #[error("provisioning for {client_token} timed out and could not be cancelled: {reason}")]
    ProvisionUnconfirmed {
        /// Token sent with the create request.
        client_token: Uuid,
        /// Why the cancellation failed.
        reason: String,
    },

    /// Operation attempted on a session outside the required state.
    #[error("invalid state for {sandbox_id}: expected {expected}, got {actual}")]
    InvalidSessionState {
        /// Session the call targeted.
        sandbox_id: SandboxId,
        /// State the operation requires.
        expected: SessionState,
        /// State the session was in.
        actual: SessionState,
    },

    /// The id was never issued by this session manager.
    #[error("unknown session: {0}")]
    UnknownSession(SandboxId),

    /// Remote no longer recognises the sandbox.
    #[error("sandbox not found on remote: {0}")]
    SessionNotFound(SandboxId),

    /// Remote desktop surface was reset (logout, crash); refresh is required.
    #[error("desktop surface reset for {0}")]
    SurfaceReset(SandboxId),

    /// Stream URL requested before the stream went live.
    #[error("stream not started for {0}")]
    StreamNotStarted(SandboxId),

    /// `start` called while a stream is already starting or live.
    #[error("stream already started for {0}")]
    StreamAlreadyStarted(SandboxId),

    /// Auth key requested for a session created without stream auth.
    #[error("stream auth is not enabled for {0}")]
    StreamAuthDisabled(SandboxId),

    /// Any other JSON-RPC error returned by the remote.
    #[error("RPC error {code}: {message}")]
    Remote {
        /// Error code from the remote.
        code: i32,
        /// Error message from the remote.
        message: String,
    },

    /// The remote replied with something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeskError {
    /// Whether a pure query failing with this error may be re-issued.
    ///
    /// Only transport failures qualify. Side-effecting commands are never
    /// retried automatically regardless of this value.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Whether this is a per-call timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout(_)))
    }
}
