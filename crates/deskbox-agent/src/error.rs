//! Error types for the desktop host.

use crate::protocol::error_codes;
use thiserror::Error;

/// Errors raised while driving a desktop.
#[derive(Debug, Error)]
pub enum DesktopError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("provisioning refused: {0}")]
    Provision(String),

    #[error("desktop session for {0} has ended")]
    SurfaceReset(String),

    #[error("stream not started for {0}")]
    StreamNotStarted(String),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("timed out waiting for {0}")]
    NotReady(String),

    #[error("display :{display} has no port above {base}")]
    PortRange { base: u16, display: u32 },

    #[error("unexpected output from {program}: {output}")]
    Parse { program: String, output: String },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DesktopError {
    /// JSON-RPC error code reported to the client.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound(_) => error_codes::SESSION_NOT_FOUND,
            Self::Provision(_) => error_codes::PROVISION_FAILED,
            Self::SurfaceReset(_) => error_codes::SURFACE_RESET,
            Self::StreamNotStarted(_) => error_codes::STREAM_NOT_STARTED,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DesktopError::NotFound("a".into()).code(), -32001);
        assert_eq!(DesktopError::Provision("full".into()).code(), -32002);
        assert_eq!(DesktopError::SurfaceReset("a".into()).code(), -32003);
        assert_eq!(DesktopError::StreamNotStarted("a".into()).code(), -32004);
        assert_eq!(
            DesktopError::NotReady("Xvfb".into()).code(),
            error_codes::INTERNAL_ERROR
        );
    }
}
