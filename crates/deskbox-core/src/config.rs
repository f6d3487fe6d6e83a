//! Session and client configuration types.

use crate::error::DeskError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for creating a sandbox session.
///
/// Deserializing rejects unknown keys so typos in option names surface as
/// errors instead of being silently ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Require a bearer token on stream URLs (default: false).
    pub enable_stream_auth: bool,
    /// Per-call timeout in milliseconds for commands on this session (default: 30000).
    pub timeout_ms: u64,
    /// Timeout in milliseconds for the provisioning call (default: 60000).
    pub create_timeout_ms: u64,
    /// Sandbox template name (default: "desktop").
    pub template: String,
    /// Region selector passed to the provisioning backend.
    pub region: Option<String>,
    /// Screen resolution as (width, height) (default: 1024x768).
    pub resolution: (u32, u32),
    /// Display DPI (default: 96).
    pub dpi: u32,
    /// X display name on the remote (default: ":0").
    pub display: String,
    /// Remote lifetime of the sandbox in seconds (default: 300).
    pub sandbox_timeout_secs: u64,
    /// Validity window of stream auth tokens in seconds (default: 3600).
    pub stream_token_ttl_secs: u64,
    /// Attempts for pure queries on transport errors, including the first (default: 3).
    pub query_attempts: u32,
    /// Free-form metadata attached to the sandbox.
    pub metadata: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enable_stream_auth: false,
            timeout_ms: 30_000,
            create_timeout_ms: 60_000,
            template: "desktop".to_string(),
            region: None,
            resolution: (1024, 768),
            dpi: 96,
            display: ":0".to_string(),
            sandbox_timeout_secs: 300,
            stream_token_ttl_secs: 3600,
            query_attempts: 3,
            metadata: HashMap::new(),
        }
    }
}

impl SessionConfig {
    /// Create a new config builder.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Parse a JSON options object, rejecting unknown keys.
    pub fn from_json(json: &str) -> Result<Self, DeskError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DeskError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Per-call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Provisioning timeout.
    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), DeskError> {
        if self.timeout_ms == 0 {
            return Err(DeskError::Config("timeout_ms must be > 0".into()));
        }
        if self.create_timeout_ms == 0 {
            return Err(DeskError::Config("create_timeout_ms must be > 0".into()));
        }
        if self.template.trim().is_empty() {
            return Err(DeskError::Config("template is required".into()));
        }
        if self.resolution.0 == 0 || self.resolution.1 == 0 {
            return Err(DeskError::Config("resolution must be non-zero".into()));
        }
        if self.dpi == 0 {
            return Err(DeskError::Config("dpi must be > 0".into()));
        }
        if !self.display.starts_with(':') {
            return Err(DeskError::Config(format!(
                "display must look like \":N\", got {:?}",
                self.display
            )));
        }
        if self.stream_token_ttl_secs == 0 {
            return Err(DeskError::Config("stream_token_ttl_secs must be > 0".into()));
        }
        if self.query_attempts == 0 {
            return Err(DeskError::Config("query_attempts must be >= 1".into()));
        }
        Ok(())
    }
}

/// Builder for SessionConfig.
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Require a token on stream URLs.
    pub fn enable_stream_auth(mut self, enabled: bool) -> Self {
        self.config.enable_stream_auth = enabled;
        self
    }

    /// Set the per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the provisioning timeout.
    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.config.create_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the sandbox template.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.config.template = template.into();
        self
    }

    /// Set the region selector.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = Some(region.into());
        self
    }

    /// Set the screen resolution.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.config.resolution = (width, height);
        self
    }

    /// Set the display DPI.
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    /// Set the X display name.
    pub fn display(mut self, display: impl Into<String>) -> Self {
        self.config.display = display.into();
        self
    }

    /// Set the remote sandbox lifetime.
    pub fn sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.config.sandbox_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the stream token validity window.
    pub fn stream_token_ttl(mut self, ttl: Duration) -> Self {
        self.config.stream_token_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the attempt budget for pure queries.
    pub fn query_attempts(mut self, attempts: u32) -> Self {
        self.config.query_attempts = attempts;
        self
    }

    /// Attach a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SessionConfig, DeskError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Where and how to reach the control endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// `host:port` of the control endpoint.
    pub endpoint: String,
    /// Total time allowed for connecting, including retries (default: 10s).
    pub connect_timeout: Duration,
    /// Timeout for the liveness ping after connecting (default: 5s).
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    /// Create a client config for `endpoint` with default timeouts.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}
