//! Configuration for the demo client.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use deskbox_core::{DeskError, SessionConfig};
use std::path::PathBuf;

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("failed to read session config {path}: {source}")]
    ReadSessionConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Session(#[from] DeskError),
}

/// Configuration for the demo run.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoConfig {
    /// `host:port` of the control endpoint.
    pub endpoint: String,

    /// Require a token on the stream URL.
    pub stream_auth: bool,

    /// Where `1.png` and `2.png` are written.
    pub output_dir: PathBuf,

    /// How many random right clicks to make.
    pub right_clicks: u32,

    /// Optional JSON file with a full `SessionConfig`.
    pub session_config: Option<PathBuf>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:4870".to_string(),
            stream_auth: false,
            output_dir: PathBuf::from("."),
            right_clicks: 3,
            session_config: None,
        }
    }
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { var, value }),
    }
}

impl DemoConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DESKBOX_ENDPOINT` | `127.0.0.1:4870` |
    /// | `DESKBOX_STREAM_AUTH` | `false` |
    /// | `DESKBOX_OUTPUT_DIR` | `.` |
    /// | `DESKBOX_RIGHT_CLICKS` | `3` |
    /// | `DESKBOX_SESSION_CONFIG` | unset |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let default = Self::default();

        let stream_auth = match lookup("DESKBOX_STREAM_AUTH") {
            Some(v) => parse_bool("DESKBOX_STREAM_AUTH", v)?,
            None => default.stream_auth,
        };
        let right_clicks = match lookup("DESKBOX_RIGHT_CLICKS") {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                var: "DESKBOX_RIGHT_CLICKS",
                value: v,
            })?,
            None => default.right_clicks,
        };

        Ok(Self {
            endpoint: lookup("DESKBOX_ENDPOINT").unwrap_or(default.endpoint),
            stream_auth,
            output_dir: lookup("DESKBOX_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.output_dir),
            right_clicks,
            session_config: lookup("DESKBOX_SESSION_CONFIG").map(PathBuf::from),
        })
    }

    /// Build the session config, from the JSON file if one is set.
    ///
    /// `DESKBOX_STREAM_AUTH` turns stream auth on even if the file leaves
    /// it off.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let mut config = match &self.session_config {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::ReadSessionConfig {
                        path: path.clone(),
                        source,
                    }
                })?;
                SessionConfig::from_json(&json)?
            }
            None => SessionConfig::builder().build()?,
        };
        config.enable_stream_auth |= self.stream_auth;
        config.metadata.insert("client".into(), "deskbox-demo".into());
        config.validate()?;
        Ok(config)
    }
}
