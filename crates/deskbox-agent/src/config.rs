//! Configuration for the agent.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Configuration for the deskbox agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address the control endpoint listens on.
    pub listen_addr: SocketAddr,

    /// Host name put into stream URLs (default: "localhost").
    pub public_host: String,

    /// Base port for x11vnc; display `:N` uses `vnc_base_port + N`.
    pub vnc_base_port: u16,

    /// Base port for the noVNC proxy; display `:N` uses `novnc_base_port + N`.
    pub novnc_base_port: u16,

    /// Directory holding the noVNC web client.
    pub novnc_web: PathBuf,

    /// Wallpaper set on every new desktop, if any.
    pub wallpaper: Option<PathBuf>,

    /// Working directory for per-session files (VNC password files).
    pub work_dir: PathBuf,

    /// Maximum concurrent sessions (default: 8, 0 = unlimited).
    pub max_sessions: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 4870),
            public_host: "localhost".to_string(),
            vnc_base_port: 5900,
            novnc_base_port: 6080,
            novnc_web: PathBuf::from("/opt/noVNC"),
            wallpaper: Some(PathBuf::from("/usr/share/backgrounds/xfce/wallpaper.png")),
            work_dir: PathBuf::from("/tmp/deskbox"),
            max_sessions: 8,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DESKBOX_AGENT_HOST` | `0.0.0.0` |
    /// | `DESKBOX_AGENT_PORT` | `4870` |
    /// | `DESKBOX_PUBLIC_HOST` | `localhost` |
    /// | `DESKBOX_VNC_BASE_PORT` | `5900` |
    /// | `DESKBOX_NOVNC_BASE_PORT` | `6080` |
    /// | `DESKBOX_NOVNC_WEB` | `/opt/noVNC` |
    /// | `DESKBOX_WALLPAPER` | `/usr/share/backgrounds/xfce/wallpaper.png` (empty disables) |
    /// | `DESKBOX_WORK_DIR` | `/tmp/deskbox` |
    /// | `DESKBOX_MAX_SESSIONS` | `8` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let host: IpAddr = std::env::var("DESKBOX_AGENT_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.listen_addr.ip());

        let port: u16 = std::env::var("DESKBOX_AGENT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.listen_addr.port());

        Self {
            listen_addr: SocketAddr::new(host, port),
            public_host: std::env::var("DESKBOX_PUBLIC_HOST").unwrap_or(default.public_host),
            vnc_base_port: std::env::var("DESKBOX_VNC_BASE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.vnc_base_port),
            novnc_base_port: std::env::var("DESKBOX_NOVNC_BASE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.novnc_base_port),
            novnc_web: std::env::var("DESKBOX_NOVNC_WEB")
                .map(PathBuf::from)
                .unwrap_or(default.novnc_web),
            wallpaper: match std::env::var("DESKBOX_WALLPAPER") {
                Ok(v) if v.is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => default.wallpaper,
            },
            work_dir: std::env::var("DESKBOX_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.work_dir),
            max_sessions: std::env::var("DESKBOX_MAX_SESSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_sessions),
        }
    }

    /// Log warnings for missing external resources.
    pub fn validate_warn(&self) {
        if !self.novnc_web.exists() {
            tracing::warn!("noVNC web client not found: {:?}", self.novnc_web);
        }
        if let Some(wallpaper) = &self.wallpaper {
            if !wallpaper.exists() {
                tracing::warn!("Wallpaper not found: {:?}", wallpaper);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.listen_addr.port(), 4870);
        assert_eq!(config.vnc_base_port, 5900);
        assert_eq!(config.novnc_base_port, 6080);
        assert_eq!(config.novnc_web, PathBuf::from("/opt/noVNC"));
        assert_eq!(config.public_host, "localhost");
    }
}
