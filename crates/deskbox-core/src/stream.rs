//! Live video stream bound to a session.
//!
//! A stream is started and stopped independently of the control channel. Its
//! URL is self-contained so it can be opened outside this process; with
//! stream auth enabled it carries a token scoped to exactly one start of one
//! session.

use crate::error::{DeskError, Result};
use crate::protocol::{Command, StreamUrlReply};
use crate::session::{CallOptions, SandboxId, SessionRegistry};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Length of generated stream tokens.
const TOKEN_LENGTH: usize = 16;

/// Stream lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Stopped,
    Starting,
    Live,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Short-lived bearer credential for one stream.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamToken {
    value: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl StreamToken {
    pub(crate) fn generate(ttl: Duration) -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            value,
            issued_at,
            expires_at: issued_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// The secret itself.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the validity window has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamToken")
            .field("value", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Client-side view of a session's stream.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    sandbox_id: SandboxId,
    status: StreamStatus,
    url: Option<String>,
    auth_token: Option<StreamToken>,
}

impl StreamHandle {
    fn stopped(sandbox_id: SandboxId) -> Self {
        Self {
            sandbox_id,
            status: StreamStatus::Stopped,
            url: None,
            auth_token: None,
        }
    }

    pub fn sandbox_id(&self) -> &SandboxId {
        &self.sandbox_id
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Set only while `Live`.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Set only while `Live` on sessions with stream auth.
    pub fn auth_token(&self) -> Option<&StreamToken> {
        self.auth_token.as_ref()
    }
}

/// Stream state kept in the session slot, guarded by the slot's stream lock.
pub(crate) struct StreamSlot {
    handle: StreamHandle,
    /// Surface epoch the stream was started under.
    epoch: u64,
}

impl StreamSlot {
    pub(crate) fn new(sandbox_id: SandboxId) -> Self {
        Self {
            handle: StreamHandle::stopped(sandbox_id),
            epoch: 0,
        }
    }

    /// The handle as seen under the current surface epoch. A stream started
    /// before a reset, refresh or termination reads as stopped.
    pub(crate) fn current(&self, epoch: u64) -> StreamHandle {
        if self.is_running(epoch) {
            self.handle.clone()
        } else {
            StreamHandle::stopped(self.handle.sandbox_id.clone())
        }
    }

    pub(crate) fn is_running(&self, epoch: u64) -> bool {
        self.handle.status != StreamStatus::Stopped && self.epoch == epoch
    }

    pub(crate) fn reset(&mut self) {
        self.handle = StreamHandle::stopped(self.handle.sandbox_id.clone());
    }
}

/// Options for composing a stream URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlOptions {
    /// Ask the viewer to connect immediately (default: true).
    pub auto_connect: bool,
    /// Embed the auth token when the session has one (default: true).
    pub include_token: bool,
}

impl Default for UrlOptions {
    fn default() -> Self {
        Self {
            auto_connect: true,
            include_token: true,
        }
    }
}

fn compose_url(base: &str, options: UrlOptions, token: Option<&StreamToken>) -> Result<String> {
    let mut url = Url::parse(base)
        .map_err(|e| DeskError::Protocol(format!("invalid stream url {base:?}: {e}")))?;

    let mut pairs = Vec::new();
    if options.auto_connect {
        pairs.push(("autoconnect", "true"));
    }
    if let (true, Some(token)) = (options.include_token, token) {
        pairs.push(("password", token.value()));
    }
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(url.into())
}

/// Starts, stops and locates session streams.
///
/// Holds no session state of its own; every call looks the session up by id.
#[derive(Clone)]
pub struct StreamController {
    registry: SessionRegistry,
    options: CallOptions,
}

impl StreamController {
    pub(crate) fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            options: CallOptions::default(),
        }
    }

    /// Use `timeout` for calls made through this controller.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Abort calls made through this controller when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.options.cancel = Some(token);
        self
    }

    /// Start the session's stream.
    ///
    /// With stream auth enabled a fresh token is issued for this start only.
    ///
    /// # Errors
    ///
    /// [`DeskError::InvalidSessionState`] if the session is not `Active`,
    /// [`DeskError::StreamAlreadyStarted`] if a stream is starting or live.
    pub async fn start(&self, id: &SandboxId) -> Result<StreamHandle> {
        let slot = self.registry.active(id)?;
        let mut stream = slot.stream.lock().await;
        slot.ensure_active()?;

        let epoch = slot.epoch();
        if stream.is_running(epoch) {
            return Err(DeskError::StreamAlreadyStarted(id.clone()));
        }

        let config = slot.config();
        let token = config
            .enable_stream_auth
            .then(|| StreamToken::generate(Duration::from_secs(config.stream_token_ttl_secs)));

        tracing::info!(sandbox_id = %id, auth = token.is_some(), "Starting stream");
        stream.reset();
        stream.handle.status = StreamStatus::Starting;
        stream.epoch = epoch;

        let command = Command::StartStream {
            sandbox_id: id.clone(),
            auth_token: token.as_ref().map(|t| t.value().to_string()),
            token_ttl_secs: config.stream_token_ttl_secs,
        };
        let reply = slot
            .call(command, &self.options)
            .await
            .and_then(|value| serde_json::from_value::<StreamUrlReply>(value).map_err(DeskError::from))
            .and_then(|reply| compose_url(&reply.url, UrlOptions::default(), token.as_ref()));

        let url = match reply {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Stream start failed");
                stream.reset();
                return Err(e);
            }
        };

        if slot.epoch() != epoch {
            // The surface changed while the remote was starting the stream.
            stream.reset();
            slot.ensure_active()?;
            return Err(DeskError::StreamNotStarted(id.clone()));
        }

        stream.handle.status = StreamStatus::Live;
        stream.handle.url = Some(url);
        stream.handle.auth_token = token;
        tracing::info!(sandbox_id = %id, "Stream live");
        Ok(stream.handle.clone())
    }

    /// Stop the session's stream. Stopping a stopped stream is a no-op.
    ///
    /// The token issued by the matching `start` is discarded.
    pub async fn stop(&self, id: &SandboxId) -> Result<()> {
        let slot = self.registry.active(id)?;
        let mut stream = slot.stream.lock().await;
        slot.ensure_active()?;

        if !stream.is_running(slot.epoch()) {
            stream.reset();
            tracing::debug!(sandbox_id = %id, "Stream already stopped");
            return Ok(());
        }

        tracing::info!(sandbox_id = %id, "Stopping stream");
        let command = Command::StopStream {
            sandbox_id: id.clone(),
        };
        match slot.call(command, &self.options).await {
            Ok(_) | Err(DeskError::StreamNotStarted(_)) => {
                stream.reset();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// URL of the live stream, with auto-connect and the auth token.
    ///
    /// # Errors
    ///
    /// [`DeskError::StreamNotStarted`] unless the stream is `Live`.
    pub async fn get_url(&self, id: &SandboxId) -> Result<String> {
        self.get_url_with(id, UrlOptions::default()).await
    }

    /// URL of the live stream composed with `options`.
    ///
    /// The remote is asked for the current base URL on every call; if it no
    /// longer runs the stream the local handle is reset.
    pub async fn get_url_with(&self, id: &SandboxId, options: UrlOptions) -> Result<String> {
        let slot = self.registry.active(id)?;
        let mut stream = slot.stream.lock().await;
        slot.ensure_active()?;

        if !stream.is_running(slot.epoch()) || stream.handle.status != StreamStatus::Live {
            return Err(DeskError::StreamNotStarted(id.clone()));
        }

        let command = Command::GetStreamUrl {
            sandbox_id: id.clone(),
        };
        let reply = match slot.call(command, &self.options).await {
            Ok(value) => serde_json::from_value::<StreamUrlReply>(value)?,
            Err(e) => {
                if matches!(e, DeskError::StreamNotStarted(_)) {
                    tracing::warn!(sandbox_id = %id, "Remote reports stream not running");
                    stream.reset();
                }
                return Err(e);
            }
        };
        compose_url(&reply.url, options, stream.handle.auth_token.as_ref())
    }

    /// The auth token of the live stream.
    ///
    /// # Errors
    ///
    /// [`DeskError::StreamAuthDisabled`] if the session was created without
    /// stream auth, [`DeskError::StreamNotStarted`] if no stream is live.
    pub async fn auth_key(&self, id: &SandboxId) -> Result<String> {
        let slot = self.registry.active(id)?;
        if !slot.config().enable_stream_auth {
            return Err(DeskError::StreamAuthDisabled(id.clone()));
        }
        let stream = slot.stream.lock().await;
        stream
            .current(slot.epoch())
            .auth_token
            .map(|token| token.value)
            .ok_or_else(|| DeskError::StreamNotStarted(id.clone()))
    }

    /// Local view of the stream. Does not contact the remote.
    pub async fn handle(&self, id: &SandboxId) -> Result<StreamHandle> {
        let slot = self.registry.get(id)?;
        let stream = slot.stream.lock().await;
        Ok(stream.current(slot.epoch()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> StreamToken {
        StreamToken::generate(Duration::from_secs(60))
    }

    #[test]
    fn test_compose_url_with_token() {
        let token = token();
        let url = compose_url("https://6080-sbx.example.dev/vnc.html", UrlOptions::default(), Some(&token))
            .unwrap();
        assert_eq!(
            url,
            format!(
                "https://6080-sbx.example.dev/vnc.html?autoconnect=true&password={}",
                token.value()
            )
        );
    }

    #[test]
    fn test_compose_url_without_params() {
        let options = UrlOptions {
            auto_connect: false,
            include_token: false,
        };
        let url = compose_url("https://host/vnc.html", options, Some(&token())).unwrap();
        assert_eq!(url, "https://host/vnc.html");
    }

    #[test]
    fn test_compose_url_rejects_garbage() {
        let result = compose_url("not a url", UrlOptions::default(), None);
        assert!(matches!(result, Err(DeskError::Protocol(_))));
    }

    #[test]
    fn test_tokens_are_unique_and_alphanumeric() {
        let a = token();
        let b = token();
        assert_ne!(a.value(), b.value());
        assert_eq!(a.value().len(), TOKEN_LENGTH);
        assert!(a.value().chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!a.is_expired());
        assert!(a.expires_at() > a.issued_at());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = token();
        let debug = format!("{:?}", token);
        assert!(!debug.contains(token.value()));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_slot_reads_stopped_after_epoch_change() {
        let mut slot = StreamSlot::new(SandboxId::from("sbx"));
        slot.handle.status = StreamStatus::Live;
        slot.handle.url = Some("https://host/vnc.html".into());
        slot.epoch = 3;

        assert!(slot.is_running(3));
        assert_eq!(slot.current(3).status(), StreamStatus::Live);

        let stale = slot.current(4);
        assert_eq!(stale.status(), StreamStatus::Stopped);
        assert!(stale.url().is_none());
    }
}
