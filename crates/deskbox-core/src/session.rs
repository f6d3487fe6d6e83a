//! Session identity, lifecycle state, and the per-session slot shared by the
//! input, display and stream components.

use crate::config::SessionConfig;
use crate::error::{DeskError, Result, TransportError};
use crate::protocol::{error_codes, Command};
use crate::stream::StreamSlot;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Opaque sandbox identifier issued by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Wrap a remote-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SandboxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SandboxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for SandboxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a session.
///
/// ```text
/// Created --provisioned--> Active --surface reset--> Stale --refresh--> Active
///    any --kill--> Terminated (absorbing)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Provisioning in flight. Never observed by callers of `create`.
    Created,
    /// Ready for commands.
    Active,
    /// Remote surface was reset; needs `refresh`.
    Stale,
    /// Killed or forgotten by the remote.
    Terminated,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Created, Active) | (Active, Stale) | (Stale, Active) | (Active, Active) => true,
            _ => false,
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }

    fn predecessor_of(next: SessionState) -> SessionState {
        match next {
            Self::Active => Self::Stale,
            Self::Stale => Self::Active,
            Self::Created | Self::Terminated => Self::Created,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Active => write!(f, "Active"),
            Self::Stale => write!(f, "Stale"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SandboxSession {
    id: SandboxId,
    state: SessionState,
    created_at: DateTime<Utc>,
    config: SessionConfig,
}

impl SandboxSession {
    /// Get the sandbox ID.
    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    /// State at the time the snapshot was taken.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether stream URLs for this session carry an auth token.
    pub fn stream_auth_enabled(&self) -> bool {
        self.config.enable_stream_auth
    }

    /// Get the configuration used to create this session.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

/// Per-call overrides for timeout and cancellation.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallOptions {
    /// Overrides the session's `timeout_ms` when set.
    pub(crate) timeout: Option<Duration>,
    /// Aborts the wait with [`DeskError::Cancelled`] when triggered.
    pub(crate) cancel: Option<CancellationToken>,
}

/// Everything the client tracks for one sandbox.
///
/// Components never keep a slot: they look it up by id for each call.
pub(crate) struct SessionSlot {
    id: SandboxId,
    config: SessionConfig,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    /// Generation of the remote surface. Bumped whenever a stream started
    /// earlier can no longer be live (stale, refresh, terminate).
    epoch: AtomicU64,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// FIFO lane serializing input commands. Tokio's mutex is fair, so
    /// waiters acquire it in the order they started waiting.
    pub(crate) input_lane: tokio::sync::Mutex<()>,
    pub(crate) stream: tokio::sync::Mutex<StreamSlot>,
}

impl SessionSlot {
    pub(crate) fn new(id: SandboxId, config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        let stream = StreamSlot::new(id.clone());
        Self {
            id,
            config,
            created_at: Utc::now(),
            state: Mutex::new(SessionState::Created),
            epoch: AtomicU64::new(0),
            transport: Mutex::new(Some(transport)),
            input_lane: tokio::sync::Mutex::new(()),
            stream: tokio::sync::Mutex::new(stream),
        }
    }

    pub(crate) fn id(&self) -> &SandboxId {
        &self.id
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> SandboxSession {
        SandboxSession {
            id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
            config: self.config.clone(),
        }
    }

    /// Move to `next`, returning the previous state.
    pub(crate) fn transition(&self, next: SessionState) -> Result<SessionState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = *state;
        if !prev.can_transition_to(next) {
            return Err(DeskError::InvalidSessionState {
                sandbox_id: self.id.clone(),
                expected: SessionState::predecessor_of(next),
                actual: prev,
            });
        }
        *state = next;
        if next != SessionState::Active || prev == SessionState::Active {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        tracing::debug!(sandbox_id = %self.id, from = %prev, to = %next, "Session state transition");
        Ok(prev)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(DeskError::InvalidSessionState {
                sandbox_id: self.id.clone(),
                expected: SessionState::Active,
                actual: state,
            });
        }
        Ok(())
    }

    /// `Active → Stale`. Returns whether this call made the transition.
    pub(crate) fn mark_stale(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Active {
            return false;
        }
        *state = SessionState::Stale;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(sandbox_id = %self.id, "Desktop surface reset, session is stale");
        true
    }

    /// Move to `Terminated` and release the transport.
    ///
    /// Returns whether this call made the transition; later calls are no-ops.
    pub(crate) fn terminate(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == SessionState::Terminated {
                return false;
            }
            tracing::debug!(sandbox_id = %self.id, from = %*state, "Session terminated");
            *state = SessionState::Terminated;
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(transport) = self.take_transport() {
            transport.close();
        }
        true
    }

    pub(crate) fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::Closed.into())
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Install a new transport, returning the previous one.
    pub(crate) fn replace_transport(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(transport)
    }

    /// Send a command on the session's transport without checking state or
    /// interpreting remote errors.
    pub(crate) async fn send_raw(&self, command: &Command, options: &CallOptions) -> Result<Value> {
        let transport = self.transport()?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.request_timeout());
        let call = transport.send(command, timeout);
        match &options.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!(sandbox_id = %self.id, method = command.method(), "Call cancelled by caller");
                    Err(DeskError::Cancelled)
                }
                result = call => result,
            },
            None => call.await,
        }
    }

    /// Send a command against an `Active` session.
    ///
    /// Remote state errors are folded into local state: an unknown sandbox
    /// terminates the session, a reset surface marks it stale.
    pub(crate) async fn call(&self, command: Command, options: &CallOptions) -> Result<Value> {
        self.ensure_active()?;
        let result = self.send_raw(&command, options).await;
        self.classify(result)
    }

    pub(crate) fn classify(&self, result: Result<Value>) -> Result<Value> {
        match result {
            Err(DeskError::Remote { code, message }) => Err(match code {
                error_codes::SESSION_NOT_FOUND => {
                    if self.terminate() {
                        tracing::warn!(sandbox_id = %self.id, message = %message, "Remote no longer recognises sandbox");
                        DeskError::SessionNotFound(self.id.clone())
                    } else {
                        DeskError::InvalidSessionState {
                            sandbox_id: self.id.clone(),
                            expected: SessionState::Active,
                            actual: SessionState::Terminated,
                        }
                    }
                }
                error_codes::SURFACE_RESET => {
                    self.mark_stale();
                    DeskError::SurfaceReset(self.id.clone())
                }
                error_codes::STREAM_NOT_STARTED => DeskError::StreamNotStarted(self.id.clone()),
                _ => DeskError::Remote { code, message },
            }),
            other => other,
        }
    }
}

/// Id-keyed table of session slots.
///
/// Lookups are synchronous so that a component call reaches its first await
/// point (the input lane) on its first poll, keeping submission order.
#[derive(Clone, Default)]
pub(crate) struct SessionRegistry {
    slots: Arc<RwLock<HashMap<SandboxId, Arc<SessionSlot>>>>,
}

impl SessionRegistry {
    pub(crate) fn insert(&self, slot: Arc<SessionSlot>) {
        let id = slot.id().clone();
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot);
    }

    pub(crate) fn get(&self, id: &SandboxId) -> Result<Arc<SessionSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| DeskError::UnknownSession(id.clone()))
    }

    /// Look up a slot that must be `Active`.
    pub(crate) fn active(&self, id: &SandboxId) -> Result<Arc<SessionSlot>> {
        let slot = self.get(id)?;
        slot.ensure_active()?;
        Ok(slot)
    }

    pub(crate) fn remove(&self, id: &SandboxId) -> Option<Arc<SessionSlot>> {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub(crate) fn all(&self) -> Vec<Arc<SessionSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_sandbox_id_display() {
        let id = SandboxId::from("sbx-42");
        assert_eq!(format!("{}", id), "sbx-42");
        assert_eq!(id.as_str(), "sbx-42");
    }

    #[test]
    fn test_sandbox_id_serializes_as_string() {
        let id = SandboxId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(format!("{}", Created), "Created");
        assert_eq!(format!("{}", Active), "Active");
        assert_eq!(format!("{}", Stale), "Stale");
        assert_eq!(format!("{}", Terminated), "Terminated");
    }

    #[test]
    fn test_transitions() {
        assert!(Created.can_transition_to(Active));
        assert!(Active.can_transition_to(Stale));
        assert!(Stale.can_transition_to(Active));
        assert!(Stale.can_transition_to(Terminated));
        assert!(Created.can_transition_to(Terminated));

        assert!(!Created.can_transition_to(Stale));
        assert!(!Stale.can_transition_to(Stale));
        assert!(!Active.can_transition_to(Created));
    }

    #[test]
    fn test_terminated_is_absorbing() {
        for next in [Created, Active, Stale, Terminated] {
            assert!(!Terminated.can_transition_to(next));
        }
        assert!(Terminated.is_terminal());
        assert!(!Active.is_terminal());
    }
}
