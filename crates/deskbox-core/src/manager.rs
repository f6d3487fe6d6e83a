//! Session manager for the lifecycle of remote desktop sandboxes.

use crate::client::TcpConnector;
use crate::config::{ClientConfig, SessionConfig};
use crate::display::DisplayQuery;
use crate::error::{DeskError, Result};
use crate::input::InputDispatcher;
use crate::protocol::{error_codes, Command, CreateSessionParams, CreateSessionReply};
use crate::session::{CallOptions, SandboxId, SandboxSession, SessionRegistry, SessionSlot, SessionState};
use crate::stream::StreamController;
use crate::transport::{Connector, Transport};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default cap on concurrently registered sessions.
const DEFAULT_MAX_SESSIONS: usize = 16;

/// Owns every session and the control channel each one runs on.
///
/// Components handed out by [`input`](Self::input), [`display`](Self::display)
/// and [`stream`](Self::stream) keep only the registry and look sessions up by
/// id, so killing a session never waits on them.
///
/// # Example
///
/// ```ignore
/// use deskbox_core::{ClientConfig, SessionConfig, SessionManager};
///
/// # async fn example() -> deskbox_core::Result<()> {
/// let manager = SessionManager::connect(ClientConfig::new("127.0.0.1:4870"));
/// let config = SessionConfig::builder().enable_stream_auth(true).build()?;
/// let session = manager.create(config).await?;
///
/// let handle = manager.stream().start(session.id()).await?;
/// println!("watch at {}", handle.url().unwrap_or_default());
///
/// manager.input().move_mouse(session.id(), 100, 100).await?;
/// manager.input().left_click(session.id()).await?;
///
/// manager.kill(session.id()).await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    registry: SessionRegistry,
    max_sessions: usize,
    provisioning: Arc<AtomicUsize>,
}

/// Holds one unit of the session cap while a create is in flight.
struct ProvisionPermit(Arc<AtomicUsize>);

impl Drop for ProvisionPermit {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionManager {
    /// Create a manager that opens control channels through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        tracing::info!("Creating session manager");
        Self {
            connector,
            registry: SessionRegistry::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            provisioning: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a manager talking JSON-RPC over TCP to `config.endpoint`.
    pub fn connect(config: ClientConfig) -> Self {
        Self::new(Arc::new(TcpConnector::new(config)))
    }

    /// Limit the number of live sessions, counting creates still in flight
    /// (0 = unlimited).
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Input dispatcher over this manager's sessions.
    pub fn input(&self) -> InputDispatcher {
        InputDispatcher::new(self.registry.clone())
    }

    /// Display queries over this manager's sessions.
    pub fn display(&self) -> DisplayQuery {
        DisplayQuery::new(self.registry.clone())
    }

    /// Stream controller over this manager's sessions.
    pub fn stream(&self) -> StreamController {
        StreamController::new(self.registry.clone())
    }

    /// Provision a new sandbox and return it `Active`.
    ///
    /// Provisioning is never retried. It runs on its own task, so dropping the
    /// returned future does not abandon a half-created sandbox: if the caller
    /// is gone when provisioning completes, the sandbox is killed.
    ///
    /// # Errors
    ///
    /// - [`DeskError::Config`] if `config` is invalid
    /// - [`DeskError::Provision`] if the remote refused
    /// - [`DeskError::Transport`] if the channel failed and the attempt was
    ///   confirmed cancelled
    /// - [`DeskError::ProvisionUnconfirmed`] if the channel failed and the
    ///   remote could not confirm the attempt was cancelled
    pub async fn create(&self, config: SessionConfig) -> Result<SandboxSession> {
        self.create_with(config, CancellationToken::new()).await
    }

    /// [`create`](Self::create) that gives up waiting when `cancel` fires.
    ///
    /// Cancellation resolves to [`DeskError::Cancelled`]; a sandbox that
    /// still comes up afterwards is killed.
    pub async fn create_with(&self, config: SessionConfig, cancel: CancellationToken) -> Result<SandboxSession> {
        config.validate()?;
        let permit = self.reserve()?;

        let client_token = Uuid::new_v4();
        tracing::info!(%client_token, template = %config.template, "Creating session");

        let (tx, rx) = oneshot::channel();
        let connector = Arc::clone(&self.connector);
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let result = provision(connector.as_ref(), &registry, config, client_token).await;
            drop(permit);
            if let Err(Ok(session)) = tx.send(result) {
                tracing::warn!(sandbox_id = %session.id(), "Caller abandoned create, killing sandbox");
                if let Ok(slot) = registry.get(session.id()) {
                    if let Err(e) = terminate_session(connector.as_ref(), &slot).await {
                        tracing::warn!(sandbox_id = %session.id(), error = %e, "Failed to kill abandoned sandbox");
                    }
                }
            }
        });

        tokio::select! {
            result = rx => result.unwrap_or_else(|_| {
                Err(DeskError::Protocol("provisioning task ended without a result".into()))
            }),
            _ = cancel.cancelled() => {
                tracing::debug!(%client_token, "Create cancelled by caller");
                Err(DeskError::Cancelled)
            }
        }
    }

    /// Take a unit of the session cap for a new create.
    fn reserve(&self) -> Result<ProvisionPermit> {
        let in_flight = self.provisioning.fetch_add(1, Ordering::SeqCst);
        let permit = ProvisionPermit(Arc::clone(&self.provisioning));
        if self.max_sessions > 0 {
            let live = self
                .registry
                .all()
                .iter()
                .filter(|slot| !slot.state().is_terminal())
                .count();
            if live + in_flight >= self.max_sessions {
                return Err(DeskError::Provision(format!(
                    "max session limit reached ({})",
                    self.max_sessions
                )));
            }
        }
        Ok(permit)
    }

    /// Re-establish the control channel of a session whose desktop was reset.
    ///
    /// Opens a fresh connection, asks the remote to rebuild the desktop
    /// surface and moves the session to `Active`, keeping its id. A stream
    /// started before the refresh is gone and must be started again.
    ///
    /// # Errors
    ///
    /// [`DeskError::SessionNotFound`] if the remote no longer knows the
    /// sandbox. The session is `Terminated` afterwards.
    pub async fn refresh(&self, id: &SandboxId) -> Result<SandboxSession> {
        let slot = self.registry.get(id)?;
        let mut stream = slot.stream.lock().await;

        let state = slot.state();
        if !matches!(state, SessionState::Active | SessionState::Stale) {
            return Err(DeskError::InvalidSessionState {
                sandbox_id: id.clone(),
                expected: SessionState::Stale,
                actual: state,
            });
        }

        tracing::info!(sandbox_id = %id, from = %state, "Refreshing session");
        let transport = self.connector.connect().await?;
        let command = Command::Refresh {
            sandbox_id: id.clone(),
        };
        let result = transport
            .send(&command, slot.config().request_timeout())
            .await;
        if let Err(e) = slot.classify(result) {
            transport.close();
            return Err(e);
        }

        if let Some(old) = slot.replace_transport(transport) {
            old.close();
        }
        slot.transition(SessionState::Active)?;
        stream.reset();
        tracing::info!(sandbox_id = %id, "Session refreshed");
        Ok(slot.snapshot())
    }

    /// Kill a session. Idempotent.
    ///
    /// Stops a live stream first, then asks the remote to destroy the
    /// sandbox, reconnecting once if the session's channel is gone. The
    /// session is `Terminated` when this returns. Unknown ids and already
    /// terminated sessions are no-ops.
    ///
    /// Kill does not fail: a remote kill that still cannot be delivered is
    /// logged, and the sandbox then lives until its own timeout.
    pub async fn kill(&self, id: &SandboxId) -> Result<()> {
        match self.registry.get(id) {
            Ok(slot) => {
                // Failures are already logged by terminate_session.
                let _ = terminate_session(self.connector.as_ref(), &slot).await;
            }
            Err(_) => {
                tracing::debug!(sandbox_id = %id, "Kill for unknown session ignored");
            }
        }
        Ok(())
    }

    /// Mark a session stale after an out-of-band report that its desktop
    /// was reset. Input and stream calls fail until [`refresh`](Self::refresh).
    pub fn mark_stale(&self, id: &SandboxId) -> Result<()> {
        let slot = self.registry.get(id)?;
        if !slot.mark_stale() {
            let actual = slot.state();
            if actual != SessionState::Stale {
                return Err(DeskError::InvalidSessionState {
                    sandbox_id: id.clone(),
                    expected: SessionState::Active,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Snapshot of one session.
    pub fn session(&self, id: &SandboxId) -> Result<SandboxSession> {
        Ok(self.registry.get(id)?.snapshot())
    }

    /// Snapshots of all sessions, oldest first.
    pub fn list(&self) -> Vec<SandboxSession> {
        let mut sessions: Vec<_> = self.registry.all().iter().map(|slot| slot.snapshot()).collect();
        sessions.sort_by_key(|s| s.created_at());
        sessions
    }

    /// Drop a terminated session from the registry.
    pub fn forget(&self, id: &SandboxId) -> Result<()> {
        let slot = self.registry.get(id)?;
        let state = slot.state();
        if !state.is_terminal() {
            return Err(DeskError::InvalidSessionState {
                sandbox_id: id.clone(),
                expected: SessionState::Terminated,
                actual: state,
            });
        }
        self.registry.remove(id);
        Ok(())
    }

    /// Kill every session.
    ///
    /// Returns the number of sessions whose remote kill failed.
    pub async fn kill_all(&self) -> usize {
        let slots = self.registry.all();
        tracing::info!(count = slots.len(), "Killing all sessions");

        let results = futures::future::join_all(
            slots
                .iter()
                .map(|slot| terminate_session(self.connector.as_ref(), slot)),
        ).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(failed, "Some sessions failed to kill cleanly");
        }
        failed
    }
}

/// Provision one sandbox and register it as `Active`.
async fn provision(
    connector: &dyn Connector,
    registry: &SessionRegistry,
    config: SessionConfig,
    client_token: Uuid,
) -> Result<SandboxSession> {
    let transport = connector.connect().await?;

    let command = Command::CreateSession(CreateSessionParams {
        client_token,
        template: config.template.clone(),
        region: config.region.clone(),
        width: config.resolution.0,
        height: config.resolution.1,
        dpi: config.dpi,
        display: config.display.clone(),
        sandbox_timeout_secs: config.sandbox_timeout_secs,
        enable_stream_auth: config.enable_stream_auth,
        metadata: config.metadata.clone(),
    });

    let reply = transport
        .send(&command, config.create_timeout())
        .await
        .and_then(|value| serde_json::from_value::<CreateSessionReply>(value).map_err(DeskError::from));

    let reply = match reply {
        Ok(reply) => reply,
        Err(DeskError::Remote { code, message }) if code == error_codes::PROVISION_FAILED => {
            tracing::warn!(%client_token, message = %message, "Remote refused to provision");
            transport.close();
            return Err(DeskError::Provision(message));
        }
        Err(e @ DeskError::Remote { .. }) => {
            transport.close();
            return Err(e);
        }
        Err(e) => {
            // The sandbox may exist without us knowing its id.
            let outcome = cancel_create(connector, &transport, client_token, &config).await;
            transport.close();
            return Err(match outcome {
                Ok(()) => e,
                Err(cancel_error) => DeskError::ProvisionUnconfirmed {
                    client_token,
                    reason: format!("{e}; cancel failed: {cancel_error}"),
                },
            });
        }
    };

    let slot = Arc::new(SessionSlot::new(reply.sandbox_id, config, transport));
    slot.transition(SessionState::Active)?;
    registry.insert(Arc::clone(&slot));
    tracing::info!(sandbox_id = %slot.id(), %client_token, "Session active");
    Ok(slot.snapshot())
}

/// Ask the remote to abandon the provisioning attempt for `client_token`,
/// killing the sandbox if it was already created.
async fn cancel_create(
    connector: &dyn Connector,
    transport: &Arc<dyn Transport>,
    client_token: Uuid,
    config: &SessionConfig,
) -> Result<()> {
    tracing::warn!(%client_token, "Provisioning failed in flight, cancelling");

    let transport = if transport.is_open() {
        Arc::clone(transport)
    } else {
        connector.connect().await?
    };
    let command = Command::CancelCreate { client_token };
    let value: Value = transport.send(&command, config.request_timeout()).await?;

    if value.get("cancelled").and_then(Value::as_bool) == Some(true) {
        tracing::info!(%client_token, "Provisioning cancelled");
        Ok(())
    } else {
        Err(DeskError::Protocol(format!("unexpected cancel reply: {value}")))
    }
}

/// Stop the stream, kill the remote sandbox and terminate the slot.
///
/// Holding the stream lock waits out in-flight stream operations and
/// serializes concurrent kills: only the first one reaches the remote.
/// A kill lost to a dead channel is sent once more on a fresh connection;
/// the remote answers not-found for a sandbox it already destroyed.
pub(crate) async fn terminate_session(connector: &dyn Connector, slot: &SessionSlot) -> Result<()> {
    let mut stream = slot.stream.lock().await;
    let state = slot.state();
    if state.is_terminal() {
        tracing::debug!(sandbox_id = %slot.id(), "Session already terminated");
        return Ok(());
    }

    tracing::info!(sandbox_id = %slot.id(), from = %state, "Killing session");
    let options = CallOptions::default();

    if state == SessionState::Active && stream.is_running(slot.epoch()) {
        let command = Command::StopStream {
            sandbox_id: slot.id().clone(),
        };
        if let Err(e) = slot.send_raw(&command, &options).await {
            tracing::warn!(sandbox_id = %slot.id(), error = %e, "Failed to stop stream before kill");
        }
    }
    stream.reset();

    let command = Command::Kill {
        sandbox_id: slot.id().clone(),
    };
    let result = match slot.send_raw(&command, &options).await {
        Err(DeskError::Transport(e)) => {
            tracing::debug!(sandbox_id = %slot.id(), error = %e, "Kill channel failed, reconnecting");
            resend(connector, &command, slot.config()).await
        }
        other => other,
    };
    slot.terminate();

    match result {
        Ok(_) => {
            tracing::info!(sandbox_id = %slot.id(), "Session killed");
            Ok(())
        }
        Err(DeskError::Remote { code, .. }) if code == error_codes::SESSION_NOT_FOUND => {
            tracing::debug!(sandbox_id = %slot.id(), "Remote had already forgotten sandbox");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(sandbox_id = %slot.id(), error = %e, "Remote kill failed");
            Err(e)
        }
    }
}

/// Send `command` on a fresh connection and close it afterwards.
async fn resend(connector: &dyn Connector, command: &Command, config: &SessionConfig) -> Result<Value> {
    let transport = connector.connect().await?;
    let result = transport.send(command, config.request_timeout()).await;
    transport.close();
    result
}
