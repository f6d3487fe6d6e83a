//! In-process fake of the control endpoint.
//!
//! `MockRemote` records every command it receives and answers with canned
//! replies. Tests override replies per command and add per-method delays.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use deskbox_core::{
    Command, Connector, DeskError, Result, SandboxId, SessionConfig, SessionManager, Transport,
    TransportError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// First bytes of every PNG file.
pub const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Base URL the fake returns for streams.
pub const STREAM_BASE: &str = "https://6080-sbx.example.dev/vnc.html";

type Responder = Box<dyn Fn(&Command) -> Option<Result<Value>> + Send + Sync>;

/// Shared state behind every transport the mock connector opens.
#[derive(Default)]
pub struct MockRemote {
    calls: Mutex<Vec<Command>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    responder: Mutex<Option<Responder>>,
    cursor: Mutex<(u32, u32)>,
    next_id: AtomicUsize,
    connects: AtomicUsize,
    refuse_connect: AtomicBool,
    generation: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer commands for which `f` returns `Some`; the rest get the
    /// default reply.
    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&Command) -> Option<Result<Value>> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    /// Hold replies to `method` for `delay`.
    pub fn delay(&self, method: &'static str, delay: Duration) {
        self.delays.lock().unwrap().insert(method, delay);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Close every connection opened so far, as if the remote dropped them.
    pub fn drop_connections(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Command> {
        self.calls.lock().unwrap().clone()
    }

    /// Method names received, in order, excluding the handshake ping.
    pub fn methods(&self) -> Vec<&'static str> {
        self.calls()
            .iter()
            .map(Command::method)
            .filter(|m| *m != "ping")
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.method() == method).count()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn default_reply(&self, command: &Command) -> Value {
        match command {
            Command::CreateSession(_) => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                json!({"sandbox_id": format!("sbx-{n}")})
            }
            Command::CancelCreate { .. } => json!({"cancelled": true}),
            Command::MoveMouse { x, y, .. } => {
                *self.cursor.lock().unwrap() = (*x, *y);
                json!({"ok": true})
            }
            Command::GetCursorPosition { .. } => {
                let (x, y) = *self.cursor.lock().unwrap();
                json!({"x": x, "y": y})
            }
            Command::GetScreenSize { .. } => json!({"width": 1024, "height": 768}),
            Command::TakeScreenshot { .. } => json!({"data": STANDARD.encode(PNG_MAGIC)}),
            Command::StartStream { .. } | Command::GetStreamUrl { .. } => {
                json!({"url": STREAM_BASE})
            }
            Command::Ping => json!({"pong": true}),
            _ => json!({"ok": true}),
        }
    }

    async fn handle(&self, command: &Command, timeout: Duration) -> Result<Value> {
        self.calls.lock().unwrap().push(command.clone());

        let delay = self.delays.lock().unwrap().get(command.method()).copied();
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout(timeout).into());
            }
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .responder
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|f| f(command));
        match scripted {
            Some(result) => result,
            None => Ok(self.default_reply(command)),
        }
    }
}

/// Remote error reply with `code`.
pub fn remote_error(code: i32) -> Result<Value> {
    Err(DeskError::Remote {
        code,
        message: format!("scripted error {code}"),
    })
}

pub struct MockTransport {
    remote: Arc<MockRemote>,
    open: AtomicBool,
    generation: usize,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, command: &Command, timeout: Duration) -> Result<Value> {
        if !self.is_open() {
            return Err(TransportError::Closed.into());
        }
        self.remote.handle(command, timeout).await
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.remote.generation.load(Ordering::SeqCst) == self.generation
    }
}

pub struct MockConnector {
    remote: Arc<MockRemote>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        if self.remote.refuse_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("connection refused".into()).into());
        }
        self.remote.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockTransport {
            remote: Arc::clone(&self.remote),
            open: AtomicBool::new(true),
            generation: self.remote.generation.load(Ordering::SeqCst),
        }))
    }
}

/// A manager wired to `remote`.
pub fn manager(remote: &Arc<MockRemote>) -> SessionManager {
    SessionManager::new(Arc::new(MockConnector {
        remote: Arc::clone(remote),
    }))
}

/// Create a session with default options and return its id.
pub async fn active_session(manager: &SessionManager) -> SandboxId {
    session_with(manager, SessionConfig::default()).await
}

pub async fn session_with(manager: &SessionManager, config: SessionConfig) -> SandboxId {
    manager
        .create(config)
        .await
        .expect("create should succeed")
        .id()
        .clone()
}
