//! JSON-RPC client for the sandbox control endpoint.
//!
//! This module implements the TCP connection and the newline-delimited
//! JSON-RPC exchange. Requests are multiplexed over one connection: a writer
//! task serializes outbound lines and a reader task routes each response to
//! the waiting caller by its request id.

use crate::config::ClientConfig;
use crate::error::{DeskError, Result, TransportError};
use crate::protocol::{Command, RpcResponse};
use crate::transport::{Connector, Transport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Interval between connection retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for a single response line (screenshots are inlined as base64).
const MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

fn lock_pending(
    pending: &Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>,
) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<RpcResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a pending entry when the waiting call finishes, times out or is
/// dropped, so a late response finds nobody and is discarded.
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

/// Client for the sandbox control endpoint.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Dropping the
/// client (or calling [`close`](Transport::close)) stops its I/O tasks.
pub struct ControlClient {
    peer: String,
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    open: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlClient {
    /// Connect to the control endpoint.
    ///
    /// The connection will be retried every 100ms until `connect_timeout`
    /// elapses, to tolerate an endpoint that is still starting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if no connection could be
    /// established within the timeout.
    pub async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        tracing::debug!(endpoint = %endpoint, "Connecting to control endpoint");

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match TcpStream::connect(endpoint).await {
                Ok(stream) => {
                    tracing::info!(
                        endpoint = %endpoint,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "Connected to control endpoint"
                    );
                    return Ok(Self::from_stream(endpoint.to_string(), stream));
                }
                Err(e) => {
                    if start.elapsed() >= connect_timeout {
                        tracing::warn!(
                            endpoint = %endpoint,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            attempts,
                            error = %e,
                            "Control endpoint connection timeout"
                        );
                        return Err(TransportError::Timeout(connect_timeout).into());
                    }
                    tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying...");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Wrap an already-connected stream and start the I/O tasks.
    pub fn from_stream(peer: String, stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));
        let (outbound, rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, LinesCodec::new()),
            rx,
            Arc::clone(&pending),
            Arc::clone(&open),
        ));
        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            Arc::clone(&pending),
            Arc::clone(&open),
        ));

        Self {
            peer,
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            open,
            tasks: Mutex::new(vec![writer, reader]),
        }
    }

    /// Remote address this client talks to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Number of requests currently waiting for a response.
    pub fn in_flight(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Ping the endpoint to check it is responsive.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let _ = self.send(&Command::Ping, timeout).await?;
        Ok(())
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for ControlClient {
    async fn send(&self, command: &Command, timeout: Duration) -> Result<Value> {
        if !self.is_open() {
            return Err(TransportError::Closed.into());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = command.method();
        let line = serde_json::to_string(&command.to_request(id)?)?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        tracing::debug!(method = %method, id, "Sending RPC request");
        tracing::trace!(request = %line, "RPC request body");
        self.outbound
            .send(line)
            .map_err(|_| TransportError::Closed)?;

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                tracing::warn!(method = %method, id, "Connection closed while awaiting response");
                return Err(TransportError::Closed.into());
            }
            Err(_) => {
                tracing::warn!(
                    method = %method,
                    id,
                    timeout_ms = timeout.as_millis() as u64,
                    "RPC response timeout"
                );
                return Err(TransportError::Timeout(timeout).into());
            }
        };

        if let Some(error) = response.error {
            tracing::debug!(method = %method, id, code = error.code, message = %error.message, "RPC error response");
            return Err(DeskError::Remote {
                code: error.code,
                message: error.message,
            });
        }

        tracing::debug!(method = %method, id, "RPC call successful");
        response
            .result
            .ok_or_else(|| DeskError::Protocol("missing result in response".into()))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::debug!(peer = %self.peer, "Closing control connection");
        }
        self.abort_tasks();
        lock_pending(&self.pending).clear();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, LinesCodec>,
    mut rx: mpsc::UnboundedReceiver<String>,
    pending: PendingMap,
    open: Arc<AtomicBool>,
) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            tracing::warn!(error = %e, "Control connection write failed");
            break;
        }
    }
    open.store(false, Ordering::SeqCst);
    lock_pending(&pending).clear();
    tracing::trace!("Writer task exited");
}

async fn read_loop(
    mut lines: FramedRead<OwnedReadHalf, LinesCodec>,
    pending: PendingMap,
    open: Arc<AtomicBool>,
) {
    while let Some(frame) = lines.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Control connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        tracing::trace!(response = %line, "RPC response body");

        let response: RpcResponse = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed response");
                continue;
            }
        };
        let Some(id) = response.id else {
            tracing::warn!(error = ?response.error, "Discarding response without id");
            continue;
        };

        let waiter = lock_pending(&pending).remove(&id);
        match waiter {
            Some(tx) => {
                // Receiver gone means the caller was cancelled after we looked it up.
                let _ = tx.send(response);
            }
            None => tracing::debug!(id, "Discarding response for abandoned request"),
        }
    }
    open.store(false, Ordering::SeqCst);
    lock_pending(&pending).clear();
    tracing::debug!("Control connection closed by peer");
}

/// [`Connector`] that opens a [`ControlClient`] per session.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: ClientConfig,
}

impl TcpConnector {
    /// Create a connector for the given endpoint configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Endpoint configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let client = ControlClient::connect(&self.config.endpoint, self.config.connect_timeout).await?;
        // Verify the endpoint answers before handing the channel out
        if let Err(e) = client.ping(self.config.handshake_timeout).await {
            client.close();
            return Err(e);
        }
        Ok(Arc::new(client))
    }
}
