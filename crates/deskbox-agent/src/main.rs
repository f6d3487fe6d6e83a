//! deskbox-agent: remote control endpoint for deskbox sandboxes.
//!
//! Listens on TCP and handles newline-delimited JSON-RPC requests that
//! provision X11 desktops, drive their pointer and keyboard, capture them
//! and stream them over noVNC.

mod config;
mod desktop;
mod error;
mod exec;
mod handler;
mod keys;
mod protocol;

use config::AgentConfig;
use desktop::DesktopHost;
use futures::{SinkExt, StreamExt};
use handler::{is_input_method, Handler};
use protocol::{error_codes, Request, Response};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Largest request line accepted (8 MiB).
const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Responses buffered per connection before request handling waits.
const RESPONSE_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("deskbox-agent starting...");

    let config = AgentConfig::from_env();
    config.validate_warn();

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(
        addr = %config.listen_addr,
        public_host = %config.public_host,
        max_sessions = config.max_sessions,
        "listening for connections"
    );

    let host = Arc::new(DesktopHost::new(config));
    let handler = Handler::new(Arc::clone(&host));

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "accepted new connection");
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            warn!(peer = %addr, error = %e, "connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!(desktops = host.count().await, "shutdown requested, killing desktops");
                host.shutdown().await;
                break;
            }
        }
    }

    info!("deskbox-agent stopped");
    Ok(())
}

/// Handle a single client connection.
///
/// Input requests are handled one at a time in arrival order. Everything
/// else runs concurrently, so responses may come back out of order.
async fn handle_connection(
    stream: TcpStream,
    handler: Handler,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (mut sink, mut lines) = framed.split();

    let (response_tx, mut response_rx) = mpsc::channel::<Response>(RESPONSE_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            let json = match serde_json::to_string(&response) {
                Ok(json) => json,
                Err(e) => {
                    error!(id = response.id, error = %e, "failed to serialize response");
                    continue;
                }
            };
            debug!(id = response.id, len = json.len(), "sending response");
            if let Err(e) = sink.send(json).await {
                warn!(error = %e, "failed to write response");
                break;
            }
        }
    });

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Request>();
    let input_worker = {
        let handler = handler.clone();
        let response_tx = response_tx.clone();
        tokio::spawn(async move {
            while let Some(req) = input_rx.recv().await {
                let response = handler.handle_request(req).await;
                if response_tx.send(response).await.is_err() {
                    break;
                }
            }
        })
    };

    while let Some(line) = lines.next().await {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let req = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                let response =
                    Response::error(0, error_codes::PARSE_ERROR, format!("parse error: {}", e));
                if response_tx.send(response).await.is_err() {
                    break;
                }
                continue;
            }
        };
        debug!(id = req.id, method = %req.method, "received request");

        if is_input_method(&req.method) {
            if input_tx.send(req).is_err() {
                break;
            }
        } else {
            let handler = handler.clone();
            let response_tx = response_tx.clone();
            tokio::spawn(async move {
                let response = handler.handle_request(req).await;
                let _ = response_tx.send(response).await;
            });
        }
    }

    debug!("client disconnected");
    drop(input_tx);
    drop(response_tx);
    if let Err(e) = input_worker.await {
        warn!(error = %e, "input worker failed");
    }
    if let Err(e) = writer.await {
        warn!(error = %e, "response writer failed");
    }
    Ok(())
}
