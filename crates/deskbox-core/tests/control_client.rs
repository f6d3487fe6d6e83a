//! Wire client tests against a loopback fake agent.

use deskbox_core::{
    error_codes, ClientConfig, Command, ControlClient, DeskError, SandboxId, SessionConfig,
    SessionManager, SessionState, Transport,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> Framed<TcpStream, LinesCodec> {
    let (stream, _) = listener.accept().await.unwrap();
    Framed::new(stream, LinesCodec::new())
}

async fn read_request(conn: &mut Framed<TcpStream, LinesCodec>) -> (u64, String) {
    let line = conn.next().await.unwrap().unwrap();
    let request: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(request["jsonrpc"], "2.0");
    (
        request["id"].as_u64().unwrap(),
        request["method"].as_str().unwrap().to_string(),
    )
}

async fn reply(conn: &mut Framed<TcpStream, LinesCodec>, id: u64, result: Value) {
    let line = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
    conn.send(line).await.unwrap();
}

fn sbx() -> SandboxId {
    SandboxId::from("sbx-1")
}

#[tokio::test]
async fn test_out_of_order_responses_are_correlated() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut conn = accept(&listener).await;
        let (first_id, first_method) = read_request(&mut conn).await;
        let (second_id, second_method) = read_request(&mut conn).await;
        reply(&mut conn, second_id, json!({"method": second_method})).await;
        reply(&mut conn, first_id, json!({"method": first_method})).await;
        // Keep the connection open until the client is done.
        let _ = conn.next().await;
    });

    let client = ControlClient::connect(&addr, TIMEOUT).await.unwrap();
    let size = Command::GetScreenSize { sandbox_id: sbx() };
    let shot = Command::TakeScreenshot { sandbox_id: sbx() };
    let (a, b) = tokio::join!(client.send(&size, TIMEOUT), client.send(&shot, TIMEOUT));

    assert_eq!(a.unwrap()["method"], "get_screen_size");
    assert_eq!(b.unwrap()["method"], "take_screenshot");
    assert_eq!(client.in_flight(), 0);

    client.close();
    server.await.unwrap();
}

#[tokio::test]
async fn test_late_response_is_discarded() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut conn = accept(&listener).await;
        let (slow_id, _) = read_request(&mut conn).await;
        let (ping_id, method) = read_request(&mut conn).await;
        assert_eq!(method, "ping");
        reply(&mut conn, slow_id, json!({"late": true})).await;
        reply(&mut conn, ping_id, json!({"pong": true})).await;
        let _ = conn.next().await;
    });

    let client = ControlClient::connect(&addr, TIMEOUT).await.unwrap();
    let err = client
        .send(&Command::TakeScreenshot { sandbox_id: sbx() }, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(client.in_flight(), 0);

    let pong = client.send(&Command::Ping, TIMEOUT).await.unwrap();
    assert_eq!(pong, json!({"pong": true}));

    client.close();
    server.await.unwrap();
}

#[tokio::test]
async fn test_error_object_maps_to_remote() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut conn = accept(&listener).await;
        let (id, _) = read_request(&mut conn).await;
        let line = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": error_codes::SESSION_NOT_FOUND, "message": "sandbox not found: sbx-1"}
        })
        .to_string();
        conn.send(line).await.unwrap();
        let _ = conn.next().await;
    });

    let client = ControlClient::connect(&addr, TIMEOUT).await.unwrap();
    let err = client
        .send(&Command::Kill { sandbox_id: sbx() }, TIMEOUT)
        .await
        .unwrap_err();
    match err {
        DeskError::Remote { code, message } => {
            assert_eq!(code, error_codes::SESSION_NOT_FOUND);
            assert!(message.contains("sbx-1"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    client.close();
    server.await.unwrap();
}

#[tokio::test]
async fn test_peer_close_fails_outstanding_request() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut conn = accept(&listener).await;
        let _ = read_request(&mut conn).await;
        drop(conn);
    });

    let client = ControlClient::connect(&addr, TIMEOUT).await.unwrap();
    let err = client
        .send(&Command::LeftClick { sandbox_id: sbx() }, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, DeskError::Transport(_)), "unexpected error: {err:?}");
    assert!(!err.is_timeout());
    assert!(!client.is_open());
    server.await.unwrap();
}

#[tokio::test]
async fn test_send_after_close() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut conn = accept(&listener).await;
        let _ = conn.next().await;
    });

    let client = ControlClient::connect(&addr, TIMEOUT).await.unwrap();
    client.close();
    let err = client.send(&Command::Ping, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, DeskError::Transport(_)));
    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn test_connect_gives_up_after_timeout() {
    let (listener, addr) = listen().await;
    drop(listener);

    let err = ControlClient::connect(&addr, Duration::from_millis(250))
        .await
        .err()
        .unwrap();
    assert!(err.is_timeout());
}

/// Answers every request like a healthy agent would.
async fn serve_agent(listener: TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let mut conn = Framed::new(stream, LinesCodec::new());
            while let Some(Ok(line)) = conn.next().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let id = request["id"].as_u64().unwrap();
                let result = match request["method"].as_str().unwrap() {
                    "ping" => json!({"pong": true}),
                    "create_session" => json!({"sandbox_id": "sbx-tcp"}),
                    "get_screen_size" => json!({"width": 800, "height": 600}),
                    _ => json!({"ok": true}),
                };
                let line = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
                if conn.send(line).await.is_err() {
                    return;
                }
            }
        });
    }
}

#[tokio::test]
async fn test_manager_over_tcp() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(serve_agent(listener));

    let manager = SessionManager::connect(ClientConfig::new(addr));
    let session = manager.create(SessionConfig::default()).await.unwrap();
    let id = session.id().clone();
    assert_eq!(id.as_str(), "sbx-tcp");

    manager.input().move_mouse(&id, 10, 10).await.unwrap();
    let size = manager.display().screen_size(&id).await.unwrap();
    assert_eq!((size.width, size.height), (800, 600));

    manager.kill(&id).await.unwrap();
    assert_eq!(manager.session(&id).unwrap().state(), SessionState::Terminated);
    server.abort();
}

#[tokio::test]
async fn test_kill_after_agent_drops_session_channel() {
    let (listener, addr) = listen().await;
    let kills = Arc::new(AtomicUsize::new(0));
    let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel();

    let counter = Arc::clone(&kills);
    let server = tokio::spawn(async move {
        // First connection: handshake and create, then hang up.
        let mut conn = accept(&listener).await;
        let (id, _) = read_request(&mut conn).await;
        reply(&mut conn, id, json!({"pong": true})).await;
        let (id, method) = read_request(&mut conn).await;
        assert_eq!(method, "create_session");
        reply(&mut conn, id, json!({"sandbox_id": "sbx-dropped"})).await;
        drop(conn);
        let _ = dropped_tx.send(());

        let mut conn = accept(&listener).await;
        while let Some(Ok(line)) = conn.next().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let id = request["id"].as_u64().unwrap();
            let result = match request["method"].as_str().unwrap() {
                "ping" => json!({"pong": true}),
                "kill" => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    json!({"ok": true})
                }
                other => panic!("unexpected method {other}"),
            };
            reply(&mut conn, id, result).await;
        }
    });

    let manager = SessionManager::connect(ClientConfig::new(addr));
    let session = manager.create(SessionConfig::default()).await.unwrap();
    let id = session.id().clone();
    dropped_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.kill(&id).await.unwrap();
    assert_eq!(manager.session(&id).unwrap().state(), SessionState::Terminated);
    assert_eq!(kills.load(Ordering::SeqCst), 1);

    server.await.unwrap();
}
