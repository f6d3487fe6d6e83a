//! Input dispatch: submission order, composite gestures, timeouts.

mod common;

use common::{active_session, manager, remote_error, MockRemote};
use deskbox_core::{
    error_codes, Command, CursorPosition, DeskError, InputCommand, MouseButton, SandboxId,
    ScrollDirection, SessionState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn input_methods(remote: &MockRemote) -> Vec<&'static str> {
    remote
        .methods()
        .into_iter()
        .filter(|m| *m != "create_session")
        .collect()
}

#[tokio::test]
async fn test_click_waits_for_slow_move() {
    let remote = MockRemote::new();
    remote.delay("move_mouse", Duration::from_millis(100));
    let manager = manager(&remote);
    let id = active_session(&manager).await;
    let input = manager.input();

    let (moved, clicked) = tokio::join!(input.move_mouse(&id, 10, 20), input.left_click(&id));
    moved.unwrap();
    clicked.unwrap();

    assert_eq!(input_methods(&remote), vec!["move_mouse", "left_click"]);
}

#[tokio::test]
async fn test_cursor_query_sees_prior_moves() {
    let remote = MockRemote::new();
    remote.delay("move_mouse", Duration::from_millis(50));
    let manager = manager(&remote);
    let id = active_session(&manager).await;
    let input = manager.input();

    let (_, _, position) = tokio::join!(
        input.move_mouse(&id, 5, 5),
        input.move_mouse(&id, 300, 200),
        input.get_cursor_position(&id)
    );
    assert_eq!(position.unwrap(), CursorPosition { x: 300, y: 200 });
}

#[tokio::test]
async fn test_order_holds_across_dispatcher_clones() {
    let remote = MockRemote::new();
    remote.delay("move_mouse", Duration::from_millis(30));
    let manager = manager(&remote);
    let id = active_session(&manager).await;
    let first = manager.input();
    let second = manager.input();

    let (a, b, c) = tokio::join!(
        first.move_mouse(&id, 1, 1),
        second.right_click(&id),
        first.scroll(&id, ScrollDirection::Up, 3)
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(input_methods(&remote), vec!["move_mouse", "right_click", "scroll"]);
}

#[tokio::test]
async fn test_drag_is_one_sequence() {
    let remote = MockRemote::new();
    remote.delay("mouse_press", Duration::from_millis(30));
    let manager = manager(&remote);
    let id = active_session(&manager).await;
    let input = manager.input();

    let (dragged, clicked) = tokio::join!(input.drag(&id, (1, 2), (30, 40)), input.left_click(&id));
    dragged.unwrap();
    clicked.unwrap();

    let sandbox_id = id.clone();
    let calls: Vec<Command> = remote
        .calls()
        .into_iter()
        .filter(|c| !matches!(c, Command::CreateSession(_)))
        .collect();
    assert_eq!(
        calls,
        vec![
            Command::MoveMouse { sandbox_id: sandbox_id.clone(), x: 1, y: 2 },
            Command::MousePress { sandbox_id: sandbox_id.clone(), button: MouseButton::Left },
            Command::MoveMouse { sandbox_id: sandbox_id.clone(), x: 30, y: 40 },
            Command::MouseRelease { sandbox_id: sandbox_id.clone(), button: MouseButton::Left },
            Command::LeftClick { sandbox_id },
        ]
    );
}

#[tokio::test]
async fn test_drag_releases_after_failed_move() {
    let remote = MockRemote::new();
    let moves = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&moves);
    remote.respond_with(move |c| match c {
        Command::MoveMouse { .. } if counter.fetch_add(1, Ordering::SeqCst) == 1 => {
            Some(remote_error(error_codes::INTERNAL_ERROR))
        }
        _ => None,
    });
    let manager = manager(&remote);
    let id = active_session(&manager).await;

    let err = manager.input().drag(&id, (0, 0), (9, 9)).await.unwrap_err();
    assert!(matches!(err, DeskError::Remote { .. }));
    assert_eq!(
        input_methods(&remote),
        vec!["move_mouse", "mouse_press", "move_mouse", "mouse_release"]
    );
}

#[tokio::test]
async fn test_write_sends_chunks() {
    let remote = MockRemote::new();
    let manager = manager(&remote);
    let id = active_session(&manager).await;

    let text = "abcdefghij".repeat(6);
    manager.input().write(&id, &text).await.unwrap();

    let chunks: Vec<(String, u32)> = remote
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Command::TypeText { text, delay_ms, .. } => Some((text, delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks.iter().map(|(t, _)| t.len()).collect::<Vec<_>>(), vec![25, 25, 10]);
    assert!(chunks.iter().all(|(_, delay)| *delay == 75));
    assert_eq!(chunks.iter().map(|(t, _)| t.as_str()).collect::<String>(), text);
}

#[tokio::test]
async fn test_press_and_open_forwarded() {
    let remote = MockRemote::new();
    let manager = manager(&remote);
    let id = active_session(&manager).await;
    let input = manager.input();

    input.press(&id, ["ctrl", "c"]).await.unwrap();
    input.open(&id, "https://example.com").await.unwrap();
    input
        .dispatch(&id, InputCommand::MousePress(MouseButton::Right))
        .await
        .unwrap();

    let calls = remote.calls();
    assert!(calls.contains(&Command::PressKeys {
        sandbox_id: id.clone(),
        keys: vec!["ctrl".into(), "c".into()],
    }));
    assert!(calls.contains(&Command::Open {
        sandbox_id: id.clone(),
        target: "https://example.com".into(),
    }));
    assert!(calls.contains(&Command::MousePress {
        sandbox_id: id,
        button: MouseButton::Right,
    }));
}

#[tokio::test]
async fn test_side_effecting_input_not_retried() {
    let remote = MockRemote::new();
    remote.delay("left_click", Duration::from_millis(500));
    let manager = manager(&remote);
    let id = active_session(&manager).await;

    let err = manager
        .input()
        .with_timeout(Duration::from_millis(50))
        .left_click(&id)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(remote.count("left_click"), 1);
    // A timeout says nothing about the sandbox.
    assert_eq!(manager.session(&id).unwrap().state(), SessionState::Active);
}

#[tokio::test]
async fn test_cancelled_input() {
    let remote = MockRemote::new();
    remote.delay("double_click", Duration::from_secs(5));
    let manager = manager(&remote);
    let id = active_session(&manager).await;

    let token = CancellationToken::new();
    let input = manager.input().with_cancellation(token.clone());
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let err = input.double_click(&id).await.unwrap_err();
    assert!(matches!(err, DeskError::Cancelled));
    trigger.await.unwrap();
}

#[tokio::test]
async fn test_queued_input_rejected_after_kill() {
    let remote = MockRemote::new();
    remote.delay("move_mouse", Duration::from_millis(50));
    let manager = manager(&remote);
    let id = active_session(&manager).await;
    let input = manager.input();

    let (moved, killed, clicked) = tokio::join!(
        input.move_mouse(&id, 1, 1),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.kill(&id).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            input.middle_click(&id).await
        }
    );
    moved.unwrap();
    killed.unwrap();
    assert!(matches!(
        clicked,
        Err(DeskError::InvalidSessionState { actual: SessionState::Terminated, .. })
    ));
    assert_eq!(remote.count("middle_click"), 0);
}

#[tokio::test]
async fn test_unknown_session() {
    let remote = MockRemote::new();
    let manager = manager(&remote);
    let err = manager
        .input()
        .left_click(&SandboxId::from("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeskError::UnknownSession(_)));
    assert!(remote.calls().is_empty());
}
