//! Unit tests for the bidirectional frame relay.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use sandbox_controller::relay::{
    self, CloseReason, Endpoint, Frame, Leg, RelayOutcome, INTERNAL_ERROR, NORMAL_CLOSURE,
};
use sandbox_controller::AppError;

struct Rig {
    browser: Endpoint,
    sandbox: Endpoint,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<RelayOutcome>,
}

fn rig() -> Rig {
    let (browser, client_leg) = relay::duplex(8);
    let (sandbox_leg, sandbox) = relay::duplex(8);
    let cancel = CancellationToken::new();
    let relay_cancel = cancel.clone();
    let task = tokio::spawn(async move { relay::run(client_leg, sandbox_leg, &relay_cancel).await });
    Rig {
        browser,
        sandbox,
        cancel,
        task,
    }
}

async fn recv(endpoint: &mut Endpoint) -> Option<Frame> {
    tokio::time::timeout(Duration::from_secs(2), endpoint.stream.next())
        .await
        .expect("no frame within timeout")
        .map(|frame| frame.expect("frame ok"))
}

#[tokio::test]
async fn frames_flow_both_ways_unmodified() {
    let mut rig = rig();

    let keys = Bytes::from_static(b"ls -la\r");
    rig.browser.sink.send(Frame::Binary(keys.clone())).await.unwrap();
    assert_eq!(recv(&mut rig.sandbox).await, Some(Frame::Binary(keys)));

    let screen = Bytes::from(vec![0u8, 1, 2, 0x1b, 0xff]);
    rig.sandbox.sink.send(Frame::Binary(screen.clone())).await.unwrap();
    assert_eq!(recv(&mut rig.browser).await, Some(Frame::Binary(screen)));

    let resize = "\u{1}{\"columns\":80,\"rows\":24}".to_owned();
    rig.browser.sink.send(Frame::Text(resize.clone())).await.unwrap();
    assert_eq!(recv(&mut rig.sandbox).await, Some(Frame::Text(resize)));
}

#[tokio::test]
async fn cancellation_closes_both_legs_normally() {
    let mut rig = rig();
    rig.cancel.cancel();

    let outcome = rig.task.await.unwrap();
    assert!(matches!(outcome, RelayOutcome::Stopped));

    for endpoint in [&mut rig.browser, &mut rig.sandbox] {
        match recv(endpoint).await {
            Some(Frame::Close(Some(reason))) => assert_eq!(reason.code, NORMAL_CLOSURE),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(recv(endpoint).await, None);
    }
}

#[tokio::test]
async fn client_close_is_forwarded_to_sandbox() {
    let mut rig = rig();
    let reason = CloseReason::normal("tab closed");
    rig.browser
        .sink
        .send(Frame::Close(Some(reason.clone())))
        .await
        .unwrap();

    assert_eq!(recv(&mut rig.sandbox).await, Some(Frame::Close(Some(reason))));
    let outcome = rig.task.await.unwrap();
    assert!(matches!(outcome, RelayOutcome::Closed { by: Leg::Client }));
}

#[tokio::test]
async fn sandbox_eof_closes_client() {
    let mut rig = rig();
    drop(rig.sandbox);

    match recv(&mut rig.browser).await {
        Some(Frame::Close(Some(reason))) => assert_eq!(reason.reason, "sandbox closed"),
        other => panic!("expected close frame, got {other:?}"),
    }
    let outcome = rig.task.await.unwrap();
    assert_eq!(outcome.describe(), "sandbox closed");
}

#[tokio::test]
async fn outcome_descriptions_name_the_leg() {
    let failed = RelayOutcome::Failed {
        leg: Leg::Sandbox,
        error: AppError::Upstream("Reset By Peer".into()),
    };
    assert_eq!(failed.describe(), "sandbox leg failed: upstream: Reset By Peer");
    assert_eq!(RelayOutcome::Stopped.describe(), "stopped by controller");
    assert_eq!(RelayOutcome::Closed { by: Leg::Client }.describe(), "client closed");
}

/// Replace an endpoint's incoming frames with a fixed script.
fn scripted(endpoint: Endpoint, script: Vec<sandbox_controller::Result<Frame>>) -> Endpoint {
    Endpoint {
        sink: endpoint.sink,
        stream: Box::pin(futures_util::stream::iter(script)),
    }
}

#[tokio::test]
async fn sandbox_read_error_fails_relay_and_closes_client() {
    let (mut browser, client_leg) = relay::duplex(8);
    let (sandbox_leg, _sandbox) = relay::duplex(8);
    let output = Bytes::from_static(b"$ ");
    let sandbox_leg = scripted(
        sandbox_leg,
        vec![
            Ok(Frame::Binary(output.clone())),
            Err(AppError::Upstream("connection reset".into())),
        ],
    );

    let outcome = relay::run(client_leg, sandbox_leg, &CancellationToken::new()).await;

    match outcome {
        RelayOutcome::Failed { leg, error } => {
            assert_eq!(leg, Leg::Sandbox);
            assert!(matches!(error, AppError::Upstream(_)), "got {error:?}");
        }
        other => panic!("expected sandbox failure, got {other:?}"),
    }
    assert_eq!(recv(&mut browser).await, Some(Frame::Binary(output)));
    match recv(&mut browser).await {
        Some(Frame::Close(Some(reason))) => assert_eq!(reason.code, INTERNAL_ERROR),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn client_read_error_fails_relay_and_closes_sandbox() {
    let (_browser, client_leg) = relay::duplex(8);
    let (sandbox_leg, mut sandbox) = relay::duplex(8);
    let client_leg = scripted(client_leg, vec![Err(AppError::Io("client stream: reset".into()))]);

    let outcome = relay::run(client_leg, sandbox_leg, &CancellationToken::new()).await;

    assert!(
        matches!(outcome, RelayOutcome::Failed { leg: Leg::Client, .. }),
        "got {outcome:?}"
    );
    match recv(&mut sandbox).await {
        Some(Frame::Close(Some(reason))) => {
            assert_eq!(reason.code, NORMAL_CLOSURE);
            assert_eq!(reason.reason, "client disconnected");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}
