//! Integration tests for the session controller state machine.
//!
//! Drives a `SessionController` against the fake sandbox and an
//! in-memory database, checking status transitions, idempotency,
//! authorization, persistence, and emitted events.

use std::sync::Arc;
use std::time::Duration;

use sandbox_controller::events::EventKind;
use sandbox_controller::models::session::SessionStatus;
use sandbox_controller::orchestrator::SessionController;
use sandbox_controller::persistence::db::{self, Database};
use sandbox_controller::persistence::session_repo::SessionRepo;
use sandbox_controller::AppError;

use super::test_helpers::{
    alice, bob, eventually, harness, harness_on, operator, settings, Harness,
};

// ── Create ────────────────────────────────────────────────────

#[tokio::test]
async fn create_persists_created_record_owned_by_caller() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());

    let record = controller.create(&alice()).await.expect("create");

    assert_eq!(record.status, SessionStatus::Created);
    assert_eq!(record.owner, "alice");
    assert_eq!(record.created_at, record.last_seen);
    assert!(record.error_message.is_none());

    let stored = h
        .repo
        .get_by_id(&record.session_id)
        .await
        .expect("query")
        .expect("record persisted");
    assert_eq!(stored, record);
    assert_eq!(h.events.kinds(), vec![EventKind::SessionCreated]);
}

#[tokio::test]
async fn second_create_conflicts_and_leaves_record_untouched() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    let original = controller.create(&alice()).await.expect("create");

    h.clock.advance(Duration::from_secs(10));
    let err = controller.create(&alice()).await.expect_err("second create");
    assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");

    let status = controller.status(&alice()).expect("status");
    assert_eq!(status, original);
    let stored = h.repo.get_by_id(&original.session_id).await.unwrap().unwrap();
    assert_eq!(stored, original);
}

#[tokio::test]
async fn create_by_another_user_on_existing_record_conflicts() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.expect("create");

    let err = controller.create(&bob()).await.expect_err("conflict");
    assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");
}

// ── Start ─────────────────────────────────────────────────────

#[tokio::test]
async fn start_without_record_is_not_found_and_creates_nothing() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());

    let err = controller.start(&alice()).await.expect_err("no record");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
    assert_eq!(h.sandbox.starts(), 0);
    assert!(h.repo.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn start_brings_session_to_running() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();

    h.clock.advance(Duration::from_secs(5));
    let record = controller.start(&alice()).await.expect("start");

    assert_eq!(record.status, SessionStatus::Running);
    assert!(record.last_seen > record.created_at);
    assert_eq!(h.sandbox.starts(), 1);
    assert!(h.sandbox.start_options()[0].enable_outbound_network);
    assert!(controller.idle_monitor_armed().await);

    let stored = h.repo.get_by_id(&record.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Running);
    assert_eq!(
        h.events.kinds(),
        vec![EventKind::SessionCreated, EventKind::SessionStarted]
    );
}

#[tokio::test]
async fn start_twice_does_not_restart_sandbox() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    let first = controller.start(&alice()).await.unwrap();

    h.clock.advance(Duration::from_secs(30));
    let second = controller.start(&alice()).await.expect("second start");

    assert_eq!(second.status, SessionStatus::Running);
    assert_eq!(h.sandbox.starts(), 1);
    assert!(second.last_seen > first.last_seen);
    assert_eq!(h.events.count(EventKind::SessionStarted), 1);

    let stored = h.repo.get_by_id(&second.session_id).await.unwrap().unwrap();
    assert_eq!(stored.last_seen, second.last_seen);
}

#[tokio::test]
async fn failed_start_records_error_and_surfaces_upstream() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    h.sandbox.fail_start(true);

    let err = controller.start(&alice()).await.expect_err("start fails");
    assert!(matches!(err, AppError::Upstream(ref msg) if msg == "image pull failed"), "got {err:?}");

    let status = controller.status(&alice()).unwrap();
    assert_eq!(status.status, SessionStatus::Error);
    assert_eq!(status.error_message.as_deref(), Some("image pull failed"));
    assert!(!controller.idle_monitor_armed().await);

    let events = h.events.events();
    let last = events.last().expect("error event");
    assert_eq!(last.event, EventKind::Error);
    assert_eq!(last.message.as_deref(), Some("image pull failed"));
}

#[tokio::test]
async fn start_after_error_retries_and_clears_message() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    h.sandbox.fail_start(true);
    let _ = controller.start(&alice()).await;

    h.sandbox.fail_start(false);
    let record = controller.start(&alice()).await.expect("retry");

    assert_eq!(record.status, SessionStatus::Running);
    assert!(record.error_message.is_none());
    assert_eq!(h.sandbox.starts(), 2);
}

#[tokio::test]
async fn status_does_not_wait_for_in_flight_start() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    h.sandbox.set_start_delay(Duration::from_millis(300));

    let starter = controller.clone();
    let start = tokio::spawn(async move { starter.start(&alice()).await });

    // Status is answered from the committed record while start is blocked.
    let observed = eventually(Duration::from_secs(2), || {
        let controller = controller.clone();
        async move {
            controller.status(&alice()).map(|r| r.status).ok() == Some(SessionStatus::Starting)
        }
    })
    .await;
    assert!(observed, "status should report starting while start is in flight");

    let record = start.await.unwrap().expect("start");
    assert_eq!(record.status, SessionStatus::Running);
}

#[tokio::test]
async fn concurrent_starts_boot_sandbox_once() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    h.sandbox.set_start_delay(Duration::from_millis(100));

    let a = controller.clone();
    let b = controller.clone();
    let owner = alice();
    let (first, second) = tokio::join!(a.start(&owner), b.start(&owner));

    assert_eq!(first.unwrap().status, SessionStatus::Running);
    assert_eq!(second.unwrap().status, SessionStatus::Running);
    assert_eq!(h.sandbox.starts(), 1);
}

// ── Stop ──────────────────────────────────────────────────────

#[tokio::test]
async fn stop_running_session_destroys_sandbox() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    controller.start(&alice()).await.unwrap();

    let record = controller.stop(&alice()).await.expect("stop");

    assert_eq!(record.status, SessionStatus::Stopped);
    assert_eq!(h.sandbox.destroys(), 1);
    assert!(!controller.idle_monitor_armed().await);
    assert_eq!(controller.open_stream_count().await, 0);

    let events = h.events.events();
    let stopped = events.last().unwrap();
    assert_eq!(stopped.event, EventKind::SessionStopped);
    assert_eq!(stopped.message.as_deref(), Some("stop requested"));
}

#[tokio::test]
async fn stop_when_already_stopped_is_a_no_op() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    controller.start(&alice()).await.unwrap();
    let first = controller.stop(&alice()).await.unwrap();

    h.clock.advance(Duration::from_secs(60));
    let second = controller.stop(&alice()).await.expect("second stop");

    assert_eq!(second, first);
    assert_eq!(h.sandbox.destroys(), 1);
    assert_eq!(h.events.count(EventKind::SessionStopped), 1);
}

#[tokio::test]
async fn stop_from_created_moves_to_stopped() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();

    let record = controller.stop(&alice()).await.expect("stop");
    assert_eq!(record.status, SessionStatus::Stopped);
}

#[tokio::test]
async fn stop_swallows_sandbox_destroy_failure() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    controller.start(&alice()).await.unwrap();
    h.sandbox.fail_destroy(true);

    let record = controller.stop(&alice()).await.expect("stop succeeds");
    assert_eq!(record.status, SessionStatus::Stopped);
    assert_eq!(h.sandbox.destroys(), 1);
}

#[tokio::test]
async fn stopped_session_can_be_started_again() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    controller.start(&alice()).await.unwrap();
    controller.stop(&alice()).await.unwrap();

    let record = controller.start(&alice()).await.expect("restart");
    assert_eq!(record.status, SessionStatus::Running);
    assert_eq!(h.sandbox.starts(), 2);
    assert!(controller.idle_monitor_armed().await);
}

// ── Destroy ───────────────────────────────────────────────────

#[tokio::test]
async fn destroy_removes_record_and_retires_controller() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    let record = controller.create(&alice()).await.unwrap();
    controller.start(&alice()).await.unwrap();

    controller.destroy(&alice()).await.expect("destroy");

    assert_eq!(h.sandbox.destroys(), 1);
    assert!(h.repo.get_by_id(&record.session_id).await.unwrap().is_none());
    assert!(!controller.idle_monitor_armed().await);
    assert_eq!(h.events.count(EventKind::SessionDestroyed), 1);

    let err = controller.status(&alice()).expect_err("gone");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
    let err = controller.start(&alice()).await.expect_err("retired");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
    let err = controller.create(&alice()).await.expect_err("retired");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn destroy_of_stopped_session_skips_sandbox_destroy() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    controller.start(&alice()).await.unwrap();
    controller.stop(&alice()).await.unwrap();

    controller.destroy(&alice()).await.expect("destroy");
    assert_eq!(h.sandbox.destroys(), 1);
}

// ── Authorization ─────────────────────────────────────────────

#[tokio::test]
async fn non_owner_is_forbidden_for_every_operation() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    let record = controller.create(&alice()).await.unwrap();
    controller.start(&alice()).await.unwrap();
    let events_before = h.events.events().len();

    let intruder = bob();
    assert!(matches!(controller.status(&intruder), Err(AppError::Forbidden(_))));
    assert!(matches!(controller.start(&intruder).await, Err(AppError::Forbidden(_))));
    assert!(matches!(controller.stop(&intruder).await, Err(AppError::Forbidden(_))));
    assert!(matches!(
        controller.open_stream(&intruder, Vec::new()).await,
        Err(AppError::Forbidden(_))
    ));
    assert!(matches!(controller.destroy(&intruder).await, Err(AppError::Forbidden(_))));

    let stored = h.repo.get_by_id(&record.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Running);
    assert_eq!(h.sandbox.destroys(), 0);
    assert_eq!(h.sandbox.streams_opened(), 0);
    assert_eq!(h.events.events().len(), events_before);
}

#[tokio::test]
async fn forbidden_message_reveals_nothing_about_session() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    let record = controller.create(&alice()).await.unwrap();

    let err = controller.status(&bob()).expect_err("forbidden");
    let text = err.to_string();
    assert!(!text.contains(&record.session_id));
    assert!(!text.contains("alice"));
    assert!(!text.contains("created"));
}

#[tokio::test]
async fn admin_group_member_may_operate_on_any_session() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();

    let admin = operator();
    assert_eq!(controller.start(&admin).await.unwrap().status, SessionStatus::Running);
    assert_eq!(controller.status(&admin).unwrap().owner, "alice");
    assert_eq!(controller.stop(&admin).await.unwrap().status, SessionStatus::Stopped);
    controller.destroy(&admin).await.expect("admin destroy");
}

#[tokio::test]
async fn owner_is_never_changed_by_other_callers() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    controller.start(&operator()).await.unwrap();
    controller.stop(&operator()).await.unwrap();

    assert_eq!(controller.status(&alice()).unwrap().owner, "alice");
}

// ── Transition graph ──────────────────────────────────────────

#[tokio::test]
async fn operation_sequences_only_visit_reachable_states() {
    let h = harness().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();

    let mut seen = vec![controller.status(&alice()).unwrap().status];
    for step in 0..12 {
        h.sandbox.fail_start(step % 5 == 3);
        let _ = match step % 3 {
            0 | 1 => controller.start(&alice()).await.map(|_| ()),
            _ => controller.stop(&alice()).await.map(|_| ()),
        };
        let _ = controller.open_stream(&alice(), Vec::new()).await;
        seen.push(controller.status(&alice()).unwrap().status);
    }

    for pair in seen.windows(2) {
        let allowed = pair[0] == pair[1]
            || matches!(
                (pair[0], pair[1]),
                (
                    SessionStatus::Created | SessionStatus::Stopped | SessionStatus::Error,
                    SessionStatus::Running | SessionStatus::Error
                ) | (
                    SessionStatus::Running | SessionStatus::Error | SessionStatus::Created,
                    SessionStatus::Stopped
                )
            );
        assert!(allowed, "unexpected transition {:?} -> {:?}", pair[0], pair[1]);
    }
}

// ── Store failures ────────────────────────────────────────────

/// Harness plus a handle on its pool, so a test can close it mid-flight.
async fn harness_with_pool() -> (Harness, Database) {
    let pool = db::connect_memory().await.expect("in-memory db");
    let h = harness_on(SessionRepo::new(Arc::new(pool.clone())), settings());
    (h, pool)
}

#[tokio::test]
async fn failed_delete_after_quiesce_leaves_session_stopped() {
    let (h, pool) = harness_with_pool().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    controller.start(&alice()).await.unwrap();
    pool.close().await;

    let err = controller.destroy(&alice()).await.expect_err("store closed");
    assert!(matches!(err, AppError::Db(_)), "got {err:?}");

    assert_eq!(h.sandbox.destroys(), 1);
    assert!(!controller.idle_monitor_armed().await);
    assert_eq!(controller.status(&alice()).unwrap().status, SessionStatus::Stopped);

    // A retry only repeats the delete; the sandbox is not torn down twice.
    let err = controller.destroy(&alice()).await.expect_err("store still closed");
    assert!(matches!(err, AppError::Db(_)), "got {err:?}");
    assert_eq!(h.sandbox.destroys(), 1);
}

#[tokio::test]
async fn failed_stop_write_still_reports_stopped() {
    let (h, pool) = harness_with_pool().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    controller.start(&alice()).await.unwrap();
    pool.close().await;

    let err = controller.stop(&alice()).await.expect_err("store closed");
    assert!(matches!(err, AppError::Db(_)), "got {err:?}");

    assert_eq!(h.sandbox.destroys(), 1);
    assert_eq!(controller.status(&alice()).unwrap().status, SessionStatus::Stopped);
    assert_eq!(h.events.count(EventKind::SessionStopped), 1);

    let err = controller
        .open_stream(&alice(), Vec::new())
        .await
        .err()
        .expect("stopped session refuses streams");
    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");
}

#[tokio::test]
async fn failed_running_write_destroys_fresh_sandbox() {
    let (h, pool) = harness_with_pool().await;
    let controller = SessionController::new(h.ctx.clone());
    controller.create(&alice()).await.unwrap();
    h.sandbox.set_start_delay(Duration::from_millis(200));

    let starter = controller.clone();
    let start = tokio::spawn(async move { starter.start(&alice()).await });
    let starting = eventually(Duration::from_secs(2), || {
        let controller = controller.clone();
        async move {
            controller.status(&alice()).map(|r| r.status).ok() == Some(SessionStatus::Starting)
        }
    })
    .await;
    assert!(starting, "start should commit Starting before booting");
    pool.close().await;

    let err = start.await.unwrap().expect_err("running state not persisted");
    assert!(matches!(err, AppError::Db(_)), "got {err:?}");

    assert_eq!(h.sandbox.starts(), 1);
    assert_eq!(h.sandbox.destroys(), 1);
    assert!(!controller.idle_monitor_armed().await);

    let status = controller.status(&alice()).unwrap();
    assert_eq!(status.status, SessionStatus::Error);
    assert!(status.error_message.is_some());
    assert_eq!(h.events.count(EventKind::SessionStarted), 0);
    assert_eq!(h.events.count(EventKind::Error), 1);
}
