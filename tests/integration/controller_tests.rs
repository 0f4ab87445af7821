//! Integration tests for the execution controller using real `sh` children.
//!
//! Covers the graceful-stop protocol (stop signal, grace period, kill),
//! unexpected-exit routing, hook sequencing and the one-live-session rule.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use reloader::models::command::{CommandSpec, SessionConfig};
use reloader::models::outcome::{ExitOutcome, SignalKind};
use reloader::orchestrator::controller::{ExecutionController, SessionState};
use reloader::process::OsRunnableFactory;
use reloader::AppError;

use super::test_helpers::{is_running, options, read_lines, sh, wait_until, RecordingFactory};

const SIGINT: i32 = 2;
const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

// ── Graceful stop ───────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_before_grace_period_never_kills() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = RecordingFactory::default();
    let controller = ExecutionController::new(
        SessionConfig::new(CommandSpec::new("sleep", temp.path()).args(["100"])),
        Arc::new(factory.clone()),
        options(Duration::from_secs(5)),
    );

    let session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    let report = session.stopper.stop().await.expect("stop succeeds");

    assert_eq!(report.outcome, ExitOutcome::SignaledExit(SIGINT));
    assert!(!report.killed, "interrupt was enough, no kill expected");
    assert!(report.elapsed < Duration::from_secs(5));
    assert!(factory.kills().is_empty(), "kill must never be sent");
}

#[tokio::test]
async fn process_ignoring_interrupt_is_killed_once_after_grace_period() {
    let temp = tempfile::tempdir().expect("tempdir");
    let factory = RecordingFactory::default();
    let grace = Duration::from_secs(1);
    let controller = ExecutionController::new(
        SessionConfig::new(sh("trap '' INT; sleep 100", temp.path())),
        Arc::new(factory.clone()),
        options(grace),
    );

    let session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    let pgid = session.pgid.expect("main command has a process group");
    // Let the shell install its trap before the interrupt arrives.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let requested = Instant::now();
    let report = session
        .stopper
        .stop()
        .await
        .expect("a kill we sent is not an error");

    assert!(report.killed);
    assert_eq!(report.outcome, ExitOutcome::SignaledExit(SIGKILL));
    assert!(report.elapsed >= grace, "stopped after {:?}", report.elapsed);

    let kills = factory.kills();
    assert_eq!(kills.len(), 1, "exactly one kill signal");
    assert!(kills[0].program.starts_with("sh -c"));
    assert!(kills[0].at.duration_since(requested) >= grace);
    assert!(!is_running(pgid), "main command must be gone after stop");
}

#[tokio::test]
async fn terminate_stop_signal_reaches_background_children() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pid_file = temp.path().join("child.pid");
    let mut opts = options(Duration::from_secs(5));
    opts.stop_signal = SignalKind::Terminate;
    let controller = ExecutionController::new(
        SessionConfig::new(sh(
            "sleep 100 & echo $! > child.pid; wait",
            temp.path(),
        )),
        Arc::new(OsRunnableFactory),
        opts,
    );

    let session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    wait_until(|| !read_lines(&pid_file).is_empty()).await;
    let child_pid: u32 = read_lines(&pid_file)[0].trim().parse().expect("pid");
    assert!(is_running(child_pid));

    let report = session.stopper.stop().await.expect("stop");
    assert_eq!(report.outcome, ExitOutcome::SignaledExit(SIGTERM));

    wait_until(|| !is_running(child_pid)).await;
}

#[tokio::test]
async fn distinct_signal_is_a_stop_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    // Reacts to the interrupt by dying of a signal the controller never sent.
    let controller = ExecutionController::new(
        SessionConfig::new(sh(
            "trap 'trap - USR1; kill -USR1 $$' INT; while :; do sleep 0.05; done",
            temp.path(),
        )),
        Arc::new(OsRunnableFactory),
        options(Duration::from_secs(5)),
    );

    let session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = session.stopper.stop().await.expect_err("foreign signal");
    assert!(matches!(err, AppError::Stop(_)), "got {err}");
    assert_eq!(*controller.state().borrow(), SessionState::Failed);
}

// ── Unexpected exit routing ─────────────────────────────────────────────────

#[tokio::test]
async fn immediate_exit_fires_unexpected_exit_notice() {
    let temp = tempfile::tempdir().expect("tempdir");
    let controller = ExecutionController::new(
        SessionConfig::new(CommandSpec::new("true", temp.path())),
        Arc::new(OsRunnableFactory),
        options(Duration::from_secs(5)),
    );

    let mut session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    let outcome = tokio::time::timeout(Duration::from_secs(5), session.exit.recv())
        .await
        .expect("notice fires");
    assert_eq!(outcome, ExitOutcome::NormalExit(0));

    let report = session.stopper.stop().await.expect("stop after exit");
    assert_eq!(report.outcome, ExitOutcome::NormalExit(0));
    assert!(!report.killed);
}

#[tokio::test]
async fn stop_after_signal_death_releases_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let mut config = SessionConfig::new(sh("kill -TERM $$", dir));
    config.after_hooks = vec![sh("echo after >> hooks.log", dir)];
    let controller =
        ExecutionController::new(config, Arc::new(OsRunnableFactory), options(Duration::from_secs(5)));

    let mut session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    let outcome = tokio::time::timeout(Duration::from_secs(5), session.exit.recv())
        .await
        .expect("notice fires");
    assert_eq!(outcome, ExitOutcome::SignaledExit(SIGTERM));

    let report = session
        .stopper
        .stop()
        .await
        .expect("an exit already reported is not a stop failure");
    assert_eq!(report.outcome, ExitOutcome::SignaledExit(SIGTERM));
    assert!(!report.killed);
    assert_eq!(read_lines(&dir.join("hooks.log")), vec!["after"]);
    assert_eq!(*controller.state().borrow(), SessionState::Stopped);
}

#[tokio::test]
async fn requested_stop_is_not_reported_as_unexpected_exit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let controller = ExecutionController::new(
        SessionConfig::new(CommandSpec::new("sleep", temp.path()).args(["100"])),
        Arc::new(OsRunnableFactory),
        options(Duration::from_secs(5)),
    );

    let session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    let mut exit = session.exit;
    session.stopper.stop().await.expect("stop");

    let notice = tokio::time::timeout(Duration::from_millis(300), exit.recv()).await;
    assert!(notice.is_err(), "no unexpected-exit notice after a requested stop");
}

#[tokio::test]
async fn env_and_working_directory_are_applied() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().canonicalize().expect("canonical");
    let main = sh("echo \"$GREETING\" > out.txt; pwd >> out.txt", &dir).env("GREETING", "hello");
    let controller = ExecutionController::new(
        SessionConfig::new(main),
        Arc::new(OsRunnableFactory),
        options(Duration::from_secs(5)),
    );

    let mut session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    let outcome = tokio::time::timeout(Duration::from_secs(5), session.exit.recv())
        .await
        .expect("exits");
    assert!(outcome.is_success());

    let lines = read_lines(&dir.join("out.txt"));
    assert_eq!(lines[0], "hello");
    assert_eq!(lines[1], dir.to_str().expect("utf8"));
    session.stopper.stop().await.expect("stop");
}

// ── Hooks ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failing_before_hook_prevents_main_spawn_and_after_hooks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let factory = RecordingFactory::default();
    let config = SessionConfig {
        before_hooks: vec![
            sh("echo a >> hooks.log", dir),
            CommandSpec::new("false", dir),
            sh("echo c >> hooks.log", dir),
        ],
        main_command: CommandSpec::new("sleep", dir).args(["100"]),
        after_hooks: vec![sh("echo after >> hooks.log", dir)],
    };
    let controller =
        ExecutionController::new(config, Arc::new(factory.clone()), options(Duration::from_secs(5)));

    let err = controller
        .start(&CancellationToken::new())
        .await
        .expect_err("before hook fails");

    assert!(matches!(err, AppError::Hook(_)), "got {err}");
    assert_eq!(read_lines(&dir.join("hooks.log")), vec!["a"]);
    assert!(
        !factory.created_programs().contains(&"sleep 100".to_owned()),
        "main command must never be created"
    );
    assert_eq!(*controller.state().borrow(), SessionState::Failed);
}

#[tokio::test]
async fn spawn_failure_is_reported_without_after_hooks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let mut config = SessionConfig::new(CommandSpec::new("reloader-no-such-binary", dir));
    config.after_hooks = vec![sh("echo after >> hooks.log", dir)];
    let controller =
        ExecutionController::new(config, Arc::new(OsRunnableFactory), options(Duration::from_secs(5)));

    let err = controller
        .start(&CancellationToken::new())
        .await
        .expect_err("binary does not exist");

    assert!(matches!(err, AppError::Spawn(_)), "got {err}");
    assert!(read_lines(&dir.join("hooks.log")).is_empty());

    // The failed attempt released the session slot.
    let retry = controller.start(&CancellationToken::new()).await;
    assert!(matches!(retry, Err(AppError::Spawn(_))));
}

#[tokio::test]
async fn hooks_run_in_order_once_per_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let config = SessionConfig {
        before_hooks: vec![sh("echo before-1 >> hooks.log", dir), sh("echo before-2 >> hooks.log", dir)],
        main_command: CommandSpec::new("sleep", dir).args(["100"]),
        after_hooks: vec![sh("echo after-1 >> hooks.log", dir), sh("echo after-2 >> hooks.log", dir)],
    };
    let controller =
        ExecutionController::new(config, Arc::new(OsRunnableFactory), options(Duration::from_secs(5)));

    let session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    session.stopper.stop().await.expect("stop");

    assert_eq!(
        read_lines(&dir.join("hooks.log")),
        vec!["before-1", "before-2", "after-1", "after-2"]
    );
    assert_eq!(*controller.state().borrow(), SessionState::Stopped);
}

#[tokio::test]
async fn after_hooks_run_for_killed_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let mut config = SessionConfig::new(sh("trap '' INT; sleep 100", dir));
    config.after_hooks = vec![sh("echo after >> hooks.log", dir)];
    let controller = ExecutionController::new(
        config,
        Arc::new(OsRunnableFactory),
        options(Duration::from_millis(300)),
    );

    let session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let report = session.stopper.stop().await.expect("stop");

    assert!(report.killed);
    assert_eq!(read_lines(&dir.join("hooks.log")), vec!["after"]);
}

#[tokio::test]
async fn failing_after_hook_is_the_stop_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let mut config = SessionConfig::new(CommandSpec::new("sleep", dir).args(["100"]));
    config.after_hooks = vec![
        CommandSpec::new("false", dir),
        sh("echo unreachable >> hooks.log", dir),
    ];
    let controller =
        ExecutionController::new(config, Arc::new(OsRunnableFactory), options(Duration::from_secs(5)));

    let session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    let err = session.stopper.stop().await.expect_err("after hook fails");

    assert!(matches!(err, AppError::Hook(_)), "got {err}");
    assert!(read_lines(&dir.join("hooks.log")).is_empty());
}

#[tokio::test]
async fn hook_timeout_kills_the_hook() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let mut config = SessionConfig::new(CommandSpec::new("sleep", dir).args(["100"]));
    config.before_hooks = vec![CommandSpec::new("sleep", dir).args(["30"])];
    let mut opts = options(Duration::from_secs(5));
    opts.hook_timeout = Duration::from_millis(200);
    let controller = ExecutionController::new(config, Arc::new(OsRunnableFactory), opts);

    let started = Instant::now();
    let err = controller
        .start(&CancellationToken::new())
        .await
        .expect_err("hook times out");

    assert!(err.to_string().contains("timed out"), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn cancellation_aborts_running_before_hook() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let mut config = SessionConfig::new(CommandSpec::new("sleep", dir).args(["100"]));
    config.before_hooks = vec![CommandSpec::new("sleep", dir).args(["30"])];
    let controller =
        ExecutionController::new(config, Arc::new(OsRunnableFactory), options(Duration::from_secs(5)));

    let scope = CancellationToken::new();
    let canceller = scope.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = controller.start(&scope).await.expect_err("cancelled");
    assert!(matches!(err, AppError::Hook(_)), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn cancellation_during_teardown_aborts_blocked_after_hook() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let mut config = SessionConfig::new(CommandSpec::new("sleep", dir).args(["100"]));
    config.after_hooks = vec![sh("echo after >> hooks.log; exec sleep 30", dir)];
    let controller =
        ExecutionController::new(config, Arc::new(OsRunnableFactory), options(Duration::from_secs(5)));

    let scope = CancellationToken::new();
    let session = controller.start(&scope).await.expect("start");
    let canceller = scope.clone();
    let log = dir.join("hooks.log");
    tokio::spawn(async move {
        wait_until(|| read_lines(&log) == ["after"]).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = session.stopper.stop().await.expect_err("after-hook cancelled");
    assert!(matches!(err, AppError::Hook(_)), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(*controller.state().borrow(), SessionState::Failed);
}

#[tokio::test]
async fn after_hooks_still_run_when_stopping_after_shutdown() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let mut config = SessionConfig::new(CommandSpec::new("sleep", dir).args(["100"]));
    config.after_hooks = vec![sh("sleep 0.2; echo after >> hooks.log", dir)];
    let controller =
        ExecutionController::new(config, Arc::new(OsRunnableFactory), options(Duration::from_secs(5)));

    let scope = CancellationToken::new();
    let session = controller.start(&scope).await.expect("start");
    scope.cancel();

    session.stopper.stop().await.expect("teardown completes");
    assert_eq!(read_lines(&dir.join("hooks.log")), vec!["after"]);
}

// ── Session ownership ───────────────────────────────────────────────────────

#[tokio::test]
async fn second_start_is_rejected_until_stop_completes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let controller = ExecutionController::new(
        SessionConfig::new(CommandSpec::new("sleep", temp.path()).args(["100"])),
        Arc::new(OsRunnableFactory),
        options(Duration::from_secs(5)),
    );
    let scope = CancellationToken::new();

    let first = controller.start(&scope).await.expect("first start");
    let second = controller.start(&scope).await;
    assert!(matches!(second, Err(AppError::SessionActive)));

    first.stopper.stop().await.expect("stop");
    let third = controller.start(&scope).await.expect("start after stop");
    third.stopper.stop().await.expect("stop");
}

#[tokio::test]
async fn cancelling_scope_interrupts_main_command() {
    let temp = tempfile::tempdir().expect("tempdir");
    let controller = ExecutionController::new(
        SessionConfig::new(CommandSpec::new("sleep", temp.path()).args(["100"])),
        Arc::new(OsRunnableFactory),
        options(Duration::from_secs(5)),
    );
    let scope = CancellationToken::new();

    let mut session = controller.start(&scope).await.expect("start");
    scope.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), session.exit.recv())
        .await
        .expect("interrupt reaches the process");
    assert_eq!(outcome, ExitOutcome::SignaledExit(SIGINT));

    let report = session.stopper.stop().await.expect("scope interrupt is ours");
    assert!(!report.killed);
}

#[tokio::test]
async fn state_follows_session_lifecycle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let controller = ExecutionController::new(
        SessionConfig::new(CommandSpec::new("sleep", temp.path()).args(["100"])),
        Arc::new(OsRunnableFactory),
        options(Duration::from_secs(5)),
    );
    let state = controller.state();
    assert_eq!(*state.borrow(), SessionState::Idle);

    let session = controller
        .start(&CancellationToken::new())
        .await
        .expect("start");
    assert_eq!(*state.borrow(), SessionState::MainRunning);

    session.stopper.stop().await.expect("stop");
    assert_eq!(*state.borrow(), SessionState::Stopped);
}
