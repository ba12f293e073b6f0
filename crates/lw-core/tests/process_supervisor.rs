//! Integration tests for the worker supervisor against real processes.
//!
//! These tests spawn the `fake-worker` fixture binary through
//! `ProcessLauncher` and exercise start, pause/resume (SIGSTOP/SIGCONT),
//! stop-after-current, stdin messages, and kill escalation.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use loopwatch_core::config::WorkerConfig;
use loopwatch_core::launcher::{ExitInfo, ProcessLauncher};
use loopwatch_core::{StartOptions, SupervisorError, WorkerSignal, WorkerStatus, WorkerSupervisor};
use serde_json::Value;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn fake_worker(mode: &str) -> WorkerConfig {
    WorkerConfig {
        command: env!("CARGO_BIN_EXE_fake-worker").to_string(),
        args: vec![mode.to_string()],
        stop_timeout_ms: 2000,
        signal_capacity: 1024,
        cwd: None,
    }
}

fn supervisor(mode: &str) -> WorkerSupervisor {
    WorkerSupervisor::new(fake_worker(mode), Arc::new(ProcessLauncher))
}

async fn next(rx: &mut broadcast::Receiver<WorkerSignal>) -> WorkerSignal {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for worker signal")
        .expect("signal channel closed")
}

/// Wait for the next event of `kind`, returning its fields.
async fn wait_for_event(rx: &mut broadcast::Receiver<WorkerSignal>, kind: &str) -> Value {
    loop {
        if let WorkerSignal::Event(e) = next(rx).await {
            if e.kind() == Some(kind) {
                return e.into_value();
            }
        }
    }
}

async fn wait_for_exit(rx: &mut broadcast::Receiver<WorkerSignal>) -> ExitInfo {
    loop {
        if let WorkerSignal::Exit(info) = next(rx).await {
            return info;
        }
    }
}

#[tokio::test]
async fn runs_a_bounded_loop_to_completion() {
    let sup = supervisor("loop");
    let mut rx = sup.subscribe();
    sup.start(StartOptions {
        watch: true,
        iterations: Some(3),
    })
    .await
    .unwrap();

    let started = wait_for_event(&mut rx, "started").await;
    assert_eq!(started["watch"], true);
    assert_eq!(started["limit"], 3);

    let mut ticks = Vec::new();
    let mut raw = Vec::new();
    let exit = loop {
        match next(&mut rx).await {
            WorkerSignal::Event(e) if e.kind() == Some("tick") => {
                ticks.push(e.get("n").and_then(Value::as_u64).unwrap());
            }
            WorkerSignal::Output(line) => raw.push(line),
            WorkerSignal::Exit(info) => break info,
            _ => {}
        }
    };
    assert_eq!(ticks, vec![1, 2, 3]);
    assert_eq!(raw, vec!["fake worker warming up"]);
    assert_eq!(exit, ExitInfo::code(0));
    assert_eq!(sup.status(), WorkerStatus::Stopped);
}

#[tokio::test]
async fn pause_holds_events_until_resume_in_order() {
    let sup = supervisor("loop");
    let mut rx = sup.subscribe();
    sup.start(StartOptions::default()).await.unwrap();
    wait_for_event(&mut rx, "tick").await;

    sup.pause().await.unwrap();
    while next(&mut rx).await != WorkerSignal::Status(WorkerStatus::Paused) {}
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Anything still in flight was buffered, not emitted.
    let mut seen_while_paused = 0;
    while let Ok(signal) = rx.try_recv() {
        if matches!(signal, WorkerSignal::Event(_)) {
            seen_while_paused += 1;
        }
    }
    assert_eq!(seen_while_paused, 0);

    sup.resume().await.unwrap();
    let mut last = 0;
    for _ in 0..3 {
        let tick = wait_for_event(&mut rx, "tick").await;
        let n = tick["n"].as_u64().unwrap();
        assert!(n > last, "ticks must stay ordered across pause");
        last = n;
    }

    sup.stop(None).await.unwrap();
    assert_eq!(sup.status(), WorkerStatus::Stopped);
}

#[tokio::test]
async fn stop_after_current_lets_the_worker_finish() {
    let sup = supervisor("loop");
    let mut rx = sup.subscribe();
    sup.start(StartOptions::default()).await.unwrap();
    wait_for_event(&mut rx, "tick").await;

    sup.stop_after_current().await.unwrap();
    assert_eq!(sup.status(), WorkerStatus::StoppingAfterCurrent);

    wait_for_event(&mut rx, "stopped_after_current").await;
    assert_eq!(wait_for_exit(&mut rx).await, ExitInfo::code(0));
    assert_eq!(sup.status(), WorkerStatus::Stopped);
}

#[tokio::test]
async fn send_reaches_worker_stdin() {
    let sup = supervisor("loop");
    let mut rx = sup.subscribe();
    sup.start(StartOptions::default()).await.unwrap();
    wait_for_event(&mut rx, "started").await;

    sup.send(Value::String("hello worker".into())).await.unwrap();
    let received = wait_for_event(&mut rx, "received").await;
    assert_eq!(received["line"], "hello worker");

    sup.stop(None).await.unwrap();
}

#[tokio::test]
async fn stubborn_worker_is_killed_after_timeout() {
    let sup = supervisor("stubborn");
    let mut rx = sup.subscribe();
    sup.start(StartOptions::default()).await.unwrap();
    wait_for_event(&mut rx, "ready").await;

    let began = Instant::now();
    sup.stop(Some(Duration::from_millis(300))).await.unwrap();
    assert!(began.elapsed() >= Duration::from_millis(300));

    let exit = wait_for_exit(&mut rx).await;
    assert_eq!(exit.signal, Some(libc::SIGKILL));
    assert_eq!(sup.status(), WorkerStatus::Stopped);
}

#[tokio::test]
async fn unsolicited_exit_reports_code() {
    let mut config = fake_worker("exit");
    config.args.push("7".to_string());
    let sup = WorkerSupervisor::new(config, Arc::new(ProcessLauncher));
    let mut rx = sup.subscribe();
    sup.start(StartOptions::default()).await.unwrap();

    wait_for_event(&mut rx, "exiting").await;
    assert_eq!(wait_for_exit(&mut rx).await, ExitInfo::code(7));
    assert_eq!(sup.status(), WorkerStatus::Stopped);
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let config = WorkerConfig {
        command: "/nonexistent/loopwatch-worker".to_string(),
        ..WorkerConfig::default()
    };
    let sup = WorkerSupervisor::new(config, Arc::new(ProcessLauncher));
    let err = sup.start(StartOptions::default()).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Spawn { .. }));
    assert_eq!(sup.status(), WorkerStatus::Stopped);
}
