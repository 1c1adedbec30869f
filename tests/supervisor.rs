//! Daemon supervisor against real processes

#![cfg(unix)]

use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tor_operator::agent::{DaemonSpec, DaemonState, Status, Supervisor};
use tor_operator::config::ReloadMode;

fn spec(program: &str, args: &[&str], reload: ReloadMode) -> DaemonSpec {
    DaemonSpec {
        name: "test-daemon".to_string(),
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        reload,
        restart_delay: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(2),
    }
}

/// A long sleep that ignores SIGHUP, like a daemon that reloads on it
fn hup_tolerant() -> DaemonSpec {
    spec(
        "sh",
        &["-c", "trap '' HUP; exec sleep 30"],
        ReloadMode::Signal,
    )
}

fn alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

async fn wait_until(rx: &mut watch::Receiver<Status>, f: impl FnMut(&Status) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
        .await
        .expect("timed out waiting for supervisor status")
        .expect("supervisor went away");
}

#[tokio::test]
async fn test_concurrent_ensure_running_starts_once() {
    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::spawn(spec("sleep", &["30"], ReloadMode::Signal), shutdown.clone());
    assert_eq!(supervisor.status().state, DaemonState::NotRunning);

    let (a, b) = tokio::join!(supervisor.ensure_running(), supervisor.ensure_running());
    a.unwrap();
    b.unwrap();
    supervisor.ensure_running().await.unwrap();

    let status = supervisor.status();
    assert_eq!(status.state, DaemonState::Running);
    assert_eq!(status.starts, 1);
    let pid = status.pid.unwrap();
    assert!(alive(pid));

    shutdown.cancel();
    supervisor.wait().await;
    assert!(!alive(pid));
}

#[tokio::test]
async fn test_signal_reload_keeps_the_process() {
    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::spawn(hup_tolerant(), shutdown.clone());

    supervisor.ensure_running().await.unwrap();
    let pid = supervisor.status().pid.unwrap();
    // Let the shell install its trap before the first hangup
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (a, b) = tokio::join!(supervisor.reload(), supervisor.ensure_running());
    a.unwrap();
    b.unwrap();
    supervisor.reload().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = supervisor.status();
    assert_eq!(status.starts, 1);
    assert_eq!(status.pid, Some(pid));
    assert!(alive(pid));

    shutdown.cancel();
    supervisor.wait().await;
}

#[tokio::test]
async fn test_reload_starts_a_stopped_daemon() {
    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::spawn(hup_tolerant(), shutdown.clone());

    supervisor.reload().await.unwrap();
    let status = supervisor.status();
    assert_eq!(status.state, DaemonState::Running);
    assert_eq!(status.starts, 1);

    shutdown.cancel();
    supervisor.wait().await;
}

#[tokio::test]
async fn test_restart_reload_replaces_the_process() {
    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::spawn(spec("sleep", &["30"], ReloadMode::Restart), shutdown.clone());

    supervisor.ensure_running().await.unwrap();
    let old = supervisor.status().pid.unwrap();
    supervisor.reload().await.unwrap();

    let status = supervisor.status();
    assert_eq!(status.starts, 2);
    let new = status.pid.unwrap();
    assert_ne!(old, new);
    assert!(!alive(old));
    assert!(alive(new));

    shutdown.cancel();
    supervisor.wait().await;
    assert!(!alive(new));
}

#[tokio::test]
async fn test_crashed_daemon_is_restarted() {
    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::spawn(spec("sleep", &["30"], ReloadMode::Signal), shutdown.clone());
    let mut status = supervisor.subscribe();

    supervisor.ensure_running().await.unwrap();
    let pid = supervisor.status().pid.unwrap();
    // SAFETY: the pid belongs to our own child
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }

    wait_until(&mut status, |s| s.starts == 2 && s.state == DaemonState::Running).await;
    let restarted = supervisor.status().pid.unwrap();
    assert_ne!(restarted, pid);

    shutdown.cancel();
    supervisor.wait().await;
}
