//! End-to-end supervision scenarios, spawning the crate's own demo-worker binary as
//! real child processes and driving the master through real signal delivery.
//!
//! All tests here install signal listeners on this test binary's own process, so they
//! share process-wide signal disposition; `SIGNAL_TESTS` serializes them to keep one
//! test's self-delivered signal from being observed by another running concurrently.

use dusa_collection_utils::core::types::pathtype::PathType;
use fleet_supervisor::config::SupervisorConfig;
use fleet_supervisor::master::Supervisor;
use std::time::Duration;
use tokio::sync::Mutex;

static SIGNAL_TESTS: Mutex<()> = Mutex::const_new(());

fn demo_worker_config(worker_processes: usize) -> SupervisorConfig {
    SupervisorConfig {
        worker_processes,
        worker_program: PathType::from(env!("CARGO_BIN_EXE_demo-worker")),
        worker_args: Vec::new(),
        worker_env: Default::default(),
        escalation_start_ms: 30,
        escalation_ceiling_ms: 90,
        reconfigure_settle_ms: 30,
    }
}

#[tokio::test]
async fn start_and_sigint_terminate() {
    let _guard = SIGNAL_TESTS.lock().await;

    let config = demo_worker_config(3);
    let mut supervisor = Supervisor::new(config);

    let handle = tokio::spawn(async move {
        supervisor.run().await.expect("master loop errored");
    });

    // Let the workers actually come up before we drain them.
    tokio::time::sleep(Duration::from_millis(150)).await;

    nix::sys::signal::kill(nix::unistd::getpid(), nix::sys::signal::Signal::SIGINT)
        .expect("failed to self-deliver SIGINT");

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("master did not exit within timeout")
        .expect("master task panicked");
}

#[tokio::test]
async fn respawn_after_crash_reuses_the_dead_slot() {
    let _guard = SIGNAL_TESTS.lock().await;

    let piddir = tempfile::tempdir().expect("tempdir");
    let mut config = demo_worker_config(2);
    config
        .worker_env
        .insert("FLEET_WORKER_PIDDIR".into(), piddir.path().display().to_string());
    let mut supervisor = Supervisor::new(config);

    // Drives the crash/respawn steps alongside the still-running master. Racing it
    // against `supervisor.run()` in a `select!` (rather than spawning `run()` into its
    // own task) lets the master's mutable borrow end as soon as the driver finishes,
    // so we can inspect the live table afterwards without ever having to drain it.
    let pid_path = piddir.path().join("0.pid");
    let driver = async {
        // Let both workers start and record their pids.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let original_pid: i32 = std::fs::read_to_string(&pid_path)
            .expect("slot 0 pidfile")
            .trim()
            .parse()
            .expect("pidfile contents");

        nix::sys::signal::kill(nix::unistd::Pid::from_raw(original_pid), nix::sys::signal::Signal::SIGKILL)
            .expect("failed to kill slot 0's worker");

        // Give the reaper time to notice the death and respawn into the same slot.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let respawned_pid: i32 = std::fs::read_to_string(&pid_path)
            .expect("slot 0 pidfile after respawn")
            .trim()
            .parse()
            .expect("pidfile contents after respawn");
        assert_ne!(original_pid, respawned_pid, "slot 0 should have a freshly spawned child");
    };

    tokio::select! {
        res = supervisor.run() => {
            res.expect("master loop errored");
            panic!("master exited before the crash/respawn driver finished");
        }
        _ = driver => {}
    }

    assert!(supervisor.table().is_tight(), "table must stay tight after a crash+respawn cycle");
    assert_eq!(supervisor.table().len(), 2, "the respawned slot must not grow or corrupt the table");
}

#[tokio::test]
async fn escalation_reaches_sigkill_for_an_uncooperative_worker() {
    let _guard = SIGNAL_TESTS.lock().await;

    let mut config = demo_worker_config(1);
    config.worker_env.insert("FLEET_IGNORE_TERMINATE".into(), "1".into());
    let mut supervisor = Supervisor::new(config);

    let handle = tokio::spawn(async move {
        supervisor.run().await.expect("master loop errored");
        supervisor
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    nix::sys::signal::kill(nix::unistd::getpid(), nix::sys::signal::Signal::SIGINT)
        .expect("failed to self-deliver SIGINT");

    // The worker ignores both the TERMINATE channel command and SIGTERM, so the only
    // way the master can finish draining is by escalating all the way to SIGKILL.
    let supervisor = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("master did not escalate to SIGKILL within timeout")
        .expect("master task panicked");

    assert!(supervisor.table().is_tight());
    assert_eq!(supervisor.table().len(), 0, "the killed, non-respawning worker must leave no slot behind");
}

#[tokio::test]
async fn reopen_does_not_drain_the_fleet() {
    let _guard = SIGNAL_TESTS.lock().await;

    let config = demo_worker_config(2);
    let mut supervisor = Supervisor::new(config);

    let handle = tokio::spawn(async move {
        let result = tokio::time::timeout(Duration::from_secs(2), supervisor.run()).await;
        assert!(result.is_err(), "master should still be running (no drain signal sent)");
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    nix::sys::signal::kill(nix::unistd::getpid(), nix::sys::signal::Signal::SIGUSR1)
        .expect("failed to self-deliver SIGUSR1 (reopen)");

    tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("test task did not finish in time")
        .expect("test task panicked");
}
