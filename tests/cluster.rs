//! Integration tests for the worker-pool orchestrator
//!
//! Workers are stubbed with `sh` children that print the readiness line
//! and then sleep, so the tests exercise real process lifecycles.

#![cfg(unix)]

use frontdoor::cluster::{Cluster, ClusterError, ClusterOptions, ClusterSpec};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Only one cluster master may exist per process, so the tests take
/// turns
static LOCK: Mutex<()> = Mutex::new(());

fn stub_spec(workers: usize) -> ClusterSpec {
    ClusterSpec {
        workers,
        payload: String::new(),
        command: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), "echo READY=1; exec sleep 60".to_string()],
    }
}

fn test_options() -> ClusterOptions {
    ClusterOptions {
        settle_delay: Duration::from_millis(25),
        stop_grace: Duration::from_secs(2),
    }
}

/// The previous test's monitor tasks may still hold the master guard
/// for a moment while their runtime shuts down; retry briefly.
fn new_cluster(spec: ClusterSpec) -> Arc<Cluster> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match Cluster::new(
            ClusterSpec {
                workers: spec.workers,
                payload: spec.payload.clone(),
                command: spec.command.clone(),
                args: spec.args.clone(),
            },
            test_options(),
        ) {
            Ok(cluster) => return cluster,
            Err(ClusterError::AlreadyConstructed) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("failed to construct cluster: {}", e),
        }
    }
}

async fn drain(cluster: &Arc<Cluster>) {
    cluster.set_desired_state(0, String::new());
    loop {
        match cluster.sync(false) {
            Some(session) => {
                session.wait().await;
                break;
            }
            None => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

#[tokio::test]
async fn test_sync_converges_from_zero_to_desired() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let cluster = new_cluster(stub_spec(3));

    let session = cluster.sync(false).expect("no session active");
    session.wait().await;

    assert_eq!(cluster.online_workers(), 3);
    assert_eq!(cluster.live_workers(), 3);

    drain(&cluster).await;
    assert_eq!(cluster.live_workers(), 0);
}

#[tokio::test]
async fn test_zero_operation_session_completes_immediately() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let cluster = new_cluster(stub_spec(0));

    let started = Instant::now();
    let session = cluster.sync(false).expect("no session active");
    session.wait().await;

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(cluster.live_workers(), 0);
}

#[tokio::test]
async fn test_scale_down_stops_surplus_workers() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let cluster = new_cluster(stub_spec(5));

    cluster.sync(false).expect("no session active").wait().await;
    assert_eq!(cluster.online_workers(), 5);

    cluster.set_desired_state(2, String::new());
    cluster.sync(false).expect("no session active").wait().await;

    assert_eq!(cluster.live_workers(), 2);
    assert_eq!(cluster.online_workers(), 2);

    drain(&cluster).await;
}

#[tokio::test]
async fn test_roll_restart_replaces_every_worker_without_capacity_gap() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let cluster = new_cluster(stub_spec(2));

    cluster.sync(false).expect("no session active").wait().await;
    let before: Vec<u32> = cluster.worker_pids();
    assert_eq!(before.len(), 2);

    cluster.sync(true).expect("no session active").wait().await;

    let after: Vec<u32> = cluster.worker_pids();
    assert_eq!(after.len(), 2);
    // Every worker is a different process instance than before
    for pid in &after {
        assert!(!before.contains(pid), "worker {} survived the restart", pid);
    }

    drain(&cluster).await;
}

#[tokio::test]
async fn test_reentrant_sync_is_dropped() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let cluster = new_cluster(stub_spec(1));

    let first = cluster.sync(false);
    assert!(first.is_some());
    // The session is still starting its worker; a second request must
    // be dropped, not queued
    assert!(cluster.sync(false).is_none());

    first.unwrap().wait().await;
    assert_eq!(cluster.online_workers(), 1);

    // With the session finished, sync is accepted again
    drain(&cluster).await;
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let cluster = new_cluster(stub_spec(1));

    cluster.sync(false).expect("no session active").wait().await;
    let before = cluster.worker_pids();
    assert_eq!(before.len(), 1);

    // Kill the worker behind the orchestrator's back; the exit event
    // must trigger a self-healing re-sync
    unsafe {
        libc::kill(before[0] as i32, libc::SIGKILL);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let pids = cluster.worker_pids();
        if cluster.online_workers() == 1 && !pids.contains(&before[0]) {
            break;
        }
        assert!(Instant::now() < deadline, "worker was not replaced in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    drain(&cluster).await;
}

#[tokio::test]
async fn test_worker_that_never_reports_ready_fails_the_start() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // This stub exits immediately without printing the readiness line
    let cluster = new_cluster(ClusterSpec {
        workers: 1,
        payload: String::new(),
        command: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), "exit 7".to_string()],
    });

    // The session completes (as a logged failure) instead of hanging
    let session = cluster.sync(false).expect("no session active");
    tokio::time::timeout(Duration::from_secs(5), session.wait())
        .await
        .expect("session must complete despite the failed start");

    assert_eq!(cluster.online_workers(), 0);
    drain(&cluster).await;
}
