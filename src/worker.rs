//! Worker-process bootstrap
//!
//! A worker is an ordinary child process of the master. It finds its
//! configuration serialized in the environment, binds the listeners,
//! reports readiness by printing [`READY_LINE`](crate::cluster::READY_LINE)
//! on stdout (stdout is reserved for that; logs go to stderr), and serves
//! until the master sends SIGTERM.

use crate::actions::build_rules;
use crate::cluster::READY_LINE;
use crate::config::{Config, PAYLOAD_ENV};
use crate::router::Router;
use crate::server::Server;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Run the worker role to completion: parse the payload, bind, serve,
/// drain, exit.
pub async fn run() -> anyhow::Result<()> {
    let payload = std::env::var(PAYLOAD_ENV)
        .map_err(|_| anyhow::anyhow!("worker started without {} in environment", PAYLOAD_ENV))?;
    // The payload is consumed exactly once and never re-read; children
    // of this process must not inherit it either
    std::env::remove_var(PAYLOAD_ENV);

    let config = Config::from_payload(&payload)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    let rules = build_rules(&config.rules)?;
    let router = Arc::new(Router::new(rules));
    let server = Server::bind(&config, router, shutdown_rx).await;

    // Privileges are dropped only after binding, so privileged ports
    // stay available to the configuration
    drop_privileges(config.group, config.user)?;

    // Readiness report to the master
    println!("{}", READY_LINE);
    info!(
        pid = std::process::id(),
        listeners = server.local_addrs().len(),
        rules = config.rules.len(),
        "Worker serving"
    );

    server.run().await?;
    info!("Worker drained, exiting");
    Ok(())
}

/// Flip the shutdown flag on SIGTERM (the master's stop signal) or
/// SIGINT
fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Worker received shutdown signal, draining");
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(unix)]
fn drop_privileges(group: Option<u32>, user: Option<u32>) -> anyhow::Result<()> {
    // Group first: setgid is no longer permitted once the uid changed
    if let Some(gid) = group {
        if unsafe { libc::setgid(gid) } != 0 {
            anyhow::bail!(
                "failed to change group to {}: {}",
                gid,
                std::io::Error::last_os_error()
            );
        }
        info!(gid, "Group changed");
    }

    if let Some(uid) = user {
        if unsafe { libc::setuid(uid) } != 0 {
            anyhow::bail!(
                "failed to change user to {}: {}",
                uid,
                std::io::Error::last_os_error()
            );
        }
        info!(uid, "User changed");
    }

    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(group: Option<u32>, user: Option<u32>) -> anyhow::Result<()> {
    if group.is_some() || user.is_some() {
        anyhow::bail!("privilege dropping is only supported on Unix");
    }
    Ok(())
}
