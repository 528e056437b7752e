use frontdoor::cluster::{Cluster, ClusterOptions, ClusterSpec};
use frontdoor::config::{Config, PAYLOAD_ENV};
use frontdoor::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

const USAGE: &str = "\
Usage: frontdoor [CONFIG]

Arguments:
  CONFIG  Path to the configuration file (default: config.toml)

Options:
  -h, --help     Print help
  -V, --version  Print version
";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A worker is recognized by the configuration payload the master put
    // in its environment
    let is_worker = std::env::var(PAYLOAD_ENV).is_ok();
    init_tracing(is_worker);

    if is_worker {
        return frontdoor::worker::run().await;
    }

    master().await
}

/// Initialize logging. Workers write to stderr because their stdout is
/// the readiness channel read by the master.
fn init_tracing(worker: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("frontdoor=info".parse().expect("valid log directive"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if worker {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

/// Parse CLI arguments; exits early for --help and --version
fn parse_args() -> PathBuf {
    let mut config_path = PathBuf::from("config.toml");
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                print!("{}", USAGE);
                std::process::exit(0);
            }
            "-V" | "--version" => {
                println!("{} {}", PKG_NAME, VERSION);
                std::process::exit(0);
            }
            path => config_path = PathBuf::from(path),
        }
    }
    config_path
}

async fn master() -> anyhow::Result<()> {
    let config_path = parse_args();

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    let workers = config.workers.resolve();
    let mut current_payload = config.to_payload()?;
    info!(
        name = PKG_NAME,
        version = VERSION,
        workers,
        listeners = config.listen.len(),
        rules = config.rules.len(),
        "Starting front door"
    );

    let cluster = Cluster::new(
        ClusterSpec {
            workers,
            payload: current_payload.clone(),
            command: std::env::current_exe()?,
            args: Vec::new(),
        },
        ClusterOptions::default(),
    )?;

    if let Some(session) = cluster.sync(false) {
        session.wait().await;
    }
    info!(online = cluster.online_workers(), "Worker pool ready");

    // Wait for shutdown (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    match reload(&cluster, &config_path) {
                        Ok(payload) => current_payload = payload,
                        Err(e) => {
                            // The pool keeps running with its old
                            // configuration
                            error!(error = %e, "Failed to reload configuration");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Graceful drain: desired count zero, then one final session
    info!("Draining worker pool...");
    cluster.set_desired_state(0, current_payload);
    loop {
        match cluster.sync(false) {
            Some(session) => {
                session.wait().await;
                break;
            }
            None => {
                // A session is still running; try again once it is done
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Reload configuration and roll-restart the pool onto the new payload
#[cfg(unix)]
fn reload(cluster: &std::sync::Arc<Cluster>, config_path: &PathBuf) -> anyhow::Result<String> {
    let config = Config::load(config_path)?;
    let payload = config.to_payload()?;
    cluster.set_desired_state(config.workers.resolve(), payload.clone());

    match cluster.sync(true) {
        Some(_) => {
            info!(
                workers = config.workers.resolve(),
                "Roll-restarting workers with new configuration"
            );
        }
        None => {
            warn!("A sync session is already running; the new configuration applies on the next sync");
        }
    }

    Ok(payload)
}
