//! Worker-pool supervision
//!
//! The master process owns a [`Cluster`]: the desired worker count, the
//! serialized configuration payload, and a table of live worker handles.
//! [`Cluster::sync`] converges the pool to the desired state in a single
//! session at a time (concurrent requests are dropped, not queued);
//! worker exits outside a session trigger an automatic re-sync so the
//! pool self-heals toward the desired count.
//!
//! Workers are plain child processes: they receive the configuration
//! through their environment, report readiness by printing a marker line
//! on stdout, and are stopped with SIGTERM (SIGKILL after a grace
//! period).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Line a worker prints on stdout once its listeners are bound
pub const READY_LINE: &str = "READY=1";

/// Errors from cluster construction
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("a cluster master has already been constructed in this process")]
    AlreadyConstructed,
}

/// Lifecycle of one worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, readiness not yet reported
    Starting,
    /// Reported ready and serving
    Online,
    /// Graceful stop requested
    Stopping,
    /// Process has exited
    Exited,
}

/// Desired state of the pool
pub struct ClusterSpec {
    /// Target number of worker processes
    pub workers: usize,
    /// Opaque payload handed to each worker through its environment
    pub payload: String,
    /// Worker executable
    pub command: PathBuf,
    /// Arguments passed to the worker executable
    pub args: Vec<String>,
}

/// Tunables for worker lifecycle handling
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Delay after a worker reports ready before its start operation is
    /// considered successful; debounces crash-looping workers
    pub settle_delay: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a worker
    pub stop_grace: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Handle to one supervised worker; owned exclusively by the cluster
struct WorkerHandle {
    pid: Option<u32>,
    state_tx: watch::Sender<WorkerState>,
}

/// Guards against a second master in the same process
static MASTER_CONSTRUCTED: AtomicBool = AtomicBool::new(false);

/// The worker-pool orchestrator
pub struct Cluster {
    spec: Mutex<ClusterSpec>,
    options: ClusterOptions,
    workers: Mutex<HashMap<u64, WorkerHandle>>,
    /// Serializes sync sessions; a request while set is dropped
    busy: AtomicBool,
    next_id: AtomicU64,
}

/// Completion handle for one sync session; awaiting it is optional,
/// dropping it does not cancel the session
pub struct SyncSession {
    done_rx: watch::Receiver<bool>,
}

impl SyncSession {
    /// Wait until every sub-operation of the session has finished
    pub async fn wait(mut self) {
        while !*self.done_rx.borrow_and_update() {
            if self.done_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Cluster {
    /// Construct the master. Fails if one already exists in this
    /// process; the guard is released when the cluster is dropped.
    pub fn new(spec: ClusterSpec, options: ClusterOptions) -> Result<Arc<Self>, ClusterError> {
        if MASTER_CONSTRUCTED.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::AlreadyConstructed);
        }

        Ok(Arc::new(Self {
            spec: Mutex::new(spec),
            options,
            workers: Mutex::new(HashMap::new()),
            busy: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }))
    }

    /// Update the target worker count and payload; does not itself start
    /// a sync session
    pub fn set_desired_state(&self, workers: usize, payload: String) {
        let mut spec = self.spec.lock();
        spec.workers = workers;
        spec.payload = payload;
    }

    /// Number of workers that are starting or online
    pub fn live_workers(&self) -> usize {
        self.workers
            .lock()
            .values()
            .filter(|h| matches!(*h.state_tx.borrow(), WorkerState::Starting | WorkerState::Online))
            .count()
    }

    /// Number of workers that have reported ready
    pub fn online_workers(&self) -> usize {
        self.workers
            .lock()
            .values()
            .filter(|h| *h.state_tx.borrow() == WorkerState::Online)
            .count()
    }

    /// PIDs of live workers; used to observe worker identity across a
    /// rolling restart
    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers
            .lock()
            .values()
            .filter(|h| matches!(*h.state_tx.borrow(), WorkerState::Starting | WorkerState::Online))
            .filter_map(|h| h.pid)
            .collect()
    }

    /// Start a sync session converging the pool to the desired state.
    ///
    /// Returns `None` if a session is already active: overlapping
    /// requests are dropped, and convergence then relies on the
    /// exit-triggered re-sync (or a later explicit call).
    ///
    /// With `restart_existing`, workers that are not stopped by a
    /// scale-down are replaced one-for-one: the replacement is started
    /// and confirmed online before the original is stopped. Scale-down
    /// victim selection follows the worker table's iteration order and
    /// is not guaranteed to be FIFO or LIFO.
    pub fn sync(self: &Arc<Self>, restart_existing: bool) -> Option<SyncSession> {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("Sync requested while a session is active; dropping");
            return None;
        }

        let (done_tx, done_rx) = watch::channel(false);
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            cluster.run_session(restart_existing).await;
            cluster.busy.store(false, Ordering::SeqCst);
            let _ = done_tx.send(true);
        });

        Some(SyncSession { done_rx })
    }

    async fn run_session(self: &Arc<Self>, restart_existing: bool) {
        let (desired, payload, command, args) = {
            let spec = self.spec.lock();
            (
                spec.workers,
                spec.payload.clone(),
                spec.command.clone(),
                spec.args.clone(),
            )
        };
        let live: Vec<u64> = {
            self.workers
                .lock()
                .iter()
                .filter(|(_, h)| {
                    matches!(*h.state_tx.borrow(), WorkerState::Starting | WorkerState::Online)
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let delta = desired as i64 - live.len() as i64;
        info!(desired, live = live.len(), delta, restart_existing, "Sync session starting");

        let group = TaskGroup::new();

        if delta < 0 {
            let mut surplus = (-delta) as usize;
            for id in live {
                if surplus > 0 {
                    surplus -= 1;
                    let cluster = Arc::clone(self);
                    group.spawn(async move {
                        cluster.stop_worker(id).await;
                    });
                } else if restart_existing {
                    let cluster = Arc::clone(self);
                    let (payload, command, args) = (payload.clone(), command.clone(), args.clone());
                    group.spawn(async move {
                        cluster.restart_worker(id, &command, &args, &payload).await;
                    });
                }
            }
        } else {
            if restart_existing {
                for id in live {
                    let cluster = Arc::clone(self);
                    let (payload, command, args) = (payload.clone(), command.clone(), args.clone());
                    group.spawn(async move {
                        cluster.restart_worker(id, &command, &args, &payload).await;
                    });
                }
            }
            for _ in 0..delta {
                let cluster = Arc::clone(self);
                let (payload, command, args) = (payload.clone(), command.clone(), args.clone());
                group.spawn(async move {
                    cluster.start_worker(&command, &args, &payload).await;
                });
            }
        }

        group.join().await;
        info!("Sync session complete");
    }

    /// Spawn one worker and wait until it is online and settled.
    /// Returns false if it exited first; a failed start is not retried
    /// within the session.
    async fn start_worker(
        self: &Arc<Self>,
        command: &std::path::Path,
        args: &[String],
        payload: &str,
    ) -> bool {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .env(crate::config::PAYLOAD_ENV, payload)
            .stdin(Stdio::null())
            // stdout is the readiness channel; worker logs go to stderr
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(command = %command.display(), error = %e, "Failed to spawn worker");
                return false;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let (state_tx, _) = watch::channel(WorkerState::Starting);
        let mut state_rx = state_tx.subscribe();
        self.workers.lock().insert(id, WorkerHandle { pid, state_tx });
        info!(worker = id, pid, "Worker spawned");

        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            cluster.monitor_worker(id, child).await;
        });

        // Wait for the readiness report (or an early exit)
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                WorkerState::Online => break,
                WorkerState::Exited => {
                    warn!(worker = id, "Worker exited before reporting ready");
                    return false;
                }
                _ => {
                    if state_rx.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }

        // Settle delay: a worker that dies right after reporting ready
        // must not count as a successful start
        tokio::time::sleep(self.options.settle_delay).await;
        match self.worker_state(id) {
            Some(WorkerState::Online) => {
                info!(worker = id, "Worker online");
                true
            }
            _ => {
                warn!(worker = id, "Worker died during settle delay");
                false
            }
        }
    }

    /// Request a graceful stop and wait for the process to exit,
    /// escalating to SIGKILL after the grace period
    async fn stop_worker(self: &Arc<Self>, id: u64) {
        let (pid, mut state_rx) = {
            let workers = self.workers.lock();
            let Some(handle) = workers.get(&id) else {
                return;
            };
            // send_replace: the state must update even while nobody is
            // subscribed
            handle.state_tx.send_replace(WorkerState::Stopping);
            (handle.pid, handle.state_tx.subscribe())
        };

        info!(worker = id, "Stopping worker");
        signal_worker(pid, Signal::Terminate);

        let exited = wait_for_exit(&mut state_rx);
        if tokio::time::timeout(self.options.stop_grace, exited)
            .await
            .is_err()
        {
            warn!(worker = id, "Grace period exceeded, killing worker");
            signal_worker(pid, Signal::Kill);
            wait_for_exit(&mut state_rx).await;
        }
    }

    /// Start a replacement, then stop the original once the replacement
    /// is confirmed online (no capacity gap). A failed replacement
    /// leaves the original running.
    async fn restart_worker(
        self: &Arc<Self>,
        id: u64,
        command: &std::path::Path,
        args: &[String],
        payload: &str,
    ) {
        if self.start_worker(command, args, payload).await {
            self.stop_worker(id).await;
        } else {
            warn!(worker = id, "Replacement failed to start; keeping original worker");
        }
    }

    /// Follow one worker's stdout for the readiness line and reap its
    /// exit status
    async fn monitor_worker(self: Arc<Self>, id: u64, mut child: Child) {
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.trim() == READY_LINE {
                                self.mark_online(id);
                            } else {
                                debug!(worker = id, line = %line, "Worker output");
                            }
                        }
                        Ok(None) | Err(_) => break,
                    },
                    status = child.wait() => {
                        self.finish_worker(id, status.ok());
                        return;
                    }
                }
            }
        }

        let status = child.wait().await.ok();
        self.finish_worker(id, status);
    }

    /// Starting → Online; late readiness reports after a stop request
    /// are ignored
    fn mark_online(&self, id: u64) {
        let workers = self.workers.lock();
        if let Some(handle) = workers.get(&id) {
            if *handle.state_tx.borrow() == WorkerState::Starting {
                handle.state_tx.send_replace(WorkerState::Online);
            }
        }
    }

    /// Record the exit, drop the handle, and trigger the self-healing
    /// re-sync (a no-op while a session is active)
    fn finish_worker(self: &Arc<Self>, id: u64, status: Option<std::process::ExitStatus>) {
        let deliberate = {
            let mut workers = self.workers.lock();
            match workers.remove(&id) {
                Some(handle) => {
                    let deliberate = *handle.state_tx.borrow() == WorkerState::Stopping;
                    handle.state_tx.send_replace(WorkerState::Exited);
                    deliberate
                }
                None => return,
            }
        };

        if deliberate {
            info!(worker = id, status = ?status, "Worker stopped");
        } else {
            warn!(worker = id, status = ?status, "Worker exited abnormally");
        }

        let _ = self.sync(false);
    }

    fn worker_state(&self, id: u64) -> Option<WorkerState> {
        self.workers
            .lock()
            .get(&id)
            .map(|h| *h.state_tx.borrow())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        MASTER_CONSTRUCTED.store(false, Ordering::SeqCst);
    }
}

/// Wait until the worker's state channel reports Exited (a closed
/// channel means the handle is gone, which implies the same)
async fn wait_for_exit(state_rx: &mut watch::Receiver<WorkerState>) {
    while *state_rx.borrow_and_update() != WorkerState::Exited {
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_worker(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as i32, sig);
    }
}

#[cfg(not(unix))]
fn signal_worker(_pid: Option<u32>, _signal: Signal) {
    warn!("Worker signaling is only supported on Unix");
}

/// Completion gate for a batch of concurrently running operations: a
/// counter incremented per spawned operation and decremented as each
/// finishes. [`TaskGroup::join`] resolves when the counter reaches zero,
/// immediately for a batch of zero operations.
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    pending: AtomicUsize,
    notify: Notify,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                pending: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Enroll and run one operation
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            fut.await;
            if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.notify.notify_waiters();
            }
        });
    }

    /// Wait for all enrolled operations; resolves immediately if none
    /// were enrolled
    pub async fn join(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}
