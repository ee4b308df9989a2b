//! The supervised worker pool.
//!
//! A pool owns a fixed set of N long-lived worker processes plus three
//! cooperating activities in the parent:
//!
//! - a **dispatcher** that pairs admitted tasks with idle workers and
//!   writes task frames to their stdin,
//! - a **reader** per worker draining its stdout into pool events,
//! - a **supervisor** that owns the worker table, delivers results,
//!   enforces hard deadlines (SIGTERM → grace → SIGKILL, process-group
//!   kill when `killTree`), observes crashes, and spawns a same-index
//!   replacement for every worker that dies.
//!
//! Admission is a counting semaphore of `N + queue_size` permits held until
//! the task's single terminal result is delivered; a submit that cannot
//! acquire a permit within the admit timeout resolves to `rejected`. Every
//! admitted task resolves exactly once: whoever removes its entry from the
//! pending table (reader result, deadline expiry, crash, or drain) owns
//! delivery.
//!
//! Killing the OS process is the only reliable way to reclaim CPU and
//! memory from runaway user code; the pool never tries to cancel it
//! cooperatively.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use algoserve_core::execution::{ExecutionError, ExecutionRequest, ExecutionResult};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executors::ExecutorError;
use crate::protocol::{self, FromWorker, ResultMessage, TaskMessage, ToWorker};
use crate::worker::WORKER_ENV;

/// How long `start()` waits for the initial worker handshakes.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How a worker process is launched. Defaults to re-invoking the current
/// executable with the worker marker in its environment.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Re-invoke the running binary; the facade entry diverts into the
    /// worker loop when it sees the marker variable.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: Vec::new(),
            envs: Vec::new(),
        })
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Sizing and kill policy for one pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool label for logs, metrics, and the worker environment.
    pub name: String,
    pub size: usize,
    pub queue_size: usize,
    pub admit_timeout: Duration,
    pub default_timeout_s: Option<f64>,
    pub kill_grace: Duration,
    pub kill_tree: bool,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size: size.max(1),
            queue_size: 16,
            admit_timeout: Duration::from_secs(5),
            default_timeout_s: None,
            kill_grace: Duration::from_secs(1),
            kill_tree: false,
        }
    }
}

/// Point-in-time pool counters for metrics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: String,
    pub size: usize,
    pub busy: usize,
    pub pending: usize,
    pub restarts: u64,
}

// ── Internal structures ─────────────────────────────────────────────────────

struct PendingTask {
    message: TaskMessage,
    deadline: Option<Instant>,
    reply: oneshot::Sender<ExecutionResult>,
    /// Held until the terminal result is delivered.
    _permit: OwnedSemaphorePermit,
    /// `(index, generation)` once a dispatcher claimed a worker.
    worker: Option<(usize, u64)>,
    admitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SlotState {
    Spawning,
    Idle,
    Busy { task_id: u64 },
    Dead,
}

struct WorkerSlot {
    generation: u64,
    pid: Option<u32>,
    state: SlotState,
    input: Option<mpsc::UnboundedSender<ToWorker>>,
    kill: CancellationToken,
}

/// A claim on one idle worker, handed from the supervisor to the
/// dispatcher. Leases for dead generations fail on send and are discarded.
struct WorkerLease {
    index: usize,
    generation: u64,
    input: mpsc::UnboundedSender<ToWorker>,
}

enum PoolEvent {
    Ready {
        index: usize,
        generation: u64,
        pid: u32,
    },
    Assigned {
        index: usize,
        generation: u64,
        task_id: u64,
    },
    Result {
        index: usize,
        generation: u64,
        message: ResultMessage,
    },
    Exited {
        index: usize,
        generation: u64,
        exit_code: Option<i32>,
    },
}

struct PoolShared {
    config: PoolConfig,
    command: WorkerCommand,
    admit: Arc<Semaphore>,
    pending: Mutex<HashMap<u64, PendingTask>>,
    next_task_id: AtomicU64,
    queue_tx: mpsc::UnboundedSender<u64>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    /// Wakes the supervisor when a nearer deadline may exist.
    deadline_changed: Notify,
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    /// Whether shutdown lets in-flight tasks finish (`shutdown(wait=true)`).
    drain_graceful: AtomicBool,
    busy: AtomicUsize,
    restarts: AtomicU64,
    ready_tx: watch::Sender<usize>,
}

/// Receivers handed to the supervisor/dispatcher tasks on `start()`.
struct PoolChannels {
    queue_rx: mpsc::UnboundedReceiver<u64>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
}

/// The supervised pool handle.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    channels: Mutex<Option<PoolChannels>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, command: WorkerCommand) -> Self {
        let permits = config.size + config.queue_size;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, _) = watch::channel(0usize);
        Self {
            shared: Arc::new(PoolShared {
                config,
                command,
                admit: Arc::new(Semaphore::new(permits)),
                pending: Mutex::new(HashMap::new()),
                next_task_id: AtomicU64::new(1),
                queue_tx,
                events_tx,
                deadline_changed: Notify::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                drain_graceful: AtomicBool::new(true),
                busy: AtomicUsize::new(0),
                restarts: AtomicU64::new(0),
                ready_tx,
            }),
            channels: Mutex::new(Some(PoolChannels { queue_rx, events_rx })),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
            && !self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.shared.config.name.clone(),
            size: self.shared.config.size,
            busy: self.shared.busy.load(Ordering::SeqCst),
            pending: self
                .shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .len(),
            restarts: self.shared.restarts.load(Ordering::SeqCst),
        }
    }

    /// Spawn the workers and wait for every readiness handshake.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(PoolChannels { queue_rx, events_rx }) = self
            .channels
            .lock()
            .expect("channels lock poisoned")
            .take()
        else {
            return Ok(());
        };

        #[cfg(not(unix))]
        if self.shared.config.kill_tree {
            warn!(
                pool = %self.shared.config.name,
                "killTree requested but this platform has no process groups; using plain kill"
            );
        }

        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(run_supervisor(
            self.shared.clone(),
            events_rx,
            idle_tx.clone(),
        ));
        let dispatcher = tokio::spawn(run_dispatcher(self.shared.clone(), queue_rx, idle_rx, idle_tx));
        {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.push(supervisor);
            tasks.push(dispatcher);
        }

        let size = self.shared.config.size;
        let mut ready_rx = self.shared.ready_tx.subscribe();
        let handshake = tokio::time::timeout(
            SPAWN_TIMEOUT,
            ready_rx.wait_for(|ready| *ready >= size),
        )
        .await;
        match handshake {
            Ok(Ok(_)) => {
                info!(pool = %self.shared.config.name, workers = size, "worker pool started");
                Ok(())
            }
            _ => {
                self.shared.closed.store(true, Ordering::SeqCst);
                self.shared.admit.close();
                self.shared.shutdown.cancel();
                Err(ExecutorError::Start(format!(
                    "pool {} workers did not become ready within {:?}",
                    self.shared.config.name, SPAWN_TIMEOUT
                )))
            }
        }
    }

    /// Submit one task and wait for its single terminal result.
    pub async fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        if !self.shared.started.load(Ordering::SeqCst) {
            return ExecutionResult::failed_now(ExecutionError::rejected(format!(
                "pool {} is not started",
                self.shared.config.name
            )));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return rejected_draining();
        }

        let permit = match tokio::time::timeout(
            self.shared.config.admit_timeout,
            self.shared.admit.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // Semaphore closed: shutdown raced the submit.
            Ok(Err(_)) => return rejected_draining(),
            Err(_) => {
                return ExecutionResult::failed_now(ExecutionError::rejected(format!(
                    "pool {} admission queue is full",
                    self.shared.config.name
                )));
            }
        };

        let timeout_s = request.effective_timeout(self.shared.config.default_timeout_s);
        // The deadline is fixed here, before dispatch; the supervisor never
        // extends it.
        let deadline =
            timeout_s.map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));
        let task_id = self.shared.next_task_id.fetch_add(1, Ordering::SeqCst);

        let message = TaskMessage {
            task_id,
            name: request.spec.name.clone(),
            version: request.spec.version.clone(),
            input: request.payload.clone(),
            hyperparams: request.hyperparams.clone(),
            request_id: request.request_id.clone(),
            trace_id: request.trace_id.clone(),
            context: request.context.clone(),
            request_datetime: request.request_datetime,
            stateful: request.spec.execution.stateful,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().expect("pending lock poisoned");
            pending.insert(
                task_id,
                PendingTask {
                    message,
                    deadline,
                    reply: reply_tx,
                    _permit: permit,
                    worker: None,
                    admitted_at: Utc::now(),
                },
            );
        }
        if self.shared.queue_tx.send(task_id).is_err() {
            // Dispatcher is gone; take the entry back and shed the task.
            let mut pending = self.shared.pending.lock().expect("pending lock poisoned");
            pending.remove(&task_id);
            return rejected_draining();
        }
        self.shared.deadline_changed.notify_one();

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => ExecutionResult::failed_now(ExecutionError::system(
                "result channel closed before delivery",
            )),
        }
    }

    /// Close admission, drain the workers, and stop the pool activities.
    ///
    /// With `wait = true` the pool lets in-flight tasks finish (deadlines
    /// stay enforced); with `wait = false` workers still alive after the
    /// kill grace are force-killed.
    pub async fn shutdown(&self, wait: bool) {
        if !self.shared.started.load(Ordering::SeqCst) {
            return;
        }
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.admit.close();
        self.shared.drain_graceful.store(wait, Ordering::SeqCst);
        self.shared.shutdown.cancel();
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            if wait {
                let _ = handle.await;
            } else {
                match tokio::time::timeout(
                    self.shared.config.kill_grace + Duration::from_secs(5),
                    handle,
                )
                .await
                {
                    Ok(_) => {}
                    Err(_) => warn!(pool = %self.shared.config.name, "pool task did not stop in time"),
                }
            }
        }
        info!(pool = %self.shared.config.name, "worker pool stopped");
    }
}

fn rejected_draining() -> ExecutionResult {
    ExecutionResult::failed_now(
        ExecutionError::rejected("executor is shutting down")
            .with_details(serde_json::Value::String("draining".to_string())),
    )
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

/// Pair queued tasks with idle workers. A task that resolved while queued
/// is skipped; a lease whose worker died is discarded and another claimed.
async fn run_dispatcher(
    shared: Arc<PoolShared>,
    mut queue_rx: mpsc::UnboundedReceiver<u64>,
    mut idle_rx: mpsc::UnboundedReceiver<WorkerLease>,
    idle_tx: mpsc::UnboundedSender<WorkerLease>,
) {
    loop {
        let task_id = tokio::select! {
            task_id = queue_rx.recv() => match task_id {
                Some(task_id) => task_id,
                None => return,
            },
            _ = shared.shutdown.cancelled() => return,
        };
        loop {
            let lease = tokio::select! {
                lease = idle_rx.recv() => match lease {
                    Some(lease) => lease,
                    None => return,
                },
                _ = shared.shutdown.cancelled() => return,
            };
            let frame = {
                let mut pending = shared.pending.lock().expect("pending lock poisoned");
                match pending.get_mut(&task_id) {
                    Some(task) => {
                        task.worker = Some((lease.index, lease.generation));
                        Some(ToWorker::Task(task.message.clone()))
                    }
                    // Timed out (or shed) while queued; the lease stays usable.
                    None => None,
                }
            };
            let Some(frame) = frame else {
                let _ = idle_tx.send(lease);
                break;
            };
            if lease.input.send(frame).is_ok() {
                let _ = shared.events_tx.send(PoolEvent::Assigned {
                    index: lease.index,
                    generation: lease.generation,
                    task_id,
                });
                break;
            }
            // Stale lease for a dead worker: unclaim and try another.
            let mut pending = shared.pending.lock().expect("pending lock poisoned");
            if let Some(task) = pending.get_mut(&task_id) {
                task.worker = None;
            }
        }
    }
}

// ── Supervisor ──────────────────────────────────────────────────────────────

async fn run_supervisor(
    shared: Arc<PoolShared>,
    mut events_rx: mpsc::UnboundedReceiver<PoolEvent>,
    idle_tx: mpsc::UnboundedSender<WorkerLease>,
) {
    let size = shared.config.size;
    let mut slots: Vec<WorkerSlot> = (0..size)
        .map(|index| spawn_worker(&shared, index, 1))
        .collect();

    loop {
        let next_deadline = nearest_deadline(&shared);
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                handle_event(&shared, &mut slots, &idle_tx, event, false);
            }
            _ = shared.deadline_changed.notified() => {
                // Re-evaluate the nearest deadline on the next turn.
            }
            _ = sleep_until_opt(next_deadline) => {
                expire_deadlines(&shared, &mut slots);
            }
            _ = shared.shutdown.cancelled() => {
                drain(&shared, &mut slots, &mut events_rx).await;
                return;
            }
        }
    }
}

fn nearest_deadline(shared: &PoolShared) -> Option<Instant> {
    shared
        .pending
        .lock()
        .expect("pending lock poisoned")
        .values()
        .filter_map(|task| task.deadline)
        .min()
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn handle_event(
    shared: &Arc<PoolShared>,
    slots: &mut Vec<WorkerSlot>,
    idle_tx: &mpsc::UnboundedSender<WorkerLease>,
    event: PoolEvent,
    draining: bool,
) {
    match event {
        PoolEvent::Ready { index, generation, pid } => {
            let slot = &mut slots[index];
            if slot.generation != generation || slot.state == SlotState::Dead {
                return;
            }
            slot.pid = Some(pid);
            slot.state = SlotState::Idle;
            debug!(pool = %shared.config.name, index, pid, "worker ready");
            if draining {
                // A replacement that came up mid-drain goes straight down.
                if let Some(input) = &slot.input {
                    let _ = input.send(ToWorker::Stop);
                }
                return;
            }
            shared.ready_tx.send_modify(|ready| *ready += 1);
            if let Some(input) = &slot.input {
                let _ = idle_tx.send(WorkerLease {
                    index,
                    generation,
                    input: input.clone(),
                });
            }
        }
        PoolEvent::Assigned { index, generation, task_id } => {
            let slot = &mut slots[index];
            if slot.generation != generation || slot.state == SlotState::Dead {
                return;
            }
            slot.state = SlotState::Busy { task_id };
            shared.busy.fetch_add(1, Ordering::SeqCst);
        }
        PoolEvent::Result { index, generation, message } => {
            let task_id = message.task_id;
            let removed = {
                let mut pending = shared.pending.lock().expect("pending lock poisoned");
                pending.remove(&task_id)
            };
            if let Some(task) = removed {
                deliver_result(task, message);
            } else {
                // The task already resolved (expired while queued); the
                // worker itself is healthy.
                debug!(pool = %shared.config.name, task_id, "dropping result for resolved task");
            }
            let slot = &mut slots[index];
            if slot.generation == generation {
                if matches!(slot.state, SlotState::Busy { .. }) {
                    shared.busy.fetch_sub(1, Ordering::SeqCst);
                }
                if slot.state != SlotState::Dead {
                    slot.state = SlotState::Idle;
                    if !draining {
                        if let Some(input) = &slot.input {
                            let _ = idle_tx.send(WorkerLease {
                                index,
                                generation,
                                input: input.clone(),
                            });
                        }
                    }
                }
            }
        }
        PoolEvent::Exited { index, generation, exit_code } => {
            let slot = &mut slots[index];
            if slot.generation != generation {
                return;
            }
            if let SlotState::Busy { task_id } = slot.state {
                shared.busy.fetch_sub(1, Ordering::SeqCst);
                let removed = {
                    let mut pending = shared.pending.lock().expect("pending lock poisoned");
                    pending.remove(&task_id)
                };
                if let Some(task) = removed {
                    // The worker died under the task without reporting.
                    let mut error = ExecutionError::system(format!(
                        "worker exited without producing a result (pid {:?})",
                        slot.pid
                    ));
                    if let Some(code) = exit_code {
                        error = error.with_details(serde_json::json!({ "exitCode": code }));
                    }
                    error!(
                        pool = %shared.config.name,
                        index,
                        pid = ?slot.pid,
                        task_id,
                        exit_code,
                        "worker crashed while busy"
                    );
                    let now = Utc::now();
                    let mut result = ExecutionResult::err(error, task.admitted_at, now);
                    if let Some(pid) = slot.pid {
                        result = result.with_worker_pid(pid);
                    }
                    let _ = task.reply.send(result);
                }
            }
            let was_dead = slot.state == SlotState::Dead;
            slot.state = SlotState::Dead;
            slot.input = None;
            if draining {
                return;
            }
            if !was_dead {
                debug!(pool = %shared.config.name, index, "worker exited unexpectedly");
            }
            // Replace at the same index; the replacement enters the idle
            // queue once its own handshake arrives.
            shared.restarts.fetch_add(1, Ordering::SeqCst);
            let next_generation = generation + 1;
            slots[index] = spawn_worker(shared, index, next_generation);
        }
    }
}

/// Resolve every pending task whose deadline has passed. Assigned tasks
/// cost their worker its life; queued tasks resolve without a kill.
fn expire_deadlines(shared: &Arc<PoolShared>, slots: &mut [WorkerSlot]) {
    let now = Instant::now();
    let expired: Vec<(u64, PendingTask)> = {
        let mut pending = shared.pending.lock().expect("pending lock poisoned");
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, task)| task.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|task| (id, task)))
            .collect()
    };

    for (task_id, task) in expired {
        let mut pid = None;
        if let Some((index, generation)) = task.worker {
            let slot = &mut slots[index];
            if slot.generation == generation && slot.state != SlotState::Dead {
                pid = slot.pid;
                warn!(
                    pool = %shared.config.name,
                    index,
                    pid = ?slot.pid,
                    task_id,
                    "deadline passed, killing worker"
                );
                if matches!(slot.state, SlotState::Busy { .. }) {
                    shared.busy.fetch_sub(1, Ordering::SeqCst);
                }
                slot.state = SlotState::Dead;
                slot.input = None;
                // The monitor runs the SIGTERM → grace → SIGKILL sequence
                // and reports the exit, which triggers the replacement.
                slot.kill.cancel();
            }
        }
        let now_wall = Utc::now();
        let mut result = ExecutionResult::err(
            ExecutionError::timeout("execution exceeded its deadline"),
            task.admitted_at,
            now_wall,
        );
        if let Some(pid) = pid {
            result = result.with_worker_pid(pid);
        }
        let _ = task.reply.send(result);
    }
}

fn deliver_result(task: PendingTask, message: ResultMessage) {
    let result = if message.success {
        ExecutionResult {
            success: true,
            data: message.data,
            error: None,
            started_at: message.started_at,
            ended_at: message.ended_at,
            worker_pid: Some(message.pid),
            response_meta: message.response_meta.filter(|m| !m.is_empty()),
        }
    } else {
        ExecutionResult {
            success: false,
            data: None,
            error: Some(message.error.unwrap_or_else(|| {
                ExecutionError::system("worker reported failure without an error")
            })),
            started_at: message.started_at,
            ended_at: message.ended_at,
            worker_pid: Some(message.pid),
            response_meta: message.response_meta.filter(|m| !m.is_empty()),
        }
    };
    let _ = task.reply.send(result);
}

/// Drain on shutdown: stop sentinels to every live worker, queued tasks
/// shed as rejected, deadlines still enforced, then wait for every worker
/// to exit (force-killing stragglers once the grace window passes).
async fn drain(
    shared: &Arc<PoolShared>,
    slots: &mut Vec<WorkerSlot>,
    events_rx: &mut mpsc::UnboundedReceiver<PoolEvent>,
) {
    let (dead_tx, _) = mpsc::unbounded_channel();
    for slot in slots.iter() {
        if let Some(input) = &slot.input {
            let _ = input.send(ToWorker::Stop);
        }
    }
    // Shed everything still waiting for a worker.
    let shed: Vec<PendingTask> = {
        let mut pending = shared.pending.lock().expect("pending lock poisoned");
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, task)| task.worker.is_none())
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
    };
    for task in shed {
        let _ = task.reply.send(rejected_draining());
    }

    // With `wait = true` workers drain at their own pace (deadlines still
    // enforced); otherwise stragglers are force-killed after the grace.
    let graceful = shared.drain_graceful.load(Ordering::SeqCst);
    let force_at = (!graceful).then(|| Instant::now() + shared.config.kill_grace);
    let mut forced = false;
    loop {
        if slots.iter().all(|slot| slot.state == SlotState::Dead) {
            break;
        }
        let wake = match (nearest_deadline(shared), force_at.filter(|_| !forced)) {
            (Some(deadline), Some(force)) => Some(deadline.min(force)),
            (Some(deadline), None) => Some(deadline),
            (None, force) => force,
        };
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                handle_event(shared, slots, &dead_tx, event, true);
            }
            _ = sleep_until_opt(wake) => {
                expire_deadlines(shared, slots);
                if let Some(force) = force_at {
                    if !forced && Instant::now() >= force {
                        forced = true;
                        for slot in slots.iter() {
                            if slot.state != SlotState::Dead {
                                slot.kill.cancel();
                            }
                        }
                    }
                }
            }
        }
    }
    debug!(pool = %shared.config.name, "drain complete");
}

// ── Worker spawning ─────────────────────────────────────────────────────────

fn spawn_worker(shared: &Arc<PoolShared>, index: usize, generation: u64) -> WorkerSlot {
    let kill = CancellationToken::new();
    let (input_tx, input_rx) = mpsc::unbounded_channel::<ToWorker>();

    match launch_child(shared) {
        Ok(mut child) => {
            let pid = child.id().unwrap_or_default();
            let stdin = child.stdin.take();
            let stdout = child.stdout.take();

            let writer = tokio::spawn(run_writer(shared.clone(), index, stdin, input_rx));
            if let Some(stdout) = stdout {
                tokio::spawn(run_reader(shared.clone(), index, generation, stdout));
            }
            tokio::spawn(run_monitor(
                shared.clone(),
                index,
                generation,
                child,
                pid,
                kill.clone(),
                writer,
            ));

            WorkerSlot {
                generation,
                pid: Some(pid),
                state: SlotState::Spawning,
                input: Some(input_tx),
                kill,
            }
        }
        Err(e) => {
            error!(pool = %shared.config.name, index, error = %e, "failed to spawn worker");
            // Report the stillborn worker so the supervisor retries the
            // index through the normal replacement path.
            let events_tx = shared.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = events_tx.send(PoolEvent::Exited {
                    index,
                    generation,
                    exit_code: None,
                });
            });
            WorkerSlot {
                generation,
                pid: None,
                state: SlotState::Spawning,
                input: Some(input_tx),
                kill,
            }
        }
    }
}

fn launch_child(shared: &Arc<PoolShared>) -> std::io::Result<Child> {
    let spec = &shared.command;
    let mut command = std::process::Command::new(&spec.program);
    command.args(&spec.args);
    for (key, value) in &spec.envs {
        command.env(key, value);
    }
    command.env(WORKER_ENV, &shared.config.name);
    command
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit());

    #[cfg(unix)]
    if shared.config.kill_tree {
        // Own process group so a tree kill reaches grandchildren.
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut command = Command::from(command);
    command.kill_on_drop(true);
    command.spawn()
}

async fn run_writer(
    shared: Arc<PoolShared>,
    index: usize,
    stdin: Option<tokio::process::ChildStdin>,
    mut input_rx: mpsc::UnboundedReceiver<ToWorker>,
) {
    let Some(mut stdin) = stdin else { return };
    while let Some(frame) = input_rx.recv().await {
        let line = match protocol::encode(&frame) {
            Ok(line) => line,
            Err(e) => {
                error!(pool = %shared.config.name, index, error = %e, "cannot encode worker frame");
                continue;
            }
        };
        if stdin.write_all(line.as_bytes()).await.is_err()
            || stdin.write_all(b"\n").await.is_err()
            || stdin.flush().await.is_err()
        {
            // Worker pipe broken; its monitor reports the exit.
            break;
        }
    }
}

async fn run_reader(
    shared: Arc<PoolShared>,
    index: usize,
    generation: u64,
    stdout: tokio::process::ChildStdout,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match protocol::decode::<FromWorker>(&line) {
            Ok(FromWorker::Ready { pid }) => {
                let _ = shared.events_tx.send(PoolEvent::Ready {
                    index,
                    generation,
                    pid,
                });
            }
            Ok(FromWorker::Result(message)) => {
                let _ = shared.events_tx.send(PoolEvent::Result {
                    index,
                    generation,
                    message,
                });
            }
            Err(e) => {
                warn!(
                    pool = %shared.config.name,
                    index,
                    error = %e,
                    "undecodable frame from worker, ignoring"
                );
            }
        }
    }
}

async fn run_monitor(
    shared: Arc<PoolShared>,
    index: usize,
    generation: u64,
    mut child: Child,
    pid: u32,
    kill: CancellationToken,
    writer: JoinHandle<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = kill.cancelled() => {
            kill_child(&mut child, pid, shared.config.kill_grace, shared.config.kill_tree).await
        }
    };
    writer.abort();
    let _ = shared.events_tx.send(PoolEvent::Exited {
        index,
        generation,
        exit_code: status.and_then(|s| s.code()),
    });
}

/// SIGTERM, wait out the grace window, then SIGKILL. With `kill_tree` the
/// signals target the worker's process group.
async fn kill_child(
    child: &mut Child,
    pid: u32,
    grace: Duration,
    kill_tree: bool,
) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        let target = if kill_tree { -(pid as i32) } else { pid as i32 };
        // Termination is unconditional; a failed signal (already-dead
        // process) is resolved by the wait below.
        unsafe {
            libc::kill(target, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status.ok();
        }
        if kill_tree {
            unsafe {
                libc::kill(target, libc::SIGKILL);
            }
        }
        let _ = child.start_kill();
        child.wait().await.ok()
    }
    #[cfg(not(unix))]
    {
        // No process groups here; a plain kill is the whole policy.
        let _ = grace;
        let _ = kill_tree;
        let _ = child.start_kill();
        child.wait().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algoserve_core::def::AlgorithmDef;
    use algoserve_core::spec::RunError;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct In {
        value: i64,
    }

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct Out {
        doubled: i64,
    }

    fn request(timeout_s: Option<f64>) -> ExecutionRequest {
        let mut registry = algoserve_core::registry::AlgorithmRegistry::new();
        registry
            .register(
                AlgorithmDef::function("double", "v1", |inp: In| {
                    Ok::<_, RunError>(Out {
                        doubled: inp.value * 2,
                    })
                })
                .author("tests")
                .category("arithmetic")
                .created("2026-01-01"),
            )
            .unwrap();
        ExecutionRequest {
            spec: registry.get("double", "v1").unwrap(),
            payload: serde_json::json!({"value": 1}),
            hyperparams: None,
            request_id: "r1".to_string(),
            request_datetime: Utc::now(),
            trace_id: None,
            context: None,
            timeout_s,
        }
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let pool = WorkerPool::new(
            PoolConfig::new("test", 1),
            WorkerCommand::new("/nonexistent"),
        );
        let result = pool.submit(request(None)).await;
        assert!(!result.success);
        assert_eq!(
            result.error.unwrap().kind,
            algoserve_core::execution::ErrorKind::Rejected
        );
    }

    #[tokio::test]
    async fn start_fails_when_workers_cannot_spawn() {
        tokio::time::pause();
        let pool = Arc::new(WorkerPool::new(
            PoolConfig::new("test", 1),
            WorkerCommand::new("/definitely/not/a/binary"),
        ));
        let pool_for_start = pool.clone();
        let start = tokio::spawn(async move { pool_for_start.start().await });
        // Let the handshake wait time out on the paused clock.
        tokio::time::advance(SPAWN_TIMEOUT + Duration::from_secs(1)).await;
        let result = start.await.unwrap();
        assert!(matches!(result, Err(ExecutorError::Start(_))));
    }

    #[test]
    fn pool_config_clamps_size() {
        let config = PoolConfig::new("test", 0);
        assert_eq!(config.size, 1);
    }

    #[test]
    fn stats_report_configuration() {
        let pool = WorkerPool::new(
            PoolConfig::new("shared", 3),
            WorkerCommand::new("/bin/true"),
        );
        let stats = pool.stats();
        assert_eq!(stats.name, "shared");
        assert_eq!(stats.size, 3);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.pending, 0);
    }
}
