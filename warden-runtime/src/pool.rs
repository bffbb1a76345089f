//! # Stress-Aware Worker Pool
//!
//! A fixed set of OS threads, each draining its own FIFO queue, with a
//! dispatcher that steers work towards the least stressed worker.
//!
//! ## Design
//!
//! - Each worker owns a `crossbeam-channel` queue of boxed `FnOnce` jobs
//!   and a [`Wellness`] record guarded by a `parking_lot::Mutex`.
//! - `submit` picks the worker with the lowest stress strictly below
//!   `stress_threshold` (ties go to the shorter queue), falling back to
//!   round-robin. A worker that needs a mandatory break refuses
//!   assignment, and the submission fails with
//!   [`WardenError::workers_overwhelmed`].
//! - Tasks run under `catch_unwind`. A panic fails only that task's
//!   [`TaskHandle`]; the worker keeps draining its queue.
//! - Before starting a task, a worker that is due a break rests first.
//!   A worker that finishes work, finds its queue empty and is due a break
//!   rests on its own, so a refusing worker always recovers. Rests are
//!   sleeps on the worker's own thread and are cut short by shutdown.
//! - Shutdown stops every worker after its current task. Tasks still queued
//!   are dropped without running; their handles report
//!   [`WardenError::task_discarded`].
//!
//! ## Worker States
//!
//! ```text
//!   Idle ──► Executing ──► Idle
//!     │                     ▲
//!     └──────► Resting ─────┘          any ──► Stopped (shutdown)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Result, WardenError};
use crate::panic::catch_panic;
use crate::wellness::{Wellness, WellnessSnapshot};

// ============================================================================
// Jobs and Handles
// ============================================================================

/// Outcome of running a job: whether it succeeded, and how to deliver its
/// result once the worker has updated its wellness.
struct Completion {
    succeeded: bool,
    publish: Box<dyn FnOnce() + Send>,
}

type Job = Box<dyn FnOnce() -> Completion + Send>;

enum Message {
    Run(Job),
    Rest,
}

/// The pending result of a submitted task.
///
/// Dropping the handle does not cancel the task.
pub struct TaskHandle<R> {
    result: Receiver<Result<R>>,
    worker: usize,
}

impl<R> TaskHandle<R> {
    /// The worker the task was assigned to.
    pub fn worker_id(&self) -> usize {
        self.worker
    }

    /// Block until the task finishes.
    ///
    /// Fails if the task panicked or was discarded at shutdown.
    pub fn join(self) -> Result<R> {
        self.result
            .recv()
            .unwrap_or_else(|_| Err(WardenError::task_discarded()))
    }

    /// Wait up to `timeout` for the task. `None` means still pending.
    pub fn join_timeout(&self, timeout: Duration) -> Option<Result<R>> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(WardenError::task_discarded())),
        }
    }

    /// Take the result if the task has finished.
    pub fn try_join(&self) -> Option<Result<R>> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(WardenError::task_discarded())),
        }
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("worker", &self.worker)
            .field("ready", &!self.result.is_empty())
            .finish()
    }
}

/// Box `task` so that its result (or panic) lands in a one-shot channel.
fn package<F, R>(task: F, worker: usize) -> (Job, TaskHandle<R>)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = bounded(1);
    let job: Job = Box::new(move || match catch_panic(task) {
        Ok(value) => Completion {
            succeeded: true,
            publish: Box::new(move || {
                let _ = tx.send(Ok(value));
            }),
        },
        Err(info) => {
            let err = WardenError::task_panicked(info.message());
            Completion {
                succeeded: false,
                publish: Box::new(move || {
                    let _ = tx.send(Err(err));
                }),
            }
        }
    });
    (job, TaskHandle { result: rx, worker })
}

// ============================================================================
// Workers
// ============================================================================

/// Lifecycle state of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a task.
    Idle,
    /// Running a task.
    Executing,
    /// Taking a wellness break.
    Resting,
    /// Exited after shutdown.
    Stopped,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Executing,
            2 => WorkerState::Resting,
            _ => WorkerState::Stopped,
        }
    }
}

/// State shared between a worker thread and the pool.
struct WorkerShared {
    id: usize,
    wellness: Mutex<Wellness>,
    state: AtomicU8,
    stop: AtomicBool,
    /// Wakes a resting worker early on shutdown.
    rest_lock: Mutex<()>,
    rest_signal: Condvar,
}

impl WorkerShared {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        let _guard = self.rest_lock.lock();
        self.stop.store(true, Ordering::Release);
        self.rest_signal.notify_all();
    }

    fn stress(&self) -> f32 {
        self.wellness.lock().stress()
    }

    fn needs_break(&self, config: &PoolConfig) -> bool {
        self.wellness.lock().needs_break(config, Instant::now())
    }

    /// Called when the queue runs dry: stop the work clock, and rest if the
    /// spell that just ended left the worker due a break.
    fn settle(&self, config: &PoolConfig) {
        let due = {
            let mut wellness = self.wellness.lock();
            let now = Instant::now();
            let due = wellness.is_working() && wellness.needs_break(config, now);
            wellness.go_idle();
            due
        };
        if due {
            debug!(worker = self.id, "queue empty and due a break");
            self.rest(config);
        }
    }

    /// Sleep for the rest duration unless stopped first.
    fn rest(&self, config: &PoolConfig) {
        self.set_state(WorkerState::Resting);
        debug!(worker = self.id, duration = ?config.rest_duration, "worker resting");

        let deadline = Instant::now() + config.rest_duration;
        let mut guard = self.rest_lock.lock();
        while !self.stopping() && Instant::now() < deadline {
            self.rest_signal.wait_until(&mut guard, deadline);
        }
        drop(guard);

        if !self.stopping() {
            self.wellness.lock().complete_rest(Instant::now());
        }
        self.set_state(WorkerState::Idle);
    }

    fn run(&self, config: &PoolConfig, queue: Receiver<Message>) {
        debug!(worker = self.id, "worker started");

        loop {
            let message = match queue.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {
                    self.settle(config);
                    if self.stopping() {
                        break;
                    }
                    match queue.recv() {
                        Ok(message) => message,
                        Err(_) => break,
                    }
                }
            };
            if self.stopping() {
                break;
            }
            match message {
                Message::Rest => self.rest(config),
                Message::Run(job) => {
                    if self.needs_break(config) {
                        self.rest(config);
                        if self.stopping() {
                            break;
                        }
                    }

                    self.wellness.lock().begin_work(Instant::now());
                    self.set_state(WorkerState::Executing);
                    let completion = job();
                    if completion.succeeded {
                        self.wellness
                            .lock()
                            .record_completion(config, Instant::now());
                    } else {
                        warn!(worker = self.id, "task panicked");
                    }
                    self.set_state(WorkerState::Idle);
                    (completion.publish)();
                }
            }
        }

        let dropped = queue.len();
        if dropped > 0 {
            warn!(worker = self.id, dropped, "discarding queued tasks at shutdown");
        }
        self.set_state(WorkerState::Stopped);
        debug!(worker = self.id, "worker stopped");
    }
}

/// Pool-side handle to a worker thread.
struct WorkerHandle {
    shared: Arc<WorkerShared>,
    queue: Option<Sender<Message>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn queue_len(&self) -> usize {
        self.queue.as_ref().map_or(0, Sender::len)
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Aggregate pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    /// Number of workers.
    pub worker_count: usize,
    /// Mean stress across workers.
    pub average_stress: f32,
    /// Tasks completed across workers.
    pub total_tasks_completed: u64,
    /// Workers whose stress exceeds the pool threshold.
    pub workers_above_threshold: usize,
    /// Workers currently resting.
    pub workers_resting: usize,
    /// Sum of queued, not yet started messages.
    pub total_queue_depth: usize,
}

/// Fixed-size pool of stress-aware worker threads.
pub struct WorkerPool {
    config: Arc<PoolConfig>,
    workers: RwLock<Vec<WorkerHandle>>,
    next_worker: AtomicUsize,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Spawn `config.num_workers` workers (at least one).
    pub fn new(config: PoolConfig) -> Result<Self> {
        let config = Arc::new(config);
        let count = config.num_workers.max(1);
        let pool = Self {
            config: Arc::clone(&config),
            workers: RwLock::new(Vec::with_capacity(count)),
            next_worker: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        };

        for id in 0..count {
            let shared = Arc::new(WorkerShared {
                id,
                wellness: Mutex::new(Wellness::new(Instant::now())),
                state: AtomicU8::new(WorkerState::Idle as u8),
                stop: AtomicBool::new(false),
                rest_lock: Mutex::new(()),
                rest_signal: Condvar::new(),
            });
            let (tx, rx) = unbounded();
            let worker = Arc::clone(&shared);
            let worker_config = Arc::clone(&config);

            // On error `pool` drops here and joins the workers already started.
            let thread = thread::Builder::new()
                .name(format!("warden-worker-{}", id))
                .spawn(move || worker.run(&worker_config, rx))
                .map_err(|e| WardenError::spawn_failed("worker thread", &e))?;

            pool.workers.write().push(WorkerHandle {
                shared,
                queue: Some(tx),
                thread: Some(thread),
            });
        }

        info!(workers = count, "worker pool started");
        Ok(pool)
    }

    /// The pool's policy.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Submit a task to the best available worker.
    pub fn submit<F, R>(&self, task: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(WardenError::shut_down());
        }

        let workers = self.workers.read();
        let chosen = self.select_worker(&workers);
        let (job, handle) = package(task, chosen);

        if self.assign(&workers[chosen], Message::Run(job)) {
            Ok(handle)
        } else {
            warn!(worker = chosen, "dispatch refused, workers need rest");
            Err(WardenError::workers_overwhelmed())
        }
    }

    /// Assign a task to a specific worker.
    ///
    /// Returns `None` without enqueueing if the worker does not exist, is
    /// due a mandatory break, or the pool is shut down.
    pub fn try_assign<F, R>(&self, worker: usize, task: F) -> Option<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_shut_down() {
            return None;
        }
        let workers = self.workers.read();
        let target = workers.get(worker)?;
        let (job, handle) = package(task, worker);
        self.assign(target, Message::Run(job)).then_some(handle)
    }

    /// Like [`try_assign`](Self::try_assign), reporting refusal as an error.
    pub fn submit_to<F, R>(&self, worker: usize, task: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.try_assign(worker, task)
            .ok_or_else(|| WardenError::assignment_refused(worker))
    }

    /// Queue a rest for every worker whose stress exceeds the threshold or
    /// that is due a mandatory break, skipping workers already resting.
    ///
    /// Rests run after work already queued. Returns the number scheduled.
    pub fn ensure_wellness(&self) -> usize {
        let workers = self.workers.read();
        let mut scheduled = 0;
        for worker in workers.iter() {
            let shared = &worker.shared;
            let wants_rest = shared.stress() > self.config.stress_threshold
                || shared.needs_break(&self.config);
            if wants_rest
                && shared.state() != WorkerState::Resting
                && Self::enqueue(worker, Message::Rest)
            {
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            debug!(scheduled, "wellness breaks scheduled");
        }
        scheduled
    }

    /// Queue a rest for one worker regardless of its stress.
    pub fn force_rest(&self, worker: usize) -> bool {
        self.workers
            .read()
            .get(worker)
            .map_or(false, |w| Self::enqueue(w, Message::Rest))
    }

    /// Wellness metrics of one worker.
    pub fn worker_wellness(&self, worker: usize) -> Option<WellnessSnapshot> {
        self.workers
            .read()
            .get(worker)
            .map(|w| w.shared.wellness.lock().snapshot(Instant::now()))
    }

    /// Lifecycle state of one worker.
    pub fn worker_state(&self, worker: usize) -> Option<WorkerState> {
        self.workers.read().get(worker).map(|w| w.shared.state())
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> PoolStats {
        let workers = self.workers.read();
        let mut stats = PoolStats {
            worker_count: workers.len(),
            ..PoolStats::default()
        };
        let mut stress_sum = 0.0;
        for worker in workers.iter() {
            let (stress, completed) = {
                let wellness = worker.shared.wellness.lock();
                (wellness.stress(), wellness.total_completed())
            };
            stress_sum += stress;
            stats.total_tasks_completed += completed;
            if stress > self.config.stress_threshold {
                stats.workers_above_threshold += 1;
            }
            if worker.shared.state() == WorkerState::Resting {
                stats.workers_resting += 1;
            }
            stats.total_queue_depth += worker.queue_len();
        }
        if !workers.is_empty() {
            stats.average_stress = stress_sum / workers.len() as f32;
        }
        stats
    }

    /// Stop every worker and join its thread. Idempotent.
    ///
    /// Each worker finishes the task it is running. Queued tasks that have
    /// not started are dropped without running.
    pub fn shutdown(&self) {
        for worker in self.workers.read().iter() {
            worker.shared.request_stop();
        }
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut workers = self.workers.write();
        for worker in workers.iter_mut() {
            // Disconnecting wakes a worker blocked on an empty queue.
            drop(worker.queue.take());
        }
        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        info!(workers = workers.len(), "worker pool shut down");
    }

    /// Lowest stress below the threshold wins; ties go to the shorter queue.
    fn select_worker(&self, workers: &[WorkerHandle]) -> usize {
        let mut best: Option<(usize, f32, usize)> = None;
        for (i, worker) in workers.iter().enumerate() {
            let stress = worker.shared.stress();
            if stress >= self.config.stress_threshold {
                continue;
            }
            let depth = worker.queue_len();
            let better = best.map_or(true, |(_, s, d)| stress < s || (stress == s && depth < d));
            if better {
                best = Some((i, stress, depth));
            }
        }
        match best {
            Some((i, _, _)) => i,
            None => self.next_worker.fetch_add(1, Ordering::Relaxed) % workers.len(),
        }
    }

    fn assign(&self, worker: &WorkerHandle, message: Message) -> bool {
        if worker.shared.needs_break(&self.config) {
            return false;
        }
        Self::enqueue(worker, message)
    }

    fn enqueue(worker: &WorkerHandle, message: Message) -> bool {
        match &worker.queue {
            Some(queue) => queue.send(message).is_ok(),
            None => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
