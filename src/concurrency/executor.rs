//! Bounded Thread Pool
//!
//! This module implements [`Executor`], the pool the blocking server hands
//! accepted connections to.
//!
//! ## Design
//!
//! ```text
//!   execute(f) ──> ┌──────────────────────────┐
//!                  │ Mutex<Inner>             │
//!                  │  tasks: VecDeque<Task>   │ <── empty_condition ──┐
//!                  │  workers: {id: handle}   │                      │
//!                  │  state: Run|Stopping|..  │                 ┌────┴─────┐
//!                  └──────────────────────────┘                 │ worker 0 │
//!                                                               │ worker 1 │
//!                                                               │ worker N │
//!                                                               └──────────┘
//! ```
//!
//! - The pool starts `low_watermark` workers and grows on demand, one worker
//!   per submission, while every worker is busy and the pool is below
//!   `high_watermark`.
//! - Idle workers park on `empty_condition` for at most `idle_time`. A worker
//!   that times out with nothing to do while the pool is above
//!   `low_watermark` exits and deregisters itself.
//! - `stop` never drops queued work: workers only leave once the queue is
//!   empty.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// A unit of work.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Sizing and timing knobs for an [`Executor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Workers kept alive even when idle
    pub low_watermark: usize,

    /// Upper bound on the number of workers
    pub high_watermark: usize,

    /// Maximum number of queued (not yet started) tasks
    pub max_queue_size: usize,

    /// How long a worker above the low watermark waits for work before exiting
    pub idle_time: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            low_watermark: 4,
            high_watermark: 16,
            max_queue_size: 100,
            idle_time: Duration::from_millis(10_000),
        }
    }
}

/// Lifecycle of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Tasks are accepted and executed
    Run,
    /// No new tasks are accepted; queued ones still run
    Stopping,
    /// Every worker has exited
    Stopped,
}

struct Inner {
    state: State,
    tasks: VecDeque<Task>,
    workers: HashMap<ThreadId, JoinHandle<()>>,
    /// Workers currently running a task
    busy: usize,
    /// Used for thread names only
    next_worker_id: usize,
}

struct Shared {
    name: String,
    config: ExecutorConfig,
    inner: Mutex<Inner>,
    /// Signalled when a task is queued or the pool starts stopping
    empty_condition: Condvar,
    /// Signalled when the last worker exits
    stopping_condition: Condvar,
}

/// A thread pool with a bounded queue and low/high watermarks.
///
/// # Example
///
/// ```
/// use lrukv::concurrency::{Executor, ExecutorConfig};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let executor = Executor::new("example", ExecutorConfig::default());
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// for _ in 0..10 {
///     let counter = Arc::clone(&counter);
///     assert!(executor.execute(move || {
///         counter.fetch_add(1, Ordering::SeqCst);
///     }));
/// }
///
/// executor.stop(true);
/// assert_eq!(counter.load(Ordering::SeqCst), 10);
/// ```
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    /// Creates a pool and starts `low_watermark` workers.
    ///
    /// Worker threads are named `<name>-<n>`.
    pub fn new(name: impl Into<String>, mut config: ExecutorConfig) -> Self {
        config.high_watermark = config.high_watermark.max(config.low_watermark).max(1);

        let shared = Arc::new(Shared {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Run,
                tasks: VecDeque::new(),
                workers: HashMap::new(),
                busy: 0,
                next_worker_id: 0,
            }),
            empty_condition: Condvar::new(),
            stopping_condition: Condvar::new(),
        });

        {
            let mut inner = shared.inner.lock();
            for _ in 0..shared.config.low_watermark {
                spawn_worker(&shared, &mut inner);
            }
        }

        Self { shared }
    }

    /// Queues a task for execution.
    ///
    /// Returns `false` if the pool is stopping or the queue is full; the task
    /// is dropped without running. The call never waits for the task.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();

        if inner.state != State::Run {
            debug!(pool = %shared.name, "Rejecting task: executor is stopping");
            return false;
        }
        if inner.tasks.len() >= shared.config.max_queue_size {
            debug!(pool = %shared.name, queued = inner.tasks.len(), "Rejecting task: queue is full");
            return false;
        }

        // Every worker is (or is about to be) busy: grow if we may
        if inner.tasks.len() + inner.busy >= inner.workers.len()
            && inner.workers.len() < shared.config.high_watermark
            && !spawn_worker(shared, &mut inner)
            && inner.workers.is_empty()
        {
            return false;
        }

        inner.tasks.push_back(Box::new(task));
        shared.empty_condition.notify_one();
        true
    }

    /// Stops accepting tasks and lets workers exit once the queue drains.
    ///
    /// With `await_workers` the call blocks until every worker has exited.
    /// Must not be called with `await_workers` from inside a pool task.
    pub fn stop(&self, await_workers: bool) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();

        if inner.state == State::Stopped {
            return;
        }
        inner.state = State::Stopping;
        shared.empty_condition.notify_all();

        if inner.workers.is_empty() {
            inner.state = State::Stopped;
            return;
        }

        if await_workers {
            while !inner.workers.is_empty() {
                shared.stopping_condition.wait(&mut inner);
            }
            inner.state = State::Stopped;
        }
        debug!(pool = %shared.name, "Executor stopped");
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    /// Returns the number of live workers.
    pub fn worker_count(&self) -> usize {
        self.shared.inner.lock().workers.len()
    }

    /// Returns the number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.inner.lock().tasks.len()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop(true);
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Executor")
            .field("name", &self.shared.name)
            .field("state", &inner.state)
            .field("workers", &inner.workers.len())
            .field("busy", &inner.busy)
            .field("queued", &inner.tasks.len())
            .finish()
    }
}

/// Starts one worker. Must be called with the pool lock held, so the worker
/// cannot deregister before it is registered.
fn spawn_worker(shared: &Arc<Shared>, inner: &mut Inner) -> bool {
    let id = inner.next_worker_id;
    inner.next_worker_id += 1;

    let worker_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("{}-{}", shared.name, id))
        .spawn(move || perform(worker_shared));

    match spawned {
        Ok(handle) => {
            inner.workers.insert(handle.thread().id(), handle);
            trace!(pool = %shared.name, workers = inner.workers.len(), "Worker spawned");
            true
        }
        Err(e) => {
            warn!(pool = %shared.name, error = %e, "Failed to spawn worker");
            false
        }
    }
}

/// Worker main loop: pull tasks until stopped or idle for too long.
fn perform(shared: Arc<Shared>) {
    let mut inner = shared.inner.lock();

    loop {
        if let Some(task) = inner.tasks.pop_front() {
            inner.busy += 1;
            MutexGuard::unlocked(&mut inner, || run_task(&shared.name, task));
            inner.busy -= 1;
            continue;
        }

        if inner.state != State::Run {
            break;
        }

        let result = shared
            .empty_condition
            .wait_for(&mut inner, shared.config.idle_time);
        if result.timed_out()
            && inner.tasks.is_empty()
            && inner.state == State::Run
            && inner.workers.len() > shared.config.low_watermark
        {
            debug!(pool = %shared.name, "Idle worker exiting");
            break;
        }
    }

    // Dropping our own handle detaches the thread
    inner.workers.remove(&thread::current().id());
    if inner.workers.is_empty() {
        if inner.state == State::Stopping {
            inner.state = State::Stopped;
        }
        shared.stopping_condition.notify_all();
    }
}

fn run_task(pool: &str, task: Task) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(pool = %pool, panic = %message, "Task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn config(low: usize, high: usize, queue: usize, idle_ms: u64) -> ExecutorConfig {
        ExecutorConfig {
            low_watermark: low,
            high_watermark: high,
            max_queue_size: queue,
            idle_time: Duration::from_millis(idle_ms),
        }
    }

    /// Polls `cond` until it holds or a generous deadline passes.
    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_runs_every_task() {
        let executor = Executor::new("test", config(2, 4, 100, 1000));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            assert!(executor.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        executor.stop(true);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(executor.state(), State::Stopped);
        assert_eq!(executor.worker_count(), 0);
    }

    #[test]
    fn test_rejects_when_queue_full() {
        let executor = Executor::new("test", config(1, 1, 2, 1000));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        assert!(executor.execute(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }));
        started_rx.recv().unwrap();

        assert!(executor.execute(|| {}));
        assert!(executor.execute(|| {}));
        assert!(!executor.execute(|| {}));
        assert_eq!(executor.queued(), 2);

        release_tx.send(()).unwrap();
        executor.stop(true);
        assert_eq!(executor.queued(), 0);
    }

    #[test]
    fn test_rejects_after_stop() {
        let executor = Executor::new("test", config(1, 2, 10, 1000));
        executor.stop(false);
        assert!(!executor.execute(|| {}));
        executor.stop(true);
        assert_eq!(executor.state(), State::Stopped);
    }

    #[test]
    fn test_grows_to_high_watermark() {
        let executor = Executor::new("test", config(1, 4, 10, 1000));
        let (started_tx, started_rx) = mpsc::channel();
        let release = Arc::new((Mutex::new(false), Condvar::new()));

        for _ in 0..4 {
            let started_tx = started_tx.clone();
            let release = Arc::clone(&release);
            assert!(executor.execute(move || {
                started_tx.send(()).unwrap();
                let (lock, cond) = &*release;
                let mut released = lock.lock();
                while !*released {
                    cond.wait(&mut released);
                }
            }));
        }

        for _ in 0..4 {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(executor.worker_count(), 4);

        // At the high watermark further work queues up instead of spawning
        assert!(executor.execute(|| {}));
        assert_eq!(executor.worker_count(), 4);

        let (lock, cond) = &*release;
        *lock.lock() = true;
        cond.notify_all();
        executor.stop(true);
    }

    #[test]
    fn test_shrinks_to_low_watermark_when_idle() {
        let executor = Executor::new("test", config(1, 3, 10, 50));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));

        for _ in 0..3 {
            let started_tx = started_tx.clone();
            let release_rx = Arc::clone(&release_rx);
            executor.execute(move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.lock().unwrap().recv();
            });
        }
        for _ in 0..3 {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(executor.worker_count(), 3);

        drop(release_tx);
        assert!(wait_until(|| executor.worker_count() == 1));
        assert_eq!(executor.state(), State::Run);
        executor.stop(true);
    }

    #[test]
    fn test_survives_panicking_task() {
        let executor = Executor::new("test", config(1, 1, 10, 1000));
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(executor.execute(|| panic!("boom")));
        let c = Arc::clone(&counter);
        assert!(executor.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        executor.stop(true);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_drains_queue() {
        let executor = Executor::new("test", config(1, 1, 10, 1000));
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(executor.execute(|| thread::sleep(Duration::from_millis(50))));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            assert!(executor.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        executor.stop(false);
        assert!(!executor.execute(|| {}));
        assert!(wait_until(|| executor.state() == State::Stopped));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_zero_low_watermark_spawns_on_demand() {
        let executor = Executor::new("test", config(0, 2, 10, 50));
        assert_eq!(executor.worker_count(), 0);

        let (tx, rx) = mpsc::channel();
        assert!(executor.execute(move || tx.send(42).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);

        assert!(wait_until(|| executor.worker_count() == 0));
        executor.stop(true);
        assert_eq!(executor.state(), State::Stopped);
    }
}
