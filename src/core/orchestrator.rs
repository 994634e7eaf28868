// src/core/orchestrator.rs

use log::{debug, error, warn};
use scopeguard::defer;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// A counting join primitive. Every started task increments it; every
/// completed task decrements it; `wait` blocks until the count reaches zero.
///
/// Waiting is idempotent: a second `wait` with no newly started tasks
/// returns immediately.
#[derive(Debug, Default)]
struct JoinLatch {
    pending: Mutex<usize>,
    done: Condvar,
}

impl JoinLatch {
    fn add(&self) {
        *self.pending.lock().unwrap() += 1;
    }

    fn complete(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending -= 1;
        if *pending == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut pending = self.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.done.wait(pending).unwrap();
        }
    }
}

/// Runs a job at the orchestration boundary: a failure is logged and
/// swallowed so one background task cannot abort unrelated concurrent work.
fn run_swallowing(label: &str, job: Job) {
    if let Err(e) = job() {
        error!("Background task ({label}) failed: {e:#}");
    }
}

/// Fire-and-forget task orchestration against the process-wide join latch.
///
/// Tasks run on independent OS threads; there is no ordering guarantee among
/// them, no cancellation, and no timeout. The only promise is that after
/// `wait()` every task started so far has returned.
#[derive(Debug, Default)]
pub struct Orchestrator {
    latch: Arc<JoinLatch>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `f` on its own thread, tracked by this orchestrator's
    /// latch. Never blocks the caller; errors inside `f` are reported but
    /// not raised.
    pub fn start<F>(&self, f: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.latch.add();
        let latch = Arc::clone(&self.latch);
        let spawned = thread::Builder::new()
            .name("runbook-task".into())
            .spawn(move || {
                defer! { latch.complete(); }
                run_swallowing("detached", Box::new(f));
            });
        if let Err(e) = spawned {
            error!("Could not spawn background task thread: {e}");
            self.latch.complete();
        }
    }

    /// Blocks until every task started against this orchestrator has
    /// completed. Safe to call repeatedly.
    pub fn wait(&self) {
        self.latch.wait();
    }

    /// Creates a worker pool bounded by the machine's available parallelism.
    pub fn pool(&self) -> WorkerPool {
        let workers = thread::available_parallelism().map_or(4, usize::from);
        self.pool_with_workers(workers)
    }

    /// Creates a worker pool with an explicit worker count. The pool's join
    /// latch is fully independent from the process-wide one and from any
    /// other pool's.
    pub fn pool_with_workers(&self, workers: usize) -> WorkerPool {
        WorkerPool::new(workers.max(1))
    }
}

static GLOBAL: OnceLock<Orchestrator> = OnceLock::new();

/// The process-wide orchestrator. The host must call `global().wait()` once
/// after the root action chain returns, so background tasks queued during
/// the run are not silently dropped at exit.
pub fn global() -> &'static Orchestrator {
    GLOBAL.get_or_init(Orchestrator::new)
}

/// A bounded set of worker threads consuming a shared job queue, joined by a
/// pool-scoped latch. Waiting on one pool never blocks on another's tasks.
pub struct WorkerPool {
    latch: Arc<JoinLatch>,
    queue: Sender<Job>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}

impl WorkerPool {
    fn new(workers: usize) -> Self {
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let latch = Arc::new(JoinLatch::default());

        for i in 0..workers {
            let rx = Arc::clone(&rx);
            let latch = Arc::clone(&latch);
            let spawned = thread::Builder::new()
                .name(format!("runbook-pool-{i}"))
                .spawn(move || Self::worker_loop(&rx, &latch));
            if let Err(e) = spawned {
                warn!("Could not spawn pool worker {i}: {e}");
            }
        }

        debug!("Worker pool started with {workers} workers.");
        Self { latch, queue: tx }
    }

    fn worker_loop(rx: &Mutex<Receiver<Job>>, latch: &JoinLatch) {
        loop {
            // Hold the queue lock only while receiving, never while running.
            let job = match rx.lock().unwrap().recv() {
                Ok(job) => job,
                Err(_) => return, // Pool dropped; queue is closed.
            };
            defer! { latch.complete(); }
            run_swallowing("pooled", job);
        }
    }

    /// Queues `f` for execution on one of the pool's workers. Same
    /// fire-and-forget error policy as `Orchestrator::start`.
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.latch.add();
        if self.queue.send(Box::new(f)).is_err() {
            // Workers are gone; nothing will ever pick the job up.
            error!("Worker pool queue is closed; dropping task.");
            self.latch.complete();
        }
    }

    /// Blocks until every task queued on this pool has completed.
    pub fn wait(&self) {
        self.latch.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn start_and_wait_joins_all_tasks() {
        let orchestrator = Orchestrator::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            orchestrator.start(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        orchestrator.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 8);

        // Idempotent: no pending tasks, returns immediately.
        orchestrator.wait();
    }

    #[test]
    fn task_errors_are_swallowed() {
        let orchestrator = Orchestrator::new();
        let after = Arc::new(AtomicUsize::new(0));

        orchestrator.start(|| Err(anyhow::anyhow!("expected failure")));
        let after_clone = Arc::clone(&after);
        orchestrator.start(move || {
            after_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        orchestrator.wait();
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_markers_are_all_observable_after_wait() {
        let orchestrator = Orchestrator::new();
        let pool = orchestrator.pool_with_workers(3);
        let markers = Arc::new(Mutex::new(HashSet::new()));

        for i in 0..20 {
            let markers = Arc::clone(&markers);
            pool.run(move || {
                markers.lock().unwrap().insert(i);
                Ok(())
            });
        }
        pool.wait();

        let markers = markers.lock().unwrap();
        assert_eq!(markers.len(), 20);
    }

    #[test]
    fn independent_pools_do_not_block_each_other() {
        let orchestrator = Orchestrator::new();
        let fast = orchestrator.pool_with_workers(1);
        let slow = orchestrator.pool_with_workers(1);
        let fast_done = Arc::new(AtomicUsize::new(0));

        slow.run(|| {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        let fast_done_clone = Arc::clone(&fast_done);
        fast.run(move || {
            fast_done_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // Waiting on the fast pool must not wait for the slow pool's task.
        fast.wait();
        assert_eq!(fast_done.load(Ordering::SeqCst), 1);
        slow.wait();
    }
}
