use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;

/// A unit of work scheduled by [`CacheFileRegion`](crate::CacheFileRegion)
/// population. Never runs under the service lock.
pub type Task = Box<dyn FnOnce() + Send>;

/// A substitutable place to run population/read tasks.
///
/// The source system names two pools by role, "bulk" (prefetch,
/// `maybeFetchFullEntry`) and "generic" (everything else); callers pick
/// which their `Executors` handle routes to by calling [`Executors::bulk`]
/// or [`Executors::generic`].
pub trait Executor: Send + Sync + fmt::Debug {
    fn spawn(&self, task: Task);
}

/// The pair of executors a [`SharedBlobCacheService`](crate::SharedBlobCacheService)
/// is configured with.
#[derive(Clone)]
pub struct Executors {
    pub bulk: Arc<dyn Executor>,
    pub generic: Arc<dyn Executor>,
}

impl fmt::Debug for Executors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executors")
            .field("bulk", &self.bulk)
            .field("generic", &self.generic)
            .finish()
    }
}

impl Executors {
    /// Both roles backed by the same `rayon` global thread pool.
    pub fn rayon_shared() -> Self {
        let executor: Arc<dyn Executor> = Arc::new(RayonExecutor);
        Self {
            bulk: executor.clone(),
            generic: executor,
        }
    }

    /// Both roles backed by one [`ManualExecutor`], for deterministic tests.
    pub fn manual_shared() -> (Self, Arc<ManualExecutor>) {
        let executor = Arc::new(ManualExecutor::default());
        (
            Self {
                bulk: executor.clone(),
                generic: executor.clone(),
            },
            executor,
        )
    }
}

/// Runs tasks on `rayon`'s global thread pool.
#[derive(Debug, Default)]
pub struct RayonExecutor;

impl Executor for RayonExecutor {
    fn spawn(&self, task: Task) {
        rayon::spawn(task);
    }
}

/// Runs a task synchronously on the calling thread. Useful for callers who
/// want population to block, or as a sub-pool with a single worker.
#[derive(Debug, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn spawn(&self, task: Task) {
        task();
    }
}

/// Queues tasks instead of running them; a test drives execution explicitly
/// via [`ManualExecutor::run_all`] / [`ManualExecutor::run_one`].
///
/// This is the "fake executor that runs tasks synchronously on demand"
/// called for in the source system's design notes.
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Task>>,
}

impl fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("pending", &self.pending())
            .finish()
    }
}

impl ManualExecutor {
    /// Number of tasks queued but not yet run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs the oldest queued task, if any. Returns whether one ran.
    pub fn run_one(&self) -> bool {
        let task = self.queue.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs all currently-queued tasks, including ones a running task
    /// itself enqueues, until the queue is empty. Returns the number run.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl Executor for ManualExecutor {
    fn spawn(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}
