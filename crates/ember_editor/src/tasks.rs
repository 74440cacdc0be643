// tasks.rs - Background task runner for component builds

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use tracing::debug;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks off the main thread, each exactly once.
pub struct TaskRunner {
    pool: ThreadPool,
}

impl TaskRunner {
    /// `threads == 0` uses rayon's default thread count.
    pub fn new(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ember-build-{i}"))
            .build()?;
        debug!(threads = pool.current_num_threads(), "task runner started");
        Ok(Self { pool })
    }

    pub fn spawn(&self, task: Task) {
        self.pool.spawn(task);
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("threads", &self.thread_count())
            .finish()
    }
}
