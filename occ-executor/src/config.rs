//! Executor configuration.

use std::num::NonZeroUsize;

/// Size of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCount {
    /// At most this many workers. Zero is treated as one.
    Fixed(usize),
    /// One worker per transaction in the block.
    Unlimited,
}

impl WorkerCount {
    /// Maps the CLI convention (`0` means unlimited) onto a worker count.
    pub fn from_threads(threads: usize) -> Self {
        if threads == 0 {
            WorkerCount::Unlimited
        } else {
            WorkerCount::Fixed(threads)
        }
    }

    /// Number of workers to spawn for a block of `num_txns` transactions.
    pub fn resolve(self, num_txns: usize) -> usize {
        let wanted = match self {
            WorkerCount::Fixed(n) => n.max(1),
            WorkerCount::Unlimited => num_txns,
        };
        wanted.min(num_txns).max(1)
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        WorkerCount::Fixed(
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        )
    }
}

/// Configuration for parallel execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Worker pool size.
    pub workers: WorkerCount,
    /// Maximum number of validation invalidations a single transaction may
    /// suffer before the block is declared unschedulable.
    ///
    /// `None` derives the budget from the block length (see
    /// [`ExecutorConfig::retry_budget`]).
    pub max_retries: Option<usize>,
}

impl ExecutorConfig {
    pub fn new(workers: WorkerCount) -> Self {
        Self {
            workers,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Effective retry budget for a block of `num_txns` transactions.
    ///
    /// Validation runs in index order and every round finalizes at least the
    /// lowest invalid transaction, so a transaction can be invalidated at most
    /// once per lower index. The automatic budget is therefore `num_txns + 1`;
    /// hitting it means the forward-progress assumption was broken.
    pub fn retry_budget(&self, num_txns: usize) -> usize {
        self.max_retries.unwrap_or(num_txns + 1)
    }
}
