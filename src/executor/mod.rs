//! Transaction execution strategies.
//!
//! This module provides the [`Executor`] trait and implementations for
//! different transaction execution strategies.

mod occ;
mod sequential;

#[cfg(test)]
mod equivalence;

pub use occ::OccExecutor;
pub use sequential::SequentialExecutor;

use crate::bank::BankError;
use crate::Workload;
use occ_executor::{ExecutionStats, MemoryStore, SchedulerError};

/// Result of executing a workload.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Number of successfully executed transactions.
    pub successful: usize,
    /// Number of failed transactions (bad signature, nonce or funds).
    pub failed: usize,
    /// Per-transaction outcome in block order.
    pub outcomes: Vec<Result<(), BankError>>,
    /// Engine statistics, for executors that have them.
    pub stats: Option<ExecutionStats>,
}

impl ExecutionResult {
    /// Creates a new execution result.
    pub fn new(outcomes: Vec<Result<(), BankError>>, stats: Option<ExecutionStats>) -> Self {
        let successful = outcomes.iter().filter(|o| o.is_ok()).count();
        Self {
            successful,
            failed: outcomes.len() - successful,
            outcomes,
            stats,
        }
    }

    /// Total number of transactions processed.
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

/// Trait for different transaction execution strategies.
///
/// Every strategy must leave the store exactly as executing the workload one
/// transaction at a time, in order, would.
///
/// # Implementing a New Executor
///
/// ```ignore
/// use occ_bench::executor::{Executor, ExecutionResult};
/// use occ_bench::Workload;
/// use occ_executor::{MemoryStore, SchedulerError};
///
/// pub struct MyExecutor;
///
/// impl Executor for MyExecutor {
///     fn execute(
///         &self,
///         store: MemoryStore,
///         workload: &Workload,
///     ) -> Result<(MemoryStore, ExecutionResult), SchedulerError> {
///         // Your implementation here
///         todo!()
///     }
/// }
/// ```
pub trait Executor {
    /// Executes the workload against the given store.
    ///
    /// # Returns
    /// The final store and the per-transaction results, or the error that
    /// failed the whole block. On error nothing has been committed.
    fn execute(
        &self,
        store: MemoryStore,
        workload: &Workload,
    ) -> Result<(MemoryStore, ExecutionResult), SchedulerError>;

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}
