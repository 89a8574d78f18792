//! OCC parallel executor wrapper.
//!
//! This module provides a wrapper around the occ-executor crate,
//! implementing the Executor trait for use in benchmarks.

use super::{ExecutionResult, Executor};
use crate::bank::{BankLogic, DeclarationMode};
use crate::Workload;
use occ_executor::{ExecutorConfig, MemoryStore, ParallelExecutor, SchedulerError, WorkerCount};
use tracing::info;

/// OCC parallel executor.
///
/// Declared accesses order the first attempt of conflicting transactions;
/// the validation pass re-executes whatever the declarations missed. The
/// committed state always matches sequential execution.
#[derive(Debug)]
pub struct OccExecutor {
    pub config: ExecutorConfig,
    pub verify_signatures: bool,
    pub declarations: DeclarationMode,
}

impl OccExecutor {
    /// Creates an OCC executor with the specified number of threads
    /// (`0` spawns one worker per transaction).
    pub fn new(num_threads: usize, verify_signatures: bool) -> Self {
        Self {
            config: ExecutorConfig::new(WorkerCount::from_threads(num_threads)),
            verify_signatures,
            declarations: DeclarationMode::default(),
        }
    }

    pub fn with_declarations(mut self, mode: DeclarationMode) -> Self {
        self.declarations = mode;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.config = self.config.with_max_retries(max_retries);
        self
    }
}

impl Executor for OccExecutor {
    fn execute(
        &self,
        mut store: MemoryStore,
        workload: &Workload,
    ) -> Result<(MemoryStore, ExecutionResult), SchedulerError> {
        let decls = workload.declarations(self.declarations);
        let logic = BankLogic::new(self.verify_signatures);
        let executor = ParallelExecutor::new(self.config.clone(), logic);

        store.begin_block();
        let result = executor.execute_block(&workload.transactions, &decls, &mut store)?;
        info!(
            executor = self.name(),
            successful = result.successful(),
            failed = result.failed(),
            rounds = result.stats.rounds,
            "workload executed"
        );

        Ok((store, ExecutionResult::new(result.results, Some(result.stats))))
    }

    fn name(&self) -> &'static str {
        "occ_parallel"
    }
}
