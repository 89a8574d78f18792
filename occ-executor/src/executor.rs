//! Parallel block executor.
//!
//! A block runs in rounds:
//!
//! 1. Round 0 executes every transaction once. Before its first attempt a
//!    transaction waits for every incoming dependency edge; the attempt's
//!    outgoing edges fire when it ends, however it ends.
//! 2. The validation pass replays every captured read set in index order.
//!    An invalid transaction, and everything ordered after it in the
//!    dependency graph, has its writes turned into estimates on the spot, so
//!    higher readers of those writes fail in the same pass. All of them are
//!    scheduled for a new incarnation.
//! 3. Later rounds run only those transactions, on no more workers than
//!    there are transactions to run. Nothing waits on edges any more; a read
//!    that hits an estimate parks the reader until the writer finishes.
//! 4. Once a pass finds nothing invalid, writesets are flushed to the commit
//!    sink in index order.

use crate::access::TxnAccessOps;
use crate::config::ExecutorConfig;
use crate::dag::DependencyGraph;
use crate::error::{SchedulerError, TxnError};
use crate::mvhashmap::{MVHashMap, PublishOutcome};
use crate::scheduler::{DependencyOutcome, Scheduler};
use crate::signal::SignalPlan;
use crate::store::{CommitSink, ParentStore};
use crate::types::{CapturedAccess, Incarnation, Task, TxnIndex, Version, WriteSet};
use crate::validation::{validate_txn, ValidationOutcome};
use crate::view::TxnView;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Business logic run for each transaction.
///
/// Implementations must be deterministic functions of the transaction and of
/// what they read through the view. Read errors should be propagated with
/// `?`; the view also remembers them, so a swallowed error still aborts the
/// attempt.
pub trait TxnExecutor<T>: Sync {
    type Output: Send;
    type Error: Send;

    fn execute<S: ParentStore>(
        &self,
        txn: &T,
        view: &mut TxnView<'_, S>,
    ) -> Result<Self::Output, TxnError<Self::Error>>;
}

#[derive(Debug)]
enum AttemptOutcome<O, E> {
    Success(O),
    Failed(E),
    Panicked(String),
}

#[derive(Debug)]
struct AttemptRecord<O, E> {
    version: Version,
    outcome: AttemptOutcome<O, E>,
    writeset: WriteSet,
    captured: CapturedAccess,
}

type RecordSlot<O, E> = Mutex<Option<AttemptRecord<O, E>>>;

/// Counters collected while executing one block.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    /// Execution rounds, the first one included.
    pub rounds: usize,
    /// Attempts run, including re-executions.
    pub total_executions: usize,
    /// Attempts stopped by a read of an estimate.
    pub estimate_aborts: usize,
    /// Transactions rescheduled by the validation pass, summed over rounds.
    pub invalidations: usize,
    /// Final incarnation of every transaction.
    pub incarnations: Vec<Incarnation>,
    /// Worker threads spawned for each round.
    pub workers_per_round: Vec<usize>,
    pub num_edges: usize,
    /// Times each dependency edge was signaled, by edge id.
    pub signal_counts: Vec<usize>,
    pub duration: Duration,
}

/// Result of parallel block execution.
#[derive(Debug)]
pub struct BlockExecutionResult<O, E> {
    /// Per-transaction outcome, in block order.
    pub results: Vec<Result<O, E>>,
    pub stats: ExecutionStats,
}

impl<O, E> BlockExecutionResult<O, E> {
    /// Number of successful transactions.
    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    /// Number of failed transactions.
    pub fn failed(&self) -> usize {
        self.results.len() - self.successful()
    }
}

/// Parallel OCC executor.
pub struct ParallelExecutor<X> {
    config: ExecutorConfig,
    logic: X,
}

impl<X> ParallelExecutor<X> {
    /// Creates a new parallel executor.
    pub fn new(config: ExecutorConfig, logic: X) -> Self {
        Self { config, logic }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn logic(&self) -> &X {
        &self.logic
    }

    /// Executes a block of transactions in parallel and commits the result
    /// into `store`.
    ///
    /// `decls` holds one declaration per transaction. On error nothing has
    /// been flushed, except when the sink itself fails part way through.
    pub fn execute_block<T, S>(
        &self,
        txns: &[T],
        decls: &[TxnAccessOps],
        store: &mut S,
    ) -> Result<BlockExecutionResult<X::Output, X::Error>, SchedulerError>
    where
        T: Sync,
        S: ParentStore + CommitSink,
        X: TxnExecutor<T>,
    {
        let start = Instant::now();
        let num_txns = txns.len();
        let graph = DependencyGraph::build(num_txns, decls)?;
        if num_txns == 0 {
            return Ok(BlockExecutionResult {
                results: Vec::new(),
                stats: ExecutionStats::default(),
            });
        }

        let signals = graph.signal_plan();
        let mv = MVHashMap::new(num_txns);
        let scheduler = Scheduler::new(num_txns, self.config.retry_budget(num_txns));
        let records: Vec<RecordSlot<X::Output, X::Error>> =
            (0..num_txns).map(|_| Mutex::new(None)).collect();
        let num_workers = self.config.workers.resolve(num_txns);

        let ctx = BlockContext {
            logic: &self.logic,
            txns,
            parent: &*store,
            mv: &mv,
            scheduler: &scheduler,
            signals: &signals,
            records: &records,
            fatal: Mutex::new(None),
        };

        debug!(
            txns = num_txns,
            workers = num_workers,
            edges = graph.num_edges(),
            budget = scheduler.retry_budget(),
            "executing block"
        );

        let mut rounds = 0;
        let mut workers_per_round = Vec::new();
        loop {
            rounds += 1;
            let round_workers = num_workers.min(scheduler.num_ready()).max(1);
            workers_per_round.push(round_workers);
            ctx.run_round(round_workers)?;
            if rounds == 1 {
                signals.ledger().verify()?;
            }

            let invalid = ctx.validation_pass(&graph);
            if invalid.is_empty() {
                break;
            }
            debug!(round = rounds, invalid = invalid.len(), "validation pass rescheduled");
            for &txn_idx in &invalid {
                if let Err(err) = scheduler.invalidate(txn_idx) {
                    warn!(%err, round = rounds, "block is unschedulable");
                    return Err(err);
                }
            }
            scheduler.begin_round(&invalid);
        }

        let sched_stats = scheduler.stats();
        let incarnations = (0..num_txns).map(|idx| scheduler.incarnation(idx)).collect();
        drop(ctx);

        // A validated panic fails the block before anything is flushed.
        let mut finals = Vec::with_capacity(num_txns);
        for (txn_idx, slot) in records.into_iter().enumerate() {
            let record = slot.into_inner().ok_or(SchedulerError::WorkerPanicked)?;
            let result = match record.outcome {
                AttemptOutcome::Success(output) => Ok(output),
                AttemptOutcome::Failed(err) => Err(err),
                AttemptOutcome::Panicked(message) => {
                    return Err(SchedulerError::TransactionPanicked { txn_idx, message });
                }
            };
            finals.push((record.writeset, result));
        }

        let mut results = Vec::with_capacity(num_txns);
        for (txn_idx, (writeset, result)) in finals.into_iter().enumerate() {
            store.flush(txn_idx, &writeset)?;
            results.push(result);
        }

        let stats = ExecutionStats {
            rounds,
            total_executions: sched_stats.executions,
            estimate_aborts: sched_stats.estimate_aborts,
            invalidations: sched_stats.invalidations,
            incarnations,
            workers_per_round,
            num_edges: graph.num_edges(),
            signal_counts: signals.ledger().counts(),
            duration: start.elapsed(),
        };
        info!(
            txns = num_txns,
            rounds = stats.rounds,
            executions = stats.total_executions,
            estimate_aborts = stats.estimate_aborts,
            invalidations = stats.invalidations,
            elapsed = ?stats.duration,
            "block committed"
        );

        Ok(BlockExecutionResult { results, stats })
    }
}

/// Shared state of one block, borrowed by every worker.
struct BlockContext<'a, T, S, X: TxnExecutor<T>> {
    logic: &'a X,
    txns: &'a [T],
    parent: &'a S,
    mv: &'a MVHashMap,
    scheduler: &'a Scheduler,
    signals: &'a SignalPlan,
    records: &'a [RecordSlot<X::Output, X::Error>],
    fatal: Mutex<Option<SchedulerError>>,
}

/// Stops the block if a worker unwinds outside of business logic.
struct HaltOnUnwind<'a> {
    scheduler: &'a Scheduler,
    signals: &'a SignalPlan,
}

impl Drop for HaltOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.scheduler.halt();
            self.signals.release_all();
        }
    }
}

impl<'a, T, S, X> BlockContext<'a, T, S, X>
where
    T: Sync,
    S: ParentStore,
    X: TxnExecutor<T>,
{
    fn run_round(&self, num_workers: usize) -> Result<(), SchedulerError> {
        let worker_panicked = thread::scope(|s| {
            let mut handles = Vec::with_capacity(num_workers);
            for worker_id in 0..num_workers {
                let spawned = thread::Builder::new()
                    .name(format!("occ-worker-{worker_id}"))
                    .spawn_scoped(s, move || self.worker_loop(worker_id));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        // Workers already running see the halt and return.
                        self.fail(SchedulerError::WorkerSpawn(err.to_string()));
                        break;
                    }
                }
            }
            handles
                .into_iter()
                .fold(false, |panicked, handle| handle.join().is_err() || panicked)
        });

        if let Some(err) = self.fatal.lock().take() {
            return Err(err);
        }
        if worker_panicked {
            return Err(SchedulerError::WorkerPanicked);
        }
        Ok(())
    }

    fn fail(&self, err: SchedulerError) {
        warn!(%err, "aborting block");
        self.fatal.lock().get_or_insert(err);
        self.scheduler.halt();
        self.signals.release_all();
    }

    /// Worker thread main loop.
    fn worker_loop(&self, worker_id: usize) {
        let _halt = HaltOnUnwind {
            scheduler: self.scheduler,
            signals: self.signals,
        };
        let mut local_executions = 0;

        while let Task::Execute(version) = self.scheduler.next_task() {
            let mut next = Some(version);
            while let Some(version) = next {
                local_executions += 1;
                next = self.run_attempt(version);
            }
        }

        trace!(worker_id, local_executions, "worker done");
    }

    /// Runs one attempt. Returns the version to run next on this worker when
    /// the attempt has to be repeated right away.
    fn run_attempt(&self, version: Version) -> Option<Version> {
        let txn_idx = version.txn_idx;

        // Present on the first attempt only.
        let guard = self.signals.take_guard(txn_idx);
        if let Some(receivers) = self.signals.take_receivers(txn_idx) {
            for rx in receivers {
                if let Err(err) = rx.wait() {
                    self.fail(err);
                    return None;
                }
            }
        }
        if self.scheduler.is_halted() {
            return None;
        }

        let mut view = TxnView::new(txn_idx, self.mv, self.parent);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.logic.execute(&self.txns[txn_idx], &mut view)
        }));
        let blocked_on = view.blocked_on();
        let (writeset, captured) = view.into_parts();

        if let Some(writer) = blocked_on {
            drop(guard);
            trace!(%version, writer, "attempt hit estimate");
            return match self.scheduler.add_dependency(version, writer) {
                DependencyOutcome::Parked => None,
                DependencyOutcome::Retry(next) => Some(next),
            };
        }

        let outcome = match result {
            Ok(Ok(output)) => AttemptOutcome::Success(output),
            Ok(Err(TxnError::Failed(err))) => AttemptOutcome::Failed(err),
            Ok(Err(TxnError::Dependency { writer })) => AttemptOutcome::Panicked(format!(
                "reported a dependency on transaction {writer} without reading its estimate"
            )),
            Err(payload) => AttemptOutcome::Panicked(panic_message(payload.as_ref())),
        };

        // Failed and panicked attempts leave no writes behind.
        let writeset = match outcome {
            AttemptOutcome::Success(_) => writeset,
            AttemptOutcome::Failed(_) | AttemptOutcome::Panicked(_) => WriteSet::new(),
        };
        if let AttemptOutcome::Panicked(message) = &outcome {
            warn!(%version, message = %message, "caught panic in transaction");
        }

        match self.mv.publish(version, &writeset) {
            PublishOutcome::Stale { latest } => {
                trace!(%version, latest, "dropped stale attempt");
            }
            PublishOutcome::Published { .. } => {
                *self.records[txn_idx].lock() = Some(AttemptRecord {
                    version,
                    outcome,
                    writeset,
                    captured,
                });
            }
        }
        self.scheduler.finish_execution(version);
        drop(guard);
        None
    }

    /// Validates every transaction in index order. Returns the set to run
    /// again: each invalid transaction plus everything the dependency graph
    /// orders after it.
    ///
    /// An invalid transaction's writes become estimates before the next index
    /// is checked, so a chain of readers is rescheduled in a single pass.
    fn validation_pass(&self, graph: &DependencyGraph) -> BTreeSet<TxnIndex> {
        let mut invalid = BTreeSet::new();
        for txn_idx in 0..self.records.len() {
            if self.is_valid(txn_idx, graph, &invalid) {
                self.scheduler.mark_validated(txn_idx);
            } else {
                self.mv.convert_writes_to_estimates(txn_idx);
                invalid.insert(txn_idx);
            }
        }
        invalid
    }

    fn is_valid(
        &self,
        txn_idx: TxnIndex,
        graph: &DependencyGraph,
        invalid: &BTreeSet<TxnIndex>,
    ) -> bool {
        if graph.predecessors(txn_idx).any(|p| invalid.contains(&p)) {
            return false;
        }
        let record = self.records[txn_idx].lock();
        let Some(record) = record.as_ref() else {
            return false;
        };
        match validate_txn(txn_idx, &record.captured, self.mv, self.parent) {
            ValidationOutcome::Valid => true,
            ValidationOutcome::Invalid(reason) => {
                debug!(txn_idx, version = %record.version, ?reason, "validation failed");
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
