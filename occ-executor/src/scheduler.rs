//! Scheduler coordinating worker threads within and across rounds.
//!
//! Work proceeds in rounds. Each round starts with a set of ready
//! transactions; workers pop the lowest ready index first, which keeps the
//! first round (where transactions block on their incoming edges) free of
//! deadlocks: every transaction a waiter depends on has a lower index and was
//! handed out earlier. A round is over once the queue is empty and no worker
//! is running an attempt.
//!
//! Between rounds the coordinating thread runs the validation pass and calls
//! [`Scheduler::invalidate`] for every transaction that has to run again.

use crate::error::SchedulerError;
use crate::types::{ExecutionStatus, Incarnation, Task, TxnIndex, Version};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

#[derive(Debug)]
struct TxnState {
    incarnation: Incarnation,
    status: ExecutionStatus,
    /// Validation invalidations so far.
    retries: usize,
    /// Transactions parked on an estimate written by this one.
    dependents: BTreeSet<TxnIndex>,
}

#[derive(Debug, Default)]
struct ReadyQueue {
    ready: BTreeSet<TxnIndex>,
    /// Attempts handed out and not yet finished.
    active: usize,
    halted: bool,
}

/// What happened to an attempt that read an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyOutcome {
    /// Parked until the writer finishes; the worker is free.
    Parked,
    /// The writer already finished; run this version right away.
    Retry(Version),
}

pub struct Scheduler {
    num_txns: usize,
    retry_budget: usize,
    txns: Vec<Mutex<TxnState>>,
    queue: Mutex<ReadyQueue>,
    queue_cv: Condvar,
    executions: AtomicUsize,
    estimate_aborts: AtomicUsize,
    invalidations: AtomicUsize,
}

impl Scheduler {
    /// Creates a scheduler with every transaction ready at incarnation 0.
    pub fn new(num_txns: usize, retry_budget: usize) -> Self {
        Self {
            num_txns,
            retry_budget,
            txns: (0..num_txns)
                .map(|_| {
                    Mutex::new(TxnState {
                        incarnation: 0,
                        status: ExecutionStatus::Queued,
                        retries: 0,
                        dependents: BTreeSet::new(),
                    })
                })
                .collect(),
            queue: Mutex::new(ReadyQueue {
                ready: (0..num_txns).collect(),
                active: 0,
                halted: false,
            }),
            queue_cv: Condvar::new(),
            executions: AtomicUsize::new(0),
            estimate_aborts: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn num_txns(&self) -> usize {
        self.num_txns
    }

    pub fn retry_budget(&self) -> usize {
        self.retry_budget
    }

    /// Gets the next task for a worker thread, blocking while other workers
    /// may still make transactions ready.
    pub fn next_task(&self) -> Task {
        let mut queue = self.queue.lock();
        loop {
            if queue.halted {
                return Task::Done;
            }
            if let Some(txn_idx) = queue.ready.pop_first() {
                queue.active += 1;
                let mut state = self.txns[txn_idx].lock();
                state.status = ExecutionStatus::Executing;
                self.executions.fetch_add(1, Ordering::Relaxed);
                return Task::Execute(Version::new(txn_idx, state.incarnation));
            }
            if queue.active == 0 {
                self.queue_cv.notify_all();
                return Task::Done;
            }
            self.queue_cv.wait(&mut queue);
        }
    }

    /// Marks an attempt finished after its writeset was published and wakes
    /// every transaction parked on it.
    pub fn finish_execution(&self, version: Version) {
        let dependents = {
            let mut state = self.txns[version.txn_idx].lock();
            if state.incarnation == version.incarnation {
                state.status = ExecutionStatus::Executed;
            }
            std::mem::take(&mut state.dependents)
        };

        let mut queue = self.queue.lock();
        for dep in &dependents {
            let mut state = self.txns[*dep].lock();
            if state.status == ExecutionStatus::Aborted {
                state.status = ExecutionStatus::Queued;
                queue.ready.insert(*dep);
            }
        }
        queue.active -= 1;
        drop(queue);

        if !dependents.is_empty() {
            trace!(%version, resumed = dependents.len(), "resumed dependents");
        }
        self.queue_cv.notify_all();
    }

    /// Handles an attempt of `version.txn_idx` that read an estimate left by
    /// `blocking_txn`.
    ///
    /// The attempt's incarnation is bumped either way. Parking does not count
    /// against the retry budget: the writer has a lower index and always
    /// finishes within the round.
    pub fn add_dependency(&self, version: Version, blocking_txn: TxnIndex) -> DependencyOutcome {
        debug_assert!(blocking_txn < version.txn_idx);
        self.estimate_aborts.fetch_add(1, Ordering::Relaxed);

        let parked = {
            let mut writer = self.txns[blocking_txn].lock();
            let mut reader = self.txns[version.txn_idx].lock();
            reader.incarnation += 1;
            let writer_done = matches!(
                writer.status,
                ExecutionStatus::Executed | ExecutionStatus::Validated
            );
            if writer_done {
                reader.status = ExecutionStatus::Executing;
                None
            } else {
                reader.status = ExecutionStatus::Aborted;
                writer.dependents.insert(version.txn_idx);
                Some(reader.incarnation)
            }
        };

        match parked {
            Some(incarnation) => {
                trace!(%version, blocking_txn, incarnation, "parked on estimate");
                let mut queue = self.queue.lock();
                queue.active -= 1;
                drop(queue);
                self.queue_cv.notify_all();
                DependencyOutcome::Parked
            }
            None => {
                self.executions.fetch_add(1, Ordering::Relaxed);
                let state = self.txns[version.txn_idx].lock();
                DependencyOutcome::Retry(Version::new(version.txn_idx, state.incarnation))
            }
        }
    }

    /// Schedules `txn_idx` for another incarnation in the next round.
    ///
    /// Must only be called between rounds. Fails once the transaction has been
    /// invalidated more often than the retry budget allows.
    pub fn invalidate(&self, txn_idx: TxnIndex) -> Result<Incarnation, SchedulerError> {
        let mut state = self.txns[txn_idx].lock();
        state.retries += 1;
        if state.retries > self.retry_budget {
            return Err(SchedulerError::RetryBudgetExhausted {
                txn_idx,
                budget: self.retry_budget,
            });
        }
        state.incarnation += 1;
        state.status = ExecutionStatus::Queued;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        Ok(state.incarnation)
    }

    /// Starts a new round with `txns` ready.
    pub fn begin_round(&self, txns: &BTreeSet<TxnIndex>) {
        let mut queue = self.queue.lock();
        debug_assert_eq!(queue.active, 0);
        queue.ready.extend(txns.iter().copied());
        queue.halted = false;
        debug!(ready = queue.ready.len(), "starting round");
    }

    /// Transactions waiting for a worker.
    pub fn num_ready(&self) -> usize {
        self.queue.lock().ready.len()
    }

    /// Stops handing out work; every worker returns [`Task::Done`].
    pub fn halt(&self) {
        self.queue.lock().halted = true;
        self.queue_cv.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.queue.lock().halted
    }

    pub fn mark_validated(&self, txn_idx: TxnIndex) {
        let mut state = self.txns[txn_idx].lock();
        if state.status == ExecutionStatus::Executed {
            state.status = ExecutionStatus::Validated;
        }
    }

    pub fn status(&self, txn_idx: TxnIndex) -> ExecutionStatus {
        self.txns[txn_idx].lock().status
    }

    pub fn incarnation(&self, txn_idx: TxnIndex) -> Incarnation {
        self.txns[txn_idx].lock().incarnation
    }

    pub fn retries(&self, txn_idx: TxnIndex) -> usize {
        self.txns[txn_idx].lock().retries
    }

    /// Gets statistics about execution progress.
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            executions: self.executions.load(Ordering::Relaxed),
            estimate_aborts: self.estimate_aborts.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            ..SchedulerStats::default()
        };
        for state in &self.txns {
            let state = state.lock();
            stats.max_incarnation = stats.max_incarnation.max(state.incarnation);
            match state.status {
                ExecutionStatus::Queued => stats.queued += 1,
                ExecutionStatus::Executing => stats.executing += 1,
                ExecutionStatus::Aborted => stats.aborted += 1,
                ExecutionStatus::Executed => stats.executed += 1,
                ExecutionStatus::Validated => stats.validated += 1,
            }
        }
        stats
    }
}

/// Statistics about scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub executing: usize,
    pub aborted: usize,
    pub executed: usize,
    pub validated: usize,
    /// Attempts handed to workers, including retries.
    pub executions: usize,
    pub estimate_aborts: usize,
    pub invalidations: usize,
    pub max_incarnation: Incarnation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn expect_execute(task: Task) -> Version {
        match task {
            Task::Execute(version) => version,
            other => panic!("Expected Execute task, got {:?}", other),
        }
    }

    #[test]
    fn test_scheduler_basic() {
        let scheduler = Scheduler::new(3, 4);

        assert_eq!(expect_execute(scheduler.next_task()), Version::new(0, 0));
        assert_eq!(expect_execute(scheduler.next_task()), Version::new(1, 0));
        assert_eq!(scheduler.status(1), ExecutionStatus::Executing);
    }

    #[test]
    fn test_round_drains() {
        let scheduler = Scheduler::new(2, 4);
        let a = expect_execute(scheduler.next_task());
        let b = expect_execute(scheduler.next_task());
        scheduler.finish_execution(a);
        scheduler.finish_execution(b);
        assert_eq!(scheduler.next_task(), Task::Done);
        assert_eq!(scheduler.stats().executed, 2);
    }

    #[test]
    fn test_lowest_index_first() {
        let scheduler = Scheduler::new(4, 4);
        for _ in 0..4 {
            let v = expect_execute(scheduler.next_task());
            scheduler.finish_execution(v);
        }
        assert_eq!(scheduler.next_task(), Task::Done);

        scheduler.invalidate(3).unwrap();
        scheduler.invalidate(1).unwrap();
        scheduler.begin_round(&BTreeSet::from([3, 1]));
        assert_eq!(scheduler.num_ready(), 2);
        assert_eq!(expect_execute(scheduler.next_task()), Version::new(1, 1));
        assert_eq!(expect_execute(scheduler.next_task()), Version::new(3, 1));
    }

    #[test]
    fn test_park_and_resume() {
        let scheduler = Scheduler::new(2, 4);
        let v0 = expect_execute(scheduler.next_task());
        let v1 = expect_execute(scheduler.next_task());

        // Tx 1 reads an estimate of tx 0, which is still running.
        assert_eq!(scheduler.add_dependency(v1, 0), DependencyOutcome::Parked);
        assert_eq!(scheduler.status(1), ExecutionStatus::Aborted);

        scheduler.finish_execution(v0);
        assert_eq!(expect_execute(scheduler.next_task()), Version::new(1, 1));
        assert_eq!(scheduler.retries(1), 0);
        assert_eq!(scheduler.stats().estimate_aborts, 1);
    }

    #[test]
    fn test_dependency_on_finished_writer_retries() {
        let scheduler = Scheduler::new(2, 4);
        let v0 = expect_execute(scheduler.next_task());
        let v1 = expect_execute(scheduler.next_task());
        scheduler.finish_execution(v0);

        assert_eq!(
            scheduler.add_dependency(v1, 0),
            DependencyOutcome::Retry(Version::new(1, 1))
        );
        scheduler.finish_execution(Version::new(1, 1));
        assert_eq!(scheduler.next_task(), Task::Done);
    }

    #[test]
    fn test_retry_budget() {
        let scheduler = Scheduler::new(1, 2);
        assert_eq!(scheduler.invalidate(0), Ok(1));
        assert_eq!(scheduler.invalidate(0), Ok(2));
        assert_eq!(
            scheduler.invalidate(0),
            Err(SchedulerError::RetryBudgetExhausted { txn_idx: 0, budget: 2 })
        );
    }

    #[test]
    fn test_halt_releases_waiters() {
        let scheduler = Arc::new(Scheduler::new(2, 4));
        let _running = expect_execute(scheduler.next_task());
        let _other = expect_execute(scheduler.next_task());

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.next_task())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        scheduler.halt();
        assert_eq!(waiter.join().unwrap(), Task::Done);
    }

    #[test]
    fn test_workers_drain_round_concurrently() {
        let num_txns = 200;
        let scheduler = Arc::new(Scheduler::new(num_txns, 4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || {
                    let mut ran = 0;
                    while let Task::Execute(version) = scheduler.next_task() {
                        scheduler.finish_execution(version);
                        ran += 1;
                    }
                    ran
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, num_txns);
        assert_eq!(scheduler.stats().executed, num_txns);
    }
}
