//! Sequential transaction executor.
//!
//! This module provides a baseline sequential executor that processes
//! transactions one at a time. It is the reference every parallel strategy
//! is checked against.

use super::{ExecutionResult, Executor};
use crate::bank::BankLogic;
use crate::Workload;
use occ_executor::mvhashmap::MVHashMap;
use occ_executor::{
    CommitSink, MemoryStore, SchedulerError, TxnError, TxnExecutor, TxnIndex, TxnView, WriteSet,
};
use tracing::debug;

/// Sequential executor that processes transactions one at a time.
///
/// Each transaction runs through the same view type as the parallel engine,
/// with an empty version map, and its writes are flushed before the next
/// transaction starts.
///
/// # Example
///
/// ```
/// use occ_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
///
/// let config = WorkloadConfig::default();
/// let workload = Workload::generate(config).unwrap();
/// let store = workload.create_store();
///
/// let executor = SequentialExecutor::new(true); // with signature verification
/// let (final_store, result) = executor.execute(store, &workload).unwrap();
///
/// println!("Successful: {}, Failed: {}", result.successful, result.failed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor {
    /// Whether to verify signatures during execution.
    pub verify_signatures: bool,
}

impl SequentialExecutor {
    /// Creates a new sequential executor.
    ///
    /// # Arguments
    /// * `verify_signatures` - If true, recovers and verifies the signer address
    ///   from each transaction's signature before execution.
    pub fn new(verify_signatures: bool) -> Self {
        Self { verify_signatures }
    }
}

impl Executor for SequentialExecutor {
    fn execute(
        &self,
        mut store: MemoryStore,
        workload: &Workload,
    ) -> Result<(MemoryStore, ExecutionResult), SchedulerError> {
        let logic = BankLogic::new(self.verify_signatures);
        // Every earlier write is already in the store, so no versions are
        // ever needed.
        let mv = MVHashMap::new(0);
        let mut outcomes = Vec::with_capacity(workload.transactions.len());

        store.begin_block();
        for (idx, tx) in workload.transactions.iter().enumerate() {
            let mut view = TxnView::new(idx, &mv, &store);
            let outcome = logic.execute(tx, &mut view);
            let (writes, _) = view.into_parts();

            outcomes.push(commit_outcome(idx, outcome, &writes, &mut store)?);
        }

        Ok((store, ExecutionResult::new(outcomes, None)))
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

/// Flushes the writes of a successful transaction, or an empty writeset for
/// a failed one, and returns its outcome.
fn commit_outcome<E: std::fmt::Display>(
    idx: TxnIndex,
    outcome: Result<(), TxnError<E>>,
    writes: &WriteSet,
    store: &mut MemoryStore,
) -> Result<Result<(), E>, SchedulerError> {
    match outcome {
        Ok(()) => {
            store.flush(idx, writes)?;
            Ok(Ok(()))
        }
        Err(TxnError::Failed(err)) => {
            debug!(txn_idx = idx, %err, "transaction failed");
            store.flush(idx, &WriteSet::new())?;
            Ok(Err(err))
        }
        // The version map is empty, so no read can have hit an estimate.
        Err(TxnError::Dependency { writer }) => Err(SchedulerError::TransactionPanicked {
            txn_idx: idx,
            message: format!("reported a dependency on transaction {writer}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::{balance_key, encode_u256, BankError};
    use crate::{initial_balance, transfer_amount, SignedTransaction, WorkloadConfig};
    use alloy_primitives::U256;

    #[test]
    fn test_sequential_executor() {
        let config = WorkloadConfig {
            num_accounts: 10,
            num_transactions: 20,
            ..WorkloadConfig::default()
        };
        let workload = Workload::generate(config).unwrap();
        let store = workload.create_store();

        let (store, result) = SequentialExecutor::new(true).execute(store, &workload).unwrap();
        assert_eq!(result.successful, 20);
        assert_eq!(result.failed, 0);
        assert!(result.stats.is_none());

        // Transfers conserve the total.
        let total: U256 = workload
            .accounts
            .iter()
            .map(|a| U256::try_from_be_slice(&store.snapshot()[&balance_key(a.address)]).unwrap())
            .fold(U256::ZERO, |acc, balance| acc + balance);
        assert_eq!(total, initial_balance() * U256::from(10));
    }

    #[test]
    fn test_dependency_report_fails_the_block() {
        let mut store = MemoryStore::new();
        store.begin_block();
        let outcome: Result<(), TxnError<BankError>> = Err(TxnError::Dependency { writer: 1 });

        let err = commit_outcome(0, outcome, &WriteSet::new(), &mut store).unwrap_err();

        assert!(matches!(err, SchedulerError::TransactionPanicked { txn_idx: 0, .. }));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_replayed_nonce_fails_without_writes() {
        let config = WorkloadConfig {
            num_accounts: 2,
            num_transactions: 0,
            ..WorkloadConfig::default()
        };
        let mut workload = Workload::generate(config).unwrap();
        let (alice, bob) = (&workload.accounts[0], &workload.accounts[1]);
        let tx = SignedTransaction::transfer(alice, bob.address, transfer_amount(), 0, 1).unwrap();
        workload.transactions = vec![tx.clone(), tx];

        let store = workload.create_store();
        let (store, result) = SequentialExecutor::new(true).execute(store, &workload).unwrap();
        assert!(result.outcomes[0].is_ok());
        assert!(matches!(result.outcomes[1], Err(BankError::BadNonce { expected: 1, got: 0, .. })));
        assert_eq!(
            store.snapshot()[&balance_key(bob.address)],
            encode_u256(initial_balance() + transfer_amount())
        );
    }
}
