//! Parallel and sequential execution must commit identical state.

use super::{Executor, OccExecutor, SequentialExecutor};
use crate::bank::{self, BankError, BankLogic, BankMsg, DeclarationMode};
use crate::{transfer_amount, MessageMix, SignedTransaction, Workload, WorkloadConfig};
use alloy_primitives::U256;
use occ_executor::{
    ExecutorConfig, MemoryStore, MessageAccess, ParallelExecutor, ResourceId, TxnAccessOps,
    WorkerCount,
};

fn mixed_config(seed: u64, conflict_factor: f64) -> WorkloadConfig {
    WorkloadConfig {
        num_accounts: 12,
        num_transactions: 120,
        conflict_factor,
        seed,
        mix: MessageMix {
            mint: 0.1,
            memo: 0.2,
            sweep: 0.05,
            heartbeat: 0.15,
        },
        ..WorkloadConfig::default()
    }
}

fn sequential(workload: &Workload) -> (MemoryStore, Vec<Result<(), BankError>>) {
    let (store, result) = SequentialExecutor::new(true)
        .execute(workload.create_store(), workload)
        .unwrap();
    (store, result.outcomes)
}

#[test]
fn test_matches_sequential_across_threads_and_modes() {
    for (seed, conflict) in [(1, 0.0), (2, 0.5), (3, 0.9)] {
        let workload = Workload::generate(mixed_config(seed, conflict)).unwrap();
        let (expected_store, expected) = sequential(&workload);

        for threads in [1, 2, 4, 0] {
            for mode in [DeclarationMode::Accurate, DeclarationMode::Wildcard] {
                let executor = OccExecutor::new(threads, true).with_declarations(mode);
                let (store, result) = executor.execute(workload.create_store(), &workload).unwrap();
                assert_eq!(result.outcomes, expected, "seed {seed} threads {threads} {mode:?}");
                assert_eq!(store, expected_store, "seed {seed} threads {threads} {mode:?}");
            }
        }
    }
}

#[test]
fn test_under_declared_block_is_repaired_by_validation() {
    let workload = Workload::generate(mixed_config(9, 0.8)).unwrap();
    let (expected_store, expected) = sequential(&workload);

    // Only the nonce is declared: balances, memos, windows and sweeps are all
    // discovered by validation.
    let decls: Vec<TxnAccessOps> = workload
        .transactions
        .iter()
        .enumerate()
        .map(|(idx, tx)| {
            let nonce = ResourceId::Named(bank::nonce_key(tx.from));
            TxnAccessOps::new(vec![MessageAccess::new(idx, 0).read_write(nonce).build()])
        })
        .collect();

    let config = ExecutorConfig::new(WorkerCount::Fixed(4));
    let executor = ParallelExecutor::new(config, BankLogic::new(true));
    let mut store = workload.create_store();
    let result = executor
        .execute_block(&workload.transactions, &decls, &mut store)
        .unwrap();

    assert_eq!(result.results, expected);
    assert_eq!(store, expected_store);
    assert!(result.stats.rounds >= 1);
}

#[test]
fn test_failures_match_sequential() {
    let config = WorkloadConfig {
        num_accounts: 3,
        num_transactions: 0,
        ..WorkloadConfig::default()
    };
    let mut workload = Workload::generate(config).unwrap();
    let accounts = workload.accounts.clone();
    let (a, b, c) = (&accounts[0], &accounts[1], &accounts[2]);
    let everything = crate::initial_balance();

    workload.transactions = vec![
        // a drains itself into b.
        SignedTransaction::transfer(a, b.address, everything, 0, 1).unwrap(),
        // a is now broke.
        SignedTransaction::transfer(a, c.address, transfer_amount(), 1, 1).unwrap(),
        // Replays a's first nonce.
        SignedTransaction::transfer(a, c.address, U256::from(1), 0, 1).unwrap(),
        // b can pay c out of what it received.
        SignedTransaction::transfer(b, c.address, everything + U256::from(1), 0, 1).unwrap(),
        SignedTransaction::new(c, 0, vec![BankMsg::Sweep], 1).unwrap(),
    ];

    let (expected_store, expected) = sequential(&workload);
    assert!(matches!(expected[1], Err(BankError::InsufficientFunds { .. })));
    assert!(matches!(expected[2], Err(BankError::BadNonce { .. })));
    assert!(expected[3].is_ok());

    for threads in [1, 3, 0] {
        let (store, result) = OccExecutor::new(threads, true)
            .execute(workload.create_store(), &workload)
            .unwrap();
        assert_eq!(result.outcomes, expected);
        assert_eq!(store, expected_store);
    }
}

#[test]
fn test_hot_account_contention() {
    let config = WorkloadConfig {
        num_accounts: 2,
        num_transactions: 200,
        conflict_factor: 1.0,
        seed: 5,
        ..WorkloadConfig::default()
    };
    let workload = Workload::generate(config).unwrap();
    let (expected_store, expected) = sequential(&workload);

    let (store, result) = OccExecutor::new(8, true)
        .with_max_retries(0)
        .execute(workload.create_store(), &workload)
        .unwrap();
    assert_eq!(result.outcomes, expected);
    assert_eq!(store, expected_store);
    assert_eq!(result.stats.unwrap().invalidations, 0);
}
