//! Error types for block execution.
//!
//! Three classes of failure exist and they never mix:
//!
//! - [`ReadError`] is transient. A read hit an estimate; the attempt stops and
//!   is retried once the writer resolves. Never surfaced to callers.
//! - [`TxnError::Failed`] is the transaction's own business failure. It is the
//!   final result for that index, exactly as in sequential execution.
//! - [`SchedulerError`] fails the whole block.

use crate::access::{AccessType, ResourceId};
use crate::dag::EdgeId;
use crate::types::TxnIndex;
use thiserror::Error;

/// Raised by [`crate::view::TxnView`] when a read cannot be served
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The closest lower version is an estimate left by an aborted writer.
    #[error("read blocked on estimate written by transaction {writer}")]
    Estimate { writer: TxnIndex },
}

/// Error returned from business logic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnError<E> {
    /// The attempt observed an in-flight write and must be retried.
    #[error("dependency on transaction {writer}")]
    Dependency { writer: TxnIndex },
    /// The transaction failed on its own terms.
    #[error("transaction failed: {0}")]
    Failed(E),
}

impl<E> From<ReadError> for TxnError<E> {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Estimate { writer } => TxnError::Dependency { writer },
        }
    }
}

/// Failure of the commit sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("writeset for transaction {index} flushed out of order (expected {expected})")]
    OutOfOrder { index: TxnIndex, expected: TxnIndex },
    #[error("store backend: {0}")]
    Backend(String),
}

/// Block-level failure. The block cannot be scheduled and no writeset has
/// been flushed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("block has {txns} transactions but {declared} access declarations")]
    DeclarationCount { txns: usize, declared: usize },

    #[error("transaction {txn_idx} message {msg_idx} declares no access operations")]
    MissingDeclaration { txn_idx: TxnIndex, msg_idx: usize },

    #[error(
        "transaction {txn_idx} message {msg_idx}: malformed {access_type:?} on {resource}: {reason}"
    )]
    MalformedDeclaration {
        txn_idx: TxnIndex,
        msg_idx: usize,
        access_type: AccessType,
        resource: ResourceId,
        reason: &'static str,
    },

    #[error("transaction {txn_idx} exceeded its retry budget of {budget}")]
    RetryBudgetExhausted { txn_idx: TxnIndex, budget: usize },

    #[error("edge {edge} was signaled more than once")]
    DuplicateSignal { edge: EdgeId },

    #[error("edge {edge} was dropped without being signaled")]
    SignalDropped { edge: EdgeId },

    #[error("transaction {txn_idx} panicked: {message}")]
    TransactionPanicked { txn_idx: TxnIndex, message: String },

    #[error("worker thread panicked")]
    WorkerPanicked,

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),

    #[error("commit failed: {0}")]
    Commit(#[from] StoreError),
}

impl SchedulerError {
    /// Whether the failure points at bad input rather than a runtime fault.
    pub fn is_declaration_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::DeclarationCount { .. }
                | SchedulerError::MissingDeclaration { .. }
                | SchedulerError::MalformedDeclaration { .. }
        )
    }
}
