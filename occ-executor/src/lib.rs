//! Optimistic parallel executor for ordered blocks of transactions.
//!
//! Transactions run speculatively on worker threads against a multi-version
//! store and commit as if they had run one after another in block order.
//! Declared access operations are turned into a dependency graph that orders
//! the first attempt of conflicting transactions; everything the declarations
//! miss is caught by validating each read set after the fact.
//!
//! # Core Components
//!
//! - **MVHashMap**: per-key version history for the block being executed
//! - **DependencyGraph**: edges between declared accesses, one single-slot
//!   channel per edge
//! - **Scheduler**: ready queue, estimate parking and the retry budget
//! - **ParallelExecutor**: rounds of execution and validation, then commit
//!
//! # Example
//!
//! ```rust,ignore
//! use occ_executor::{ExecutorConfig, MemoryStore, ParallelExecutor, WorkerCount};
//!
//! let executor = ParallelExecutor::new(ExecutorConfig::new(WorkerCount::Fixed(4)), logic);
//! let mut store = MemoryStore::new();
//! let result = executor.execute_block(&txns, &decls, &mut store)?;
//!
//! println!("Successful: {}, Failed: {}", result.successful(), result.failed());
//! ```

pub mod access;
pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod mvhashmap;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod types;
pub mod validation;
pub mod view;


pub use access::{
    AccessOperation, AccessType, JsonFieldExtractor, MessageAccess, ResourceId, TxnAccessOps,
};
pub use config::{ExecutorConfig, WorkerCount};
pub use dag::DependencyGraph;
pub use error::{ReadError, SchedulerError, StoreError, TxnError};
pub use executor::{BlockExecutionResult, ExecutionStats, ParallelExecutor, TxnExecutor};
pub use store::{CommitSink, MemoryStore, ParentStore};
pub use types::{Incarnation, Key, TxnIndex, Value, Version, WriteSet};
pub use view::TxnView;
