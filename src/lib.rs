//! Benchmarking harness for the OCC parallel executor.
//!
//! This crate drives [`occ_executor`] with a small signed-bank workload and
//! compares it against one-at-a-time execution of the same business logic.
//!
//! # Architecture
//!
//! The framework is organized around three main concepts:
//!
//! - **Workload**: A pre-generated set of signed transactions and accounts
//! - **Bank**: The business logic and its access declarations
//! - **Executor**: A strategy for executing transactions (sequential or OCC)
//!
//! # Quick Start
//!
//! ```
//! use occ_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
//!
//! let config = WorkloadConfig {
//!     num_accounts: 100,
//!     num_transactions: 50,
//!     ..WorkloadConfig::default()
//! };
//!
//! // Generate workload (signs all transactions upfront)
//! let workload = Workload::generate(config).unwrap();
//! let store = workload.create_store();
//!
//! let executor = SequentialExecutor::new(true);
//! let (_store, result) = executor.execute(store, &workload).unwrap();
//!
//! println!("Successful: {}", result.successful);
//! ```

pub mod bank;
pub mod executor;
pub mod window;

pub use bank::{BankError, BankLogic, BankMsg, DeclarationMode};
pub use executor::{ExecutionResult, Executor, OccExecutor, SequentialExecutor};

use alloy_primitives::{keccak256, Address, Bytes, Signature, B256, U256};
use k256::ecdsa::{SigningKey, VerifyingKey};
use occ_executor::{MemoryStore, TxnAccessOps};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;

// ============================================================================
// Account & Key Management
// ============================================================================

/// An account with its signing key for transaction signing.
#[derive(Clone)]
pub struct Account {
    /// The secp256k1 signing key.
    pub signing_key: SigningKey,
    /// The address derived from the public key.
    pub address: Address,
}

impl Account {
    /// Creates a new account from a signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = public_key_to_address(&verifying_key);
        Self { signing_key, address }
    }

    /// Generates a deterministic account from a seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut key_bytes = [0u8; 32];
        // Zero and values above the curve order are not valid scalars.
        loop {
            rng.fill(&mut key_bytes);
            if let Ok(signing_key) = SigningKey::from_bytes(&key_bytes.into()) {
                return Self::from_signing_key(signing_key);
            }
        }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish()
    }
}

/// Derives an address from a secp256k1 public key.
fn public_key_to_address(verifying_key: &VerifyingKey) -> Address {
    let public_key_bytes = verifying_key.to_encoded_point(false);
    // Skip the 0x04 prefix byte, hash the rest.
    let hash = keccak256(&public_key_bytes.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

// ============================================================================
// Signed Transaction
// ============================================================================

/// A signed bank transaction carrying one or more messages.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    /// The sender's address.
    pub from: Address,
    /// The transaction nonce.
    pub nonce: u64,
    /// Messages, executed in order. If one fails the whole transaction fails.
    pub messages: Vec<BankMsg>,
    /// The ECDSA signature.
    pub signature: Signature,
    /// The hash of the transaction data that was signed.
    pub tx_hash: B256,
}

impl SignedTransaction {
    /// Creates a new signed transaction.
    pub fn new(
        account: &Account,
        nonce: u64,
        messages: Vec<BankMsg>,
        chain_id: u64,
    ) -> Result<Self, k256::ecdsa::Error> {
        let tx_hash = Self::compute_tx_hash(account.address, nonce, &messages, chain_id);
        let signature = Self::sign(&account.signing_key, tx_hash)?;

        Ok(Self {
            from: account.address,
            nonce,
            messages,
            signature,
            tx_hash,
        })
    }

    /// A single-message value transfer.
    pub fn transfer(
        account: &Account,
        to: Address,
        amount: U256,
        nonce: u64,
        chain_id: u64,
    ) -> Result<Self, k256::ecdsa::Error> {
        Self::new(account, nonce, vec![BankMsg::Transfer { to, amount }], chain_id)
    }

    /// Computes the transaction hash for signing.
    fn compute_tx_hash(from: Address, nonce: u64, messages: &[BankMsg], chain_id: u64) -> B256 {
        let mut data = Vec::with_capacity(20 + 8 + 8 + messages.len() * 64);
        data.extend_from_slice(from.as_slice());
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(&chain_id.to_be_bytes());
        for msg in messages {
            msg.encode(&mut data);
        }
        keccak256(&data)
    }

    /// Signs a transaction hash with the given signing key.
    fn sign(signing_key: &SigningKey, tx_hash: B256) -> Result<Signature, k256::ecdsa::Error> {
        let (sig, recovery_id) = signing_key.sign_prehash_recoverable(tx_hash.as_slice())?;
        Ok(Signature::from_signature_and_parity(sig, recovery_id.is_y_odd()))
    }

    /// Recovers the sender's address from the signature.
    /// Returns None if signature verification fails.
    pub fn recover_signer(&self) -> Option<Address> {
        self.signature
            .recover_address_from_prehash(&self.tx_hash)
            .ok()
    }

    /// Verifies the signature and returns true if valid.
    pub fn verify(&self) -> bool {
        self.recover_signer()
            .map(|addr| addr == self.from)
            .unwrap_or(false)
    }
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// Share of each non-transfer message kind in a generated workload. The
/// remainder are transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MessageMix {
    pub mint: f64,
    pub memo: f64,
    pub sweep: f64,
    pub heartbeat: f64,
}

/// Configuration for workload generation.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Total number of accounts in the system.
    pub num_accounts: usize,
    /// Number of transactions to generate.
    pub num_transactions: usize,
    /// Conflict factor: 0.0 = no conflicts, 1.0 = all transactions touch same accounts.
    pub conflict_factor: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Chain ID for transaction signing.
    pub chain_id: u64,
    pub mix: MessageMix,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            conflict_factor: 0.0,
            seed: 42,
            chain_id: 1,
            mix: MessageMix::default(),
        }
    }
}

/// Starting balance of every workload account (1000 ETH in wei).
pub fn initial_balance() -> U256 {
    U256::from(1_000_000_000_000_000_000_000u128)
}

/// Amount moved by generated transfers and mints (0.001 ETH in wei).
pub fn transfer_amount() -> U256 {
    U256::from(1_000_000_000_000_000u64)
}

/// A complete benchmark workload with pre-generated accounts and signed transactions.
#[derive(Debug, Clone)]
pub struct Workload {
    /// The accounts (with signing keys) participating in this workload.
    pub accounts: Vec<Account>,
    /// The pre-signed transactions to execute.
    pub transactions: Vec<SignedTransaction>,
    /// The configuration used to generate this workload.
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a new workload from the given configuration.
    /// All transactions are pre-signed during generation.
    pub fn generate(config: WorkloadConfig) -> Result<Self, k256::ecdsa::Error> {
        let mut rng = StdRng::seed_from_u64(config.seed);

        // Generate accounts with deterministic keys.
        let accounts: Vec<Account> = (0..config.num_accounts)
            .map(|i| Account::from_seed(config.seed.wrapping_add(i as u64)))
            .collect();

        // Track nonces per account for proper transaction sequencing.
        let mut nonces: HashMap<usize, u64> = HashMap::new();

        // Calculate "hot" account range for conflict simulation.
        let hot_account_count = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (config.num_accounts as f64 - 2.0))
                .max(2.0) as usize
        } else {
            config.num_accounts
        };

        let mut transactions = Vec::with_capacity(config.num_transactions);
        for height in 0..config.num_transactions {
            let use_hot = rng.gen::<f64>() < config.conflict_factor;
            let pool = if use_hot {
                hot_account_count
            } else {
                config.num_accounts
            };

            let from_idx = rng.gen_range(0..pool);
            let mut to_idx = rng.gen_range(0..pool);
            while to_idx == from_idx && pool > 1 {
                to_idx = rng.gen_range(0..pool);
            }
            let to = accounts[to_idx].address;

            let msg = Self::pick_message(&mut rng, &config.mix, to, height as u64);
            let nonce = nonces.entry(from_idx).or_insert(0);
            transactions.push(SignedTransaction::new(
                &accounts[from_idx],
                *nonce,
                vec![msg],
                config.chain_id,
            )?);
            *nonce += 1;
        }

        Ok(Self {
            accounts,
            transactions,
            config,
        })
    }

    fn pick_message(rng: &mut StdRng, mix: &MessageMix, to: Address, height: u64) -> BankMsg {
        let roll = rng.gen::<f64>();
        let mut bound = mix.sweep;
        if roll < bound {
            return BankMsg::Sweep;
        }
        bound += mix.memo;
        if roll < bound {
            // One memo in ten names an account that does not decode.
            let payload = if rng.gen_bool(0.1) {
                Bytes::from_static(b"{\"account\":\"not an address\"}")
            } else {
                Bytes::from(
                    serde_json::json!({ "account": to, "note": format!("memo {height}") })
                        .to_string()
                        .into_bytes(),
                )
            };
            return BankMsg::Memo { payload };
        }
        bound += mix.heartbeat;
        if roll < bound {
            return BankMsg::Heartbeat {
                height,
                signed: rng.gen_bool(0.9),
            };
        }
        bound += mix.mint;
        if roll < bound {
            return BankMsg::Mint {
                to,
                amount: transfer_amount(),
            };
        }
        BankMsg::Transfer {
            to,
            amount: transfer_amount(),
        }
    }

    /// Creates a store pre-funded with all accounts in this workload.
    pub fn create_store(&self) -> MemoryStore {
        let mut store = MemoryStore::new();
        let balance = bank::encode_u256(initial_balance());
        for account in &self.accounts {
            store.insert(bank::balance_key(account.address), balance.clone());
        }
        store
    }

    /// Access declarations for every transaction, in block order.
    pub fn declarations(&self, mode: DeclarationMode) -> Vec<TxnAccessOps> {
        self.transactions
            .iter()
            .enumerate()
            .map(|(idx, tx)| bank::declare(idx, tx, mode))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
