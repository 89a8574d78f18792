//! Signed bank: business logic and access declarations.
//!
//! State layout, all values big-endian:
//!
//! | key               | value                          |
//! |-------------------|--------------------------------|
//! | `bal/{address}`   | balance, 32-byte `U256`        |
//! | `nonce/{address}` | next expected nonce, `u64`     |
//! | `memo/{address}`  | number of memos received, `u64`|
//! | `hb/{address}`    | [`LivenessWindow`], 8 bytes    |
//! | `supply`          | sum of balances at last sweep  |

use crate::window::{LivenessWindow, WindowError, WindowOffset};
use crate::SignedTransaction;
use alloy_primitives::{Address, Bytes, U256};
use occ_executor::{
    JsonFieldExtractor, Key, MessageAccess, ParentStore, ResourceId, TxnAccessOps, TxnError,
    TxnExecutor, TxnIndex, TxnView, Value,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const BALANCE_PREFIX: &[u8] = b"bal/";
pub const NONCE_PREFIX: &[u8] = b"nonce/";
pub const MEMO_PREFIX: &[u8] = b"memo/";
pub const WINDOW_PREFIX: &[u8] = b"hb/";
pub const SUPPLY_KEY: &[u8] = b"supply";

fn prefixed(prefix: &[u8], account: Address) -> Key {
    let mut key = Vec::with_capacity(prefix.len() + 20);
    key.extend_from_slice(prefix);
    key.extend_from_slice(account.as_slice());
    Key::from(key)
}

pub fn balance_key(account: Address) -> Key {
    prefixed(BALANCE_PREFIX, account)
}

pub fn nonce_key(account: Address) -> Key {
    prefixed(NONCE_PREFIX, account)
}

pub fn memo_key(account: Address) -> Key {
    prefixed(MEMO_PREFIX, account)
}

pub fn window_key(account: Address) -> Key {
    prefixed(WINDOW_PREFIX, account)
}

pub fn supply_key() -> Key {
    Key::from_static(SUPPLY_KEY)
}

/// `[bal/, bal0)`: every balance key, since `'0'` follows `'/'`.
fn balance_range() -> (Key, Key) {
    (Key::from_static(BALANCE_PREFIX), Key::from_static(b"bal0"))
}

pub fn encode_u256(value: U256) -> Value {
    Bytes::copy_from_slice(&value.to_be_bytes::<32>())
}

fn encode_u64(value: u64) -> Value {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// A single bank operation. A transaction carries one or more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankMsg {
    Transfer { to: Address, amount: U256 },
    Mint { to: Address, amount: U256 },
    /// JSON body naming the account credited with the memo.
    Memo { payload: Bytes },
    /// Sums every balance into the supply key.
    Sweep,
    Heartbeat { height: u64, signed: bool },
}

impl BankMsg {
    /// Appends the canonical encoding used for signing.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            BankMsg::Transfer { to, amount } => {
                buf.push(0);
                buf.extend_from_slice(to.as_slice());
                buf.extend_from_slice(&amount.to_be_bytes::<32>());
            }
            BankMsg::Mint { to, amount } => {
                buf.push(1);
                buf.extend_from_slice(to.as_slice());
                buf.extend_from_slice(&amount.to_be_bytes::<32>());
            }
            BankMsg::Memo { payload } => {
                buf.push(2);
                buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
                buf.extend_from_slice(payload);
            }
            BankMsg::Sweep => buf.push(3),
            BankMsg::Heartbeat { height, signed } => {
                buf.push(4);
                buf.extend_from_slice(&height.to_be_bytes());
                buf.push(u8::from(*signed));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BankError {
    #[error("signature does not recover sender {0}")]
    InvalidSignature(Address),

    #[error("bad nonce for {account}: expected {expected}, got {got}")]
    BadNonce { account: Address, expected: u64, got: u64 },

    #[error("insufficient funds in {account}: balance {balance}, needed {needed}")]
    InsufficientFunds {
        account: Address,
        balance: U256,
        needed: U256,
    },

    #[error("balance overflow crediting {0}")]
    Overflow(Address),

    #[error("malformed memo: {0}")]
    MalformedMemo(String),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error("corrupt value under key {0}")]
    CorruptValue(Key),
}

impl From<BankError> for TxnError<BankError> {
    fn from(err: BankError) -> Self {
        TxnError::Failed(err)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoPayload {
    pub account: Address,
    #[serde(default)]
    pub note: String,
}

pub fn decode_memo(payload: &[u8]) -> Result<MemoPayload, BankError> {
    serde_json::from_slice(payload).map_err(|e| BankError::MalformedMemo(e.to_string()))
}

type BankResult<T> = Result<T, TxnError<BankError>>;

fn read_u256<S: ParentStore>(view: &mut TxnView<'_, S>, key: Key) -> BankResult<U256> {
    match view.get(&key)? {
        None => Ok(U256::ZERO),
        Some(raw) => {
            U256::try_from_be_slice(&raw).ok_or_else(|| BankError::CorruptValue(key).into())
        }
    }
}

fn read_u64<S: ParentStore>(view: &mut TxnView<'_, S>, key: Key) -> BankResult<u64> {
    match view.get(&key)? {
        None => Ok(0),
        Some(raw) => {
            let bytes = <[u8; 8]>::try_from(&raw[..])
                .map_err(|_| BankError::CorruptValue(key.clone()))?;
            Ok(u64::from_be_bytes(bytes))
        }
    }
}

/// Bank business logic, run once per attempt by the executors.
#[derive(Debug, Clone, Copy)]
pub struct BankLogic {
    pub verify_signatures: bool,
}

impl BankLogic {
    pub fn new(verify_signatures: bool) -> Self {
        Self { verify_signatures }
    }

    fn apply<S: ParentStore>(
        &self,
        sender: Address,
        msg: &BankMsg,
        view: &mut TxnView<'_, S>,
    ) -> BankResult<()> {
        match msg {
            BankMsg::Transfer { to, amount } => {
                let from_key = balance_key(sender);
                let balance = read_u256(view, from_key.clone())?;
                if balance < *amount {
                    return Err(BankError::InsufficientFunds {
                        account: sender,
                        balance,
                        needed: *amount,
                    }
                    .into());
                }
                view.set(from_key, encode_u256(balance - *amount));

                // Read after the debit so a self-transfer nets out.
                let to_key = balance_key(*to);
                let credited = read_u256(view, to_key.clone())?
                    .checked_add(*amount)
                    .ok_or(BankError::Overflow(*to))?;
                view.set(to_key, encode_u256(credited));
            }
            BankMsg::Mint { to, amount } => {
                let key = balance_key(*to);
                let credited = read_u256(view, key.clone())?
                    .checked_add(*amount)
                    .ok_or(BankError::Overflow(*to))?;
                view.set(key, encode_u256(credited));
            }
            BankMsg::Memo { payload } => {
                let memo = decode_memo(payload)?;
                let key = memo_key(memo.account);
                let count = read_u64(view, key.clone())?;
                view.set(key, encode_u64(count.saturating_add(1)));
            }
            BankMsg::Sweep => {
                let (start, end) = balance_range();
                let mut supply = U256::ZERO;
                for (key, raw) in view.iterate(&start, Some(&end))? {
                    let balance =
                        U256::try_from_be_slice(&raw).ok_or(BankError::CorruptValue(key))?;
                    supply = supply.checked_add(balance).ok_or(BankError::Overflow(sender))?;
                }
                view.set(supply_key(), encode_u256(supply));
            }
            BankMsg::Heartbeat { height, signed } => {
                let key = window_key(sender);
                let mut window = match view.get(&key)? {
                    Some(raw) => LivenessWindow::from_bytes(&raw).map_err(BankError::from)?,
                    None => LivenessWindow::default(),
                };
                window.record(WindowOffset::from_height(*height), *signed);
                view.set(key, Bytes::copy_from_slice(&window.to_bytes()));
            }
        }
        Ok(())
    }
}

impl TxnExecutor<SignedTransaction> for BankLogic {
    type Output = ();
    type Error = BankError;

    fn execute<S: ParentStore>(
        &self,
        tx: &SignedTransaction,
        view: &mut TxnView<'_, S>,
    ) -> BankResult<()> {
        if self.verify_signatures && !tx.verify() {
            return Err(BankError::InvalidSignature(tx.from).into());
        }

        let key = nonce_key(tx.from);
        let expected = read_u64(view, key.clone())?;
        if tx.nonce != expected {
            return Err(BankError::BadNonce {
                account: tx.from,
                expected,
                got: tx.nonce,
            }
            .into());
        }
        view.set(key, encode_u64(expected + 1));

        for msg in &tx.messages {
            self.apply(tx.from, msg, view)?;
        }
        Ok(())
    }
}

/// How the harness declares access operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DeclarationMode {
    /// Exact per-message resources; wildcard only where they cannot be known.
    #[default]
    Accurate,
    /// Every message declares UNKNOWN on ANY.
    Wildcard,
}

/// Declares the access operations of `tx` at position `txn_idx`.
///
/// The nonce is touched by every transaction, so it is declared on the first
/// message. A memo is keyed on the `account` field of its JSON body; one
/// whose body names no account falls back to the wildcard.
pub fn declare(txn_idx: TxnIndex, tx: &SignedTransaction, mode: DeclarationMode) -> TxnAccessOps {
    let num_messages = tx.messages.len().max(1);
    if mode == DeclarationMode::Wildcard {
        return TxnAccessOps::wildcard(txn_idx, num_messages);
    }

    let nonce = ResourceId::Named(nonce_key(tx.from));
    if tx.messages.is_empty() {
        return TxnAccessOps::new(vec![MessageAccess::new(txn_idx, 0).read_write(nonce).build()]);
    }

    let memos = JsonFieldExtractor::new(MEMO_PREFIX, &["account"]);
    let messages = tx
        .messages
        .iter()
        .enumerate()
        .map(|(msg_idx, msg)| {
            let mut access = MessageAccess::new(txn_idx, msg_idx);
            if msg_idx == 0 {
                access = access.read_write(nonce.clone());
            }
            let access = match msg {
                BankMsg::Transfer { to, .. } => access
                    .read_write(ResourceId::Named(balance_key(tx.from)))
                    .read_write(ResourceId::Named(balance_key(*to))),
                BankMsg::Mint { to, .. } => access.read_write(ResourceId::Named(balance_key(*to))),
                BankMsg::Memo { payload } => match memos.extract(payload) {
                    Some(resource) => access.read_write(resource),
                    None => {
                        debug!(txn_idx, msg_idx, "memo names no account, declaring wildcard");
                        access.wildcard()
                    }
                },
                BankMsg::Sweep => access.wildcard(),
                BankMsg::Heartbeat { .. } => {
                    access.read_write(ResourceId::Named(window_key(tx.from)))
                }
            };
            access.build()
        })
        .collect();
    TxnAccessOps::new(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{initial_balance, Account};
    use occ_executor::mvhashmap::MVHashMap;
    use occ_executor::{AccessType, MemoryStore, WriteSet};

    fn funded(accounts: &[&Account]) -> MemoryStore {
        let mut store = MemoryStore::new();
        for account in accounts {
            store.insert(balance_key(account.address), encode_u256(initial_balance()));
        }
        store
    }

    fn run(store: &MemoryStore, tx: &SignedTransaction) -> Result<WriteSet, TxnError<BankError>> {
        let mv = MVHashMap::new(0);
        let mut view = TxnView::new(0, &mv, store);
        BankLogic::new(true).execute(tx, &mut view)?;
        Ok(view.into_parts().0)
    }

    fn balance(writes: &WriteSet, account: Address) -> U256 {
        let raw = writes[&balance_key(account)].clone().unwrap();
        U256::try_from_be_slice(&raw).unwrap()
    }

    #[test]
    fn test_transfer_moves_funds_and_bumps_nonce() {
        let (alice, bob) = (Account::from_seed(1), Account::from_seed(2));
        let store = funded(&[&alice, &bob]);
        let tx = SignedTransaction::transfer(&alice, bob.address, U256::from(10), 0, 1).unwrap();

        let writes = run(&store, &tx).unwrap();
        assert_eq!(balance(&writes, alice.address), initial_balance() - U256::from(10));
        assert_eq!(balance(&writes, bob.address), initial_balance() + U256::from(10));
        assert_eq!(writes[&nonce_key(alice.address)], Some(encode_u64(1)));
    }

    #[test]
    fn test_self_transfer_is_neutral() {
        let alice = Account::from_seed(1);
        let store = funded(&[&alice]);
        let tx = SignedTransaction::transfer(&alice, alice.address, U256::from(10), 0, 1).unwrap();
        let writes = run(&store, &tx).unwrap();
        assert_eq!(balance(&writes, alice.address), initial_balance());
    }

    #[test]
    fn test_business_failures() {
        let (alice, bob) = (Account::from_seed(1), Account::from_seed(2));
        let store = funded(&[&alice]);

        let tx = SignedTransaction::transfer(&alice, bob.address, U256::from(1), 3, 1).unwrap();
        assert_eq!(
            run(&store, &tx),
            Err(TxnError::Failed(BankError::BadNonce {
                account: alice.address,
                expected: 0,
                got: 3
            }))
        );

        let tx = SignedTransaction::transfer(&bob, alice.address, U256::from(1), 0, 1).unwrap();
        assert!(matches!(
            run(&store, &tx),
            Err(TxnError::Failed(BankError::InsufficientFunds { .. }))
        ));

        let mut tx = SignedTransaction::transfer(&alice, bob.address, U256::from(1), 0, 1).unwrap();
        tx.from = bob.address;
        assert_eq!(
            run(&store, &tx),
            Err(TxnError::Failed(BankError::InvalidSignature(bob.address)))
        );
    }

    #[test]
    fn test_memo_counts_and_malformed_payload() {
        let (alice, bob) = (Account::from_seed(1), Account::from_seed(2));
        let store = funded(&[&alice]);

        let payload = serde_json::json!({ "account": bob.address }).to_string();
        let msg = BankMsg::Memo { payload: payload.into_bytes().into() };
        let tx = SignedTransaction::new(&alice, 0, vec![msg], 1).unwrap();
        let writes = run(&store, &tx).unwrap();
        assert_eq!(writes[&memo_key(bob.address)], Some(encode_u64(1)));

        let msg = BankMsg::Memo { payload: Bytes::from_static(b"{}") };
        let tx = SignedTransaction::new(&alice, 0, vec![msg], 1).unwrap();
        assert!(matches!(run(&store, &tx), Err(TxnError::Failed(BankError::MalformedMemo(_)))));
    }

    #[test]
    fn test_sweep_sums_balances() {
        let (alice, bob) = (Account::from_seed(1), Account::from_seed(2));
        let mut store = funded(&[&alice, &bob]);
        store.insert(Key::from_static(b"bank"), encode_u256(U256::from(5)));
        let tx = SignedTransaction::new(&alice, 0, vec![BankMsg::Sweep], 1).unwrap();
        let writes = run(&store, &tx).unwrap();
        assert_eq!(writes[&supply_key()], Some(encode_u256(initial_balance() * U256::from(2))));
    }

    #[test]
    fn test_heartbeat_records_window_slot() {
        let alice = Account::from_seed(1);
        let store = funded(&[&alice]);
        let msg = BankMsg::Heartbeat { height: 70, signed: true };
        let tx = SignedTransaction::new(&alice, 0, vec![msg], 1).unwrap();
        let writes = run(&store, &tx).unwrap();
        let raw = writes[&window_key(alice.address)].clone().unwrap();
        let window = LivenessWindow::from_bytes(&raw).unwrap();
        assert!(window.signed_at(WindowOffset::from_height(6)));
        assert_eq!(window.signed_count(), 1);
    }

    #[test]
    fn test_later_message_failure_fails_transaction() {
        let (alice, bob) = (Account::from_seed(1), Account::from_seed(2));
        let store = funded(&[&alice]);
        let messages = vec![
            BankMsg::Mint { to: bob.address, amount: U256::from(1) },
            BankMsg::Transfer { to: bob.address, amount: initial_balance() + U256::from(1) },
        ];
        let tx = SignedTransaction::new(&alice, 0, messages, 1).unwrap();
        assert!(matches!(
            run(&store, &tx),
            Err(TxnError::Failed(BankError::InsufficientFunds { .. }))
        ));
    }

    #[test]
    fn test_declarations() {
        let (alice, bob) = (Account::from_seed(1), Account::from_seed(2));
        let messages = vec![
            BankMsg::Transfer { to: bob.address, amount: U256::from(1) },
            BankMsg::Memo { payload: Bytes::from_static(b"not json") },
            BankMsg::Heartbeat { height: 1, signed: true },
        ];
        let tx = SignedTransaction::new(&alice, 0, messages, 1).unwrap();

        let decls = declare(4, &tx, DeclarationMode::Accurate);
        assert_eq!(decls.num_messages(), 3);
        let first = &decls.messages[0];
        assert_eq!(first.len(), 6);
        assert_eq!(first[0].resource, ResourceId::Named(nonce_key(alice.address)));
        assert_eq!(first[0].access_type, AccessType::Read);
        assert_eq!(first[1].access_type, AccessType::Write);
        assert!(decls.messages[1][0].is_wildcard());
        assert_eq!(decls.messages[2][1].resource, ResourceId::Named(window_key(alice.address)));
        assert!(decls.iter().all(|op| op.txn_idx == 4));

        let wildcard = declare(4, &tx, DeclarationMode::Wildcard);
        assert_eq!(wildcard.num_messages(), 3);
        assert!(wildcard.iter().all(|op| op.is_wildcard()));
    }

    #[test]
    fn test_memo_declaration_keys_on_account_field() {
        let alice = Account::from_seed(1);
        let (bob, carol) = (Account::from_seed(2), Account::from_seed(3));
        let memo = |account: &str, note: &str| BankMsg::Memo {
            payload: serde_json::json!({ "account": account, "note": note })
                .to_string()
                .into_bytes()
                .into(),
        };
        let resource_of = |msg: BankMsg| {
            let tx = SignedTransaction::new(&alice, 0, vec![msg], 1).unwrap();
            let decls = declare(0, &tx, DeclarationMode::Accurate);
            decls.messages[0][2].clone()
        };

        let bob_hex = bob.address.to_string();
        let first = resource_of(memo(&bob_hex, "hi"));
        let second = resource_of(memo(&bob_hex, "again"));
        let other = resource_of(memo(&carol.address.to_string(), "hi"));

        assert!(!first.is_wildcard());
        assert_eq!(first.access_type, AccessType::Read);
        assert_eq!(first.resource, second.resource);
        assert_ne!(first.resource, other.resource);
        // A quoted account is a different value, not the same identifier.
        let quoted = resource_of(memo(&format!("\"{bob_hex}\""), "hi"));
        assert_ne!(first.resource, quoted.resource);

        let empty = resource_of(BankMsg::Memo { payload: Bytes::from_static(b"{}") });
        assert!(empty.is_wildcard());
    }
}
