//! One-shot completion signals for dependency edges.
//!
//! Every edge of the dependency graph owns one single-slot channel. The
//! sending half is consumed by [`EdgeSender::send`], so it cannot be sent
//! twice, and all senders of a transaction live in one [`SignalGuard`] whose
//! `Drop` is the only place they are fired. Whatever ends the first attempt
//! of a transaction (success, business failure, caught panic, unwinding
//! worker) drops the guard exactly once.

use crate::dag::EdgeId;
use crate::error::SchedulerError;
use crate::types::TxnIndex;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Counts sends per edge over the lifetime of a block.
#[derive(Debug)]
pub struct SignalLedger {
    sends: Vec<AtomicUsize>,
}

impl SignalLedger {
    fn new(num_edges: usize) -> Self {
        Self {
            sends: std::iter::repeat_with(|| AtomicUsize::new(0))
                .take(num_edges)
                .collect(),
        }
    }

    fn record(&self, edge: EdgeId) -> usize {
        self.sends[edge.0].fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Send count of every edge, by edge id.
    pub fn counts(&self) -> Vec<usize> {
        self.sends.iter().map(|c| c.load(Ordering::Acquire)).collect()
    }

    /// Checks that every edge was signaled exactly once.
    pub fn verify(&self) -> Result<(), SchedulerError> {
        for (idx, count) in self.counts().into_iter().enumerate() {
            match count {
                1 => {}
                0 => return Err(SchedulerError::SignalDropped { edge: EdgeId(idx) }),
                _ => return Err(SchedulerError::DuplicateSignal { edge: EdgeId(idx) }),
            }
        }
        Ok(())
    }
}

/// Sending half of one edge.
#[derive(Debug)]
pub struct EdgeSender {
    edge: EdgeId,
    tx: Sender<()>,
    ledger: Arc<SignalLedger>,
}

impl EdgeSender {
    pub fn edge(&self) -> EdgeId {
        self.edge
    }

    /// Fires the edge. Consumes the sender.
    pub fn send(self) -> Result<(), SchedulerError> {
        self.ledger.record(self.edge);
        match self.tx.try_send(()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(())) => Err(SchedulerError::DuplicateSignal { edge: self.edge }),
            // The receiving transaction already finished waiting.
            Err(TrySendError::Disconnected(())) => Ok(()),
        }
    }
}

/// Receiving half of one edge.
#[derive(Debug)]
pub struct EdgeReceiver {
    edge: EdgeId,
    rx: Receiver<()>,
}

impl EdgeReceiver {
    pub fn edge(&self) -> EdgeId {
        self.edge
    }

    /// Blocks until the edge fires. Consumes the receiver.
    pub fn wait(self) -> Result<(), SchedulerError> {
        self.rx
            .recv()
            .map_err(|_| SchedulerError::SignalDropped { edge: self.edge })
    }
}

/// Creates the channel for one edge.
pub fn edge_channel(edge: EdgeId, ledger: &Arc<SignalLedger>) -> (EdgeSender, EdgeReceiver) {
    let (tx, rx) = channel::bounded(1);
    (
        EdgeSender {
            edge,
            tx,
            ledger: Arc::clone(ledger),
        },
        EdgeReceiver { edge, rx },
    )
}

/// Owns every outgoing sender of one transaction and fires them all when
/// dropped.
#[derive(Debug)]
pub struct SignalGuard {
    txn_idx: TxnIndex,
    senders: Vec<EdgeSender>,
}

impl SignalGuard {
    pub fn new(txn_idx: TxnIndex, senders: Vec<EdgeSender>) -> Self {
        Self { txn_idx, senders }
    }

    pub fn txn_idx(&self) -> TxnIndex {
        self.txn_idx
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        let fired = self.senders.len();
        for sender in self.senders.drain(..) {
            // A failed send is already counted by the ledger, which the
            // executor checks once the first round has drained.
            let _ = sender.send();
        }
        if fired > 0 {
            trace!(txn_idx = self.txn_idx, fired, "signaled outgoing edges");
        }
    }
}

/// Per-block wiring of all edge channels.
///
/// Each transaction's guard and receivers can be taken exactly once; the
/// first attempt of a transaction takes both.
#[derive(Debug)]
pub struct SignalPlan {
    guards: Vec<Mutex<Option<SignalGuard>>>,
    receivers: Vec<Mutex<Option<Vec<EdgeReceiver>>>>,
    ledger: Arc<SignalLedger>,
}

impl SignalPlan {
    /// Builds channels for `edges`, given as `(edge, from_txn, to_txn)`.
    pub fn new(
        num_txns: usize,
        num_edges: usize,
        edges: impl IntoIterator<Item = (EdgeId, TxnIndex, TxnIndex)>,
    ) -> Self {
        let ledger = Arc::new(SignalLedger::new(num_edges));
        let mut senders: Vec<Vec<EdgeSender>> = (0..num_txns).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<EdgeReceiver>> = (0..num_txns).map(|_| Vec::new()).collect();
        for (edge, from, to) in edges {
            let (tx, rx) = edge_channel(edge, &ledger);
            senders[from].push(tx);
            receivers[to].push(rx);
        }
        Self {
            guards: senders
                .into_iter()
                .enumerate()
                .map(|(txn_idx, s)| Mutex::new(Some(SignalGuard::new(txn_idx, s))))
                .collect(),
            receivers: receivers.into_iter().map(|r| Mutex::new(Some(r))).collect(),
            ledger,
        }
    }

    /// Takes the guard of `txn_idx`. Returns `None` once taken.
    pub fn take_guard(&self, txn_idx: TxnIndex) -> Option<SignalGuard> {
        self.guards[txn_idx].lock().take()
    }

    /// Takes the incoming receivers of `txn_idx`. Returns `None` once taken.
    pub fn take_receivers(&self, txn_idx: TxnIndex) -> Option<Vec<EdgeReceiver>> {
        self.receivers[txn_idx].lock().take()
    }

    /// Fires every guard not taken yet so that no waiter blocks forever.
    /// Used when the block is abandoned.
    pub fn release_all(&self) {
        for slot in &self.guards {
            drop(slot.lock().take());
        }
    }

    pub fn ledger(&self) -> &SignalLedger {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_guard_fires_each_edge_once() {
        let plan = SignalPlan::new(3, 2, vec![(EdgeId(0), 0, 1), (EdgeId(1), 0, 2)]);

        let guard = plan.take_guard(0).unwrap();
        assert_eq!(guard.len(), 2);
        assert!(plan.take_guard(0).is_none());
        drop(guard);

        for txn in [1, 2] {
            for rx in plan.take_receivers(txn).unwrap() {
                rx.wait().unwrap();
            }
        }
        assert_eq!(plan.ledger().counts(), vec![1, 1]);
        assert!(plan.ledger().verify().is_ok());
    }

    #[test]
    fn test_guard_fires_while_unwinding() {
        let plan = Arc::new(SignalPlan::new(2, 1, vec![(EdgeId(0), 0, 1)]));
        let receivers = plan.take_receivers(1).unwrap();

        let worker = {
            let plan = Arc::clone(&plan);
            thread::spawn(move || {
                let _guard = plan.take_guard(0).unwrap();
                panic!("business logic blew up");
            })
        };
        assert!(worker.join().is_err());

        for rx in receivers {
            rx.wait().unwrap();
        }
        assert!(plan.ledger().verify().is_ok());
    }

    #[test]
    fn test_waiter_blocks_until_signal() {
        let plan = Arc::new(SignalPlan::new(2, 1, vec![(EdgeId(0), 0, 1)]));
        let receivers = plan.take_receivers(1).unwrap();
        let guard = plan.take_guard(0).unwrap();

        let waiter = thread::spawn(move || {
            for rx in receivers {
                rx.wait().unwrap();
            }
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().unwrap();
    }

    #[test]
    fn test_unsent_edge_reports_dropped() {
        let ledger = Arc::new(SignalLedger::new(1));
        let (tx, rx) = edge_channel(EdgeId(0), &ledger);
        drop(tx);
        assert_eq!(rx.wait(), Err(SchedulerError::SignalDropped { edge: EdgeId(0) }));
        assert_eq!(
            ledger.verify(),
            Err(SchedulerError::SignalDropped { edge: EdgeId(0) })
        );
    }

    #[test]
    fn test_ledger_flags_double_count() {
        let ledger = Arc::new(SignalLedger::new(1));
        ledger.record(EdgeId(0));
        ledger.record(EdgeId(0));
        assert_eq!(
            ledger.verify(),
            Err(SchedulerError::DuplicateSignal { edge: EdgeId(0) })
        );
    }
}
