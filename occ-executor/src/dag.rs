//! Dependency graph built from declared access operations.
//!
//! Nodes are access operations in block order (transaction, message,
//! operation). The ordering relation is, for every resource `R`:
//!
//! - a READ (or ITERATE) comes after the most recent WRITE/UNKNOWN on `R`;
//! - a WRITE/UNKNOWN comes after every preceding access on `R`.
//!
//! `ANY` overlaps every resource.
//!
//! The stored edge set is a transitive reduction of that relation, not the
//! relation itself. Per resource only the last write-like node and the reads
//! issued after it get edges, so `W0, W1, W2` on one key yields the edges
//! `W0 -> W1` and `W1 -> W2`; `W2` still comes after `W0`, through `W1`.
//! Anything that needs the full ordering must follow paths
//! ([`DependencyGraph::depends_on`], [`DependencyGraph::descendants`]) rather
//! than single edges. Edges inside one transaction are dropped (messages run
//! in order anyway) and repeated node pairs collapse into one edge.

use crate::access::{AccessType, ResourceId, TxnAccessOps};
use crate::error::SchedulerError;
use crate::signal::SignalPlan;
use crate::types::TxnIndex;
use alloy_primitives::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::debug;

/// Identifier of one edge (and of its channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(pub usize);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position of an access operation in the block. Ordering is block order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub txn_idx: TxnIndex,
    pub msg_idx: usize,
    pub op_idx: usize,
}

/// `to` may not start before `from`'s transaction has finished its first
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Default, Clone)]
struct ResourceHistory {
    last_write: Option<NodeId>,
    reads_since: Vec<NodeId>,
}

impl ResourceHistory {
    fn all(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.last_write.iter().copied().chain(self.reads_since.iter().copied())
    }
}

#[derive(Debug)]
pub struct DependencyGraph {
    num_txns: usize,
    num_nodes: usize,
    edges: Vec<DependencyEdge>,
    outgoing: Vec<Vec<EdgeId>>,
    incoming: Vec<Vec<EdgeId>>,
}

impl DependencyGraph {
    /// Builds the graph for a block of `num_txns` transactions.
    ///
    /// Every transaction must carry a declaration and every message at least
    /// one operation stamped with its own position.
    pub fn build(num_txns: usize, decls: &[TxnAccessOps]) -> Result<Self, SchedulerError> {
        if decls.len() != num_txns {
            return Err(SchedulerError::DeclarationCount {
                txns: num_txns,
                declared: decls.len(),
            });
        }

        let mut named: HashMap<Bytes, ResourceHistory> = HashMap::new();
        let mut any = ResourceHistory::default();
        let mut seen: HashSet<(NodeId, NodeId)> = HashSet::new();
        let mut edges = Vec::new();
        let mut outgoing = vec![Vec::new(); num_txns];
        let mut incoming = vec![Vec::new(); num_txns];
        let mut num_nodes = 0;

        for (txn_idx, decl) in decls.iter().enumerate() {
            if decl.messages.is_empty() {
                return Err(SchedulerError::MissingDeclaration { txn_idx, msg_idx: 0 });
            }
            for (msg_idx, ops) in decl.messages.iter().enumerate() {
                if ops.is_empty() {
                    return Err(SchedulerError::MissingDeclaration { txn_idx, msg_idx });
                }
                for (op_idx, op) in ops.iter().enumerate() {
                    if op.txn_idx != txn_idx || op.msg_idx != msg_idx {
                        return Err(SchedulerError::MalformedDeclaration {
                            txn_idx,
                            msg_idx,
                            access_type: op.access_type,
                            resource: op.resource.clone(),
                            reason: "operation stamped with another position",
                        });
                    }
                    let node = NodeId {
                        txn_idx,
                        msg_idx,
                        op_idx,
                    };
                    num_nodes += 1;

                    let write_like = op.access_type.is_write_like();
                    let mut deps: Vec<NodeId> = Vec::new();
                    match (&op.resource, write_like) {
                        (ResourceId::Named(name), false) => {
                            let own = named.get(name).and_then(|h| h.last_write);
                            deps.extend(own.max(any.last_write));
                        }
                        (ResourceId::Named(name), true) => {
                            if let Some(history) = named.get(name) {
                                deps.extend(history.all());
                            }
                            deps.extend(any.all());
                        }
                        (ResourceId::Any, false) => {
                            deps.extend(named.values().filter_map(|h| h.last_write));
                            deps.extend(any.last_write);
                        }
                        (ResourceId::Any, true) => {
                            for history in named.values() {
                                deps.extend(history.all());
                            }
                            deps.extend(any.all());
                        }
                    }

                    for from in deps {
                        if from.txn_idx == txn_idx || !seen.insert((from, node)) {
                            continue;
                        }
                        let id = EdgeId(edges.len());
                        edges.push(DependencyEdge { id, from, to: node });
                        outgoing[from.txn_idx].push(id);
                        incoming[txn_idx].push(id);
                    }

                    match (&op.resource, write_like) {
                        (ResourceId::Named(name), false) => {
                            named.entry(name.clone()).or_default().reads_since.push(node);
                        }
                        (ResourceId::Named(name), true) => {
                            named.insert(
                                name.clone(),
                                ResourceHistory {
                                    last_write: Some(node),
                                    reads_since: Vec::new(),
                                },
                            );
                        }
                        (ResourceId::Any, false) => any.reads_since.push(node),
                        (ResourceId::Any, true) => {
                            // Everything so far is ordered before this node.
                            named.clear();
                            any = ResourceHistory {
                                last_write: Some(node),
                                reads_since: Vec::new(),
                            };
                        }
                    }
                }
            }
        }

        debug!(
            txns = num_txns,
            nodes = num_nodes,
            edges = edges.len(),
            "built dependency graph"
        );

        Ok(Self {
            num_txns,
            num_nodes,
            edges,
            outgoing,
            incoming,
        })
    }

    pub fn num_txns(&self) -> usize {
        self.num_txns
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> &DependencyEdge {
        &self.edges[id.0]
    }

    /// Edges leaving any node of `txn_idx`.
    pub fn outgoing(&self, txn_idx: TxnIndex) -> &[EdgeId] {
        &self.outgoing[txn_idx]
    }

    /// Edges entering any node of `txn_idx`.
    pub fn incoming(&self, txn_idx: TxnIndex) -> &[EdgeId] {
        &self.incoming[txn_idx]
    }

    /// Transactions with an edge from `txn_idx`.
    pub fn dependents(&self, txn_idx: TxnIndex) -> BTreeSet<TxnIndex> {
        self.outgoing[txn_idx]
            .iter()
            .map(|id| self.edges[id.0].to.txn_idx)
            .collect()
    }

    /// Transactions with an edge into `txn_idx`. All have lower indices.
    pub fn predecessors(&self, txn_idx: TxnIndex) -> impl Iterator<Item = TxnIndex> + '_ {
        self.incoming[txn_idx]
            .iter()
            .map(|id| self.edges[id.0].from.txn_idx)
    }

    /// Transactions reachable from `txn_idx`, excluding itself.
    pub fn descendants(&self, txn_idx: TxnIndex) -> BTreeSet<TxnIndex> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([txn_idx]);
        while let Some(current) = queue.pop_front() {
            for next in self.dependents(current) {
                if found.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        found
    }

    /// Whether `later` is ordered after `earlier` through some path.
    pub fn depends_on(&self, later: TxnIndex, earlier: TxnIndex) -> bool {
        earlier < later && self.descendants(earlier).contains(&later)
    }

    /// Creates one single-slot channel per edge.
    pub fn signal_plan(&self) -> SignalPlan {
        SignalPlan::new(
            self.num_txns,
            self.edges.len(),
            self.edges
                .iter()
                .map(|edge| (edge.id, edge.from.txn_idx, edge.to.txn_idx)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessOperation, MessageAccess};

    fn r(name: &str) -> ResourceId {
        ResourceId::named(name)
    }

    fn single(txn: TxnIndex, build: impl FnOnce(MessageAccess) -> MessageAccess) -> TxnAccessOps {
        TxnAccessOps::new(vec![build(MessageAccess::new(txn, 0)).build()])
    }

    fn txn_edges(graph: &DependencyGraph) -> BTreeSet<(TxnIndex, TxnIndex)> {
        graph
            .edges()
            .iter()
            .map(|e| (e.from.txn_idx, e.to.txn_idx))
            .collect()
    }

    #[test]
    fn test_disjoint_resources_have_no_edges() {
        let decls = vec![
            single(0, |m| m.read_write(r("a"))),
            single(1, |m| m.read_write(r("b"))),
            single(2, |m| m.read(r("c"))),
        ];
        let graph = DependencyGraph::build(3, &decls).unwrap();
        assert_eq!(graph.num_edges(), 0);
        assert_eq!(graph.num_nodes(), 5);
    }

    #[test]
    fn test_read_depends_on_latest_write_only() {
        let decls = vec![
            single(0, |m| m.write(r("k"))),
            single(1, |m| m.write(r("k"))),
            single(2, |m| m.read(r("k"))),
        ];
        let graph = DependencyGraph::build(3, &decls).unwrap();
        assert_eq!(txn_edges(&graph), BTreeSet::from([(0, 1), (1, 2)]));
    }

    #[test]
    fn test_write_chain_keeps_only_adjacent_edges() {
        let decls = vec![
            single(0, |m| m.write(r("k"))),
            single(1, |m| m.write(r("k"))),
            single(2, |m| m.write(r("k"))),
        ];
        let graph = DependencyGraph::build(3, &decls).unwrap();
        assert_eq!(txn_edges(&graph), BTreeSet::from([(0, 1), (1, 2)]));
        assert!(!graph.predecessors(2).any(|p| p == 0));
        assert!(graph.depends_on(2, 0));
        assert_eq!(graph.descendants(0), BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_reads_do_not_order_each_other() {
        let decls = vec![
            single(0, |m| m.read(r("k"))),
            single(1, |m| m.read(r("k"))),
            single(2, |m| m.write(r("k"))),
        ];
        let graph = DependencyGraph::build(3, &decls).unwrap();
        assert_eq!(txn_edges(&graph), BTreeSet::from([(0, 2), (1, 2)]));
    }

    #[test]
    fn test_iterate_is_ordered_like_read() {
        let decls = vec![
            single(0, |m| m.write(r("p"))),
            single(1, |m| m.iterate(r("p"))),
            single(2, |m| m.write(r("p"))),
        ];
        let graph = DependencyGraph::build(3, &decls).unwrap();
        assert_eq!(txn_edges(&graph), BTreeSet::from([(0, 1), (0, 2), (1, 2)]));
    }

    #[test]
    fn test_same_transaction_edges_skipped() {
        let decls = vec![TxnAccessOps::new(vec![
            MessageAccess::new(0, 0).write(r("k")).build(),
            MessageAccess::new(0, 1).read_write(r("k")).build(),
        ])];
        let graph = DependencyGraph::build(1, &decls).unwrap();
        assert_eq!(graph.num_edges(), 0);
    }

    #[test]
    fn test_wildcard_orders_everything() {
        let decls = vec![
            single(0, |m| m.write(r("a"))),
            single(1, |m| m.read(r("b"))),
            single(2, |m| m.wildcard()),
            single(3, |m| m.read(r("z"))),
            single(4, |m| m.write(r("y"))),
        ];
        let graph = DependencyGraph::build(5, &decls).unwrap();
        let edges = txn_edges(&graph);
        assert!(edges.contains(&(0, 2)));
        assert!(edges.contains(&(1, 2)));
        assert!(edges.contains(&(2, 3)));
        assert!(edges.contains(&(2, 4)));
        for later in 3..5 {
            for earlier in 0..later {
                if earlier == 3 && later == 4 {
                    continue;
                }
                assert!(graph.depends_on(later, earlier), "{earlier} -> {later}");
            }
        }
        assert!(!graph.depends_on(4, 3));
    }

    #[test]
    fn test_wildcard_write_waits_for_prior_wildcard_reads() {
        let decls = vec![
            single(0, |m| m.op(AccessType::Read, ResourceId::Any)),
            single(1, |m| m.write(r("k"))),
        ];
        let graph = DependencyGraph::build(2, &decls).unwrap();
        assert_eq!(txn_edges(&graph), BTreeSet::from([(0, 1)]));
    }

    #[test]
    fn test_descendants_are_transitive() {
        let decls = vec![
            single(0, |m| m.write(r("a"))),
            single(1, |m| m.read(r("a")).write(r("b"))),
            single(2, |m| m.read(r("b"))),
            single(3, |m| m.read(r("c"))),
        ];
        let graph = DependencyGraph::build(4, &decls).unwrap();
        assert_eq!(graph.descendants(0), BTreeSet::from([1, 2]));
        assert!(graph.descendants(3).is_empty());
        assert_eq!(graph.incoming(2).len(), 1);
        assert_eq!(graph.predecessors(2).collect::<Vec<_>>(), vec![1]);
        assert_eq!(graph.outgoing(0).len(), 1);
    }

    #[test]
    fn test_one_edge_per_node_pair() {
        let decls = vec![
            single(0, |m| m.write(r("a"))),
            single(1, |m| m.op(AccessType::Read, r("a")).op(AccessType::Write, r("a"))),
        ];
        let graph = DependencyGraph::build(2, &decls).unwrap();
        let pairs: HashSet<_> = graph.edges().iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(pairs.len(), graph.num_edges());
        assert_eq!(graph.num_edges(), 2);
    }

    #[test]
    fn test_rejects_bad_declarations() {
        let err = DependencyGraph::build(2, &[single(0, |m| m.read(r("a")))]).unwrap_err();
        assert_eq!(err, SchedulerError::DeclarationCount { txns: 2, declared: 1 });

        let err = DependencyGraph::build(1, &[TxnAccessOps::new(vec![vec![]])]).unwrap_err();
        assert_eq!(err, SchedulerError::MissingDeclaration { txn_idx: 0, msg_idx: 0 });

        let err = DependencyGraph::build(1, &[TxnAccessOps::default()]).unwrap_err();
        assert!(err.is_declaration_error());

        let misplaced = TxnAccessOps::new(vec![vec![AccessOperation::new(
            AccessType::Write,
            r("a"),
            5,
            0,
        )]]);
        let err = DependencyGraph::build(1, &[misplaced]).unwrap_err();
        assert!(matches!(err, SchedulerError::MalformedDeclaration { txn_idx: 0, .. }));
    }

    #[test]
    fn test_signal_plan_matches_edges() {
        let decls = vec![
            single(0, |m| m.write(r("a"))),
            single(1, |m| m.read(r("a"))),
            single(2, |m| m.read(r("a"))),
        ];
        let graph = DependencyGraph::build(3, &decls).unwrap();
        let plan = graph.signal_plan();
        assert_eq!(plan.take_guard(0).map(|g| g.len()), Some(2));
        assert_eq!(plan.take_receivers(1).map(|r| r.len()), Some(1));
        assert_eq!(plan.take_receivers(0).map(|r| r.len()), Some(0));
    }
}
