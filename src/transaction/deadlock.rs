//! Wait-for graph construction and cycle resolution.
//!
//! Victim policy: inside a cycle the transaction holding the fewest locks is
//! aborted; ties go to the youngest transaction (highest id). A cycle that
//! already contains a transaction marked for abort is left alone, that abort
//! is enough to break it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, info};

use crate::transaction::lock_manager::{BlockingEdge, LockManager};
use crate::transaction::{Transaction, TransactionId};

#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    edges: BTreeMap<TransactionId, BTreeSet<TransactionId>>,
}

impl WaitForGraph {
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = &'a BlockingEdge>) -> Self {
        let mut graph = Self::default();
        for edge in edges {
            graph.add_edge(edge.requestor, edge.blocker);
        }
        graph
    }

    pub fn add_edge(&mut self, from: TransactionId, to: TransactionId) {
        if from != to {
            self.edges.entry(from).or_default().insert(to);
        }
    }

    pub fn remove_node(&mut self, txn: TransactionId) {
        self.edges.remove(&txn);
        for targets in self.edges.values_mut() {
            targets.remove(&txn);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// First cycle reachable from a blocked transaction, in DFS order.
    pub fn find_cycle(&self) -> Option<Vec<TransactionId>> {
        let mut finished = BTreeSet::new();
        for &start in self.edges.keys() {
            if finished.contains(&start) {
                continue;
            }
            if let Some(cycle) = self.search(start, &mut finished) {
                return Some(cycle);
            }
        }
        None
    }

    fn search(
        &self,
        start: TransactionId,
        finished: &mut BTreeSet<TransactionId>,
    ) -> Option<Vec<TransactionId>> {
        let empty = BTreeSet::new();
        let mut path: Vec<TransactionId> = vec![start];
        let mut iters = vec![self.edges.get(&start).unwrap_or(&empty).iter()];
        while let Some(iter) = iters.last_mut() {
            match iter.next() {
                Some(&next) => {
                    if let Some(pos) = path.iter().position(|&txn| txn == next) {
                        return Some(path[pos..].to_vec());
                    }
                    if finished.contains(&next) {
                        continue;
                    }
                    path.push(next);
                    iters.push(self.edges.get(&next).unwrap_or(&empty).iter());
                }
                None => {
                    iters.pop();
                    if let Some(done) = path.pop() {
                        finished.insert(done);
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockReport {
    pub cycle: Vec<TransactionId>,
    pub victim: TransactionId,
}

#[derive(Debug)]
pub struct DeadlockDetector {
    lock_manager: Arc<LockManager>,
}

impl DeadlockDetector {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self { lock_manager }
    }

    /// Snapshots each transaction's blocking edges (one guard at a time),
    /// breaks every cycle found and returns what was done. Victims are only
    /// flagged and woken; they roll back on their own thread.
    pub fn detect(&self, transactions: &[Arc<Transaction>]) -> Vec<DeadlockReport> {
        let by_id: HashMap<TransactionId, &Arc<Transaction>> =
            transactions.iter().map(|txn| (txn.id(), txn)).collect();
        let edges: Vec<BlockingEdge> = transactions
            .iter()
            .flat_map(|txn| txn.blocking_edges())
            .collect();
        if edges.is_empty() {
            return Vec::new();
        }
        let mut graph = WaitForGraph::from_edges(&edges);
        let mut reports = Vec::new();

        while let Some(cycle) = graph.find_cycle() {
            let resolved = cycle.iter().copied().find(|id| {
                by_id
                    .get(id)
                    .map_or(true, |txn| txn.is_abort_requested() || !txn.is_running())
            });
            if let Some(id) = resolved {
                debug!("cycle {:?} already resolving through txn {}", cycle, id);
                graph.remove_node(id);
                continue;
            }
            let Some(victim) = choose_victim(&cycle, &by_id) else {
                break;
            };
            if let Some(txn) = by_id.get(&victim) {
                txn.request_abort();
                for edge in txn.blocking_edges() {
                    self.lock_manager.wake(&edge.object);
                }
            }
            info!("deadlock among {:?}, aborting txn {}", cycle, victim);
            graph.remove_node(victim);
            reports.push(DeadlockReport { cycle, victim });
        }
        reports
    }
}

fn choose_victim(
    cycle: &[TransactionId],
    transactions: &HashMap<TransactionId, &Arc<Transaction>>,
) -> Option<TransactionId> {
    cycle
        .iter()
        .filter_map(|id| transactions.get(id).map(|txn| (txn.held_lock_count(), *id)))
        .min_by(|(locks_a, id_a), (locks_b, id_b)| locks_a.cmp(locks_b).then(id_b.cmp(id_a)))
        .map(|(_, id)| id)
}
