// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Read/write dependency graph of a transaction's queued operations
//!
//! Nodes are queued operations; an edge A -> B means A writes a range that B
//! reads. An operation whose addition would close a cycle is rejected rather
//! than reordered.

use petgraph::algo::{is_cyclic_directed, kosaraju_scc};
use petgraph::graph::{Graph, NodeIndex};

use super::state::TxOperation;
use crate::range::RangeRef;

#[derive(Clone)]
struct Node {
    /// Position in the transaction's operation list
    position: usize,
    reads: Vec<RangeRef>,
    writes: Vec<RangeRef>,
}

#[derive(Default)]
pub struct DependencyGraph {
    graph: Graph<Node, RangeRef>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Add `op` as the operation at `position`. On a cycle the graph is left
    /// unchanged and the error names the operations on the cycle.
    pub fn try_add(&mut self, position: usize, op: &TxOperation) -> Result<(), String> {
        self.graph = self.with_op(position, op)?;
        Ok(())
    }

    /// Whether `op` could be added without closing a cycle
    pub fn check(&self, position: usize, op: &TxOperation) -> Result<(), String> {
        self.with_op(position, op).map(|_| ())
    }

    fn with_op(&self, position: usize, op: &TxOperation) -> Result<Graph<Node, RangeRef>, String> {
        let mut candidate = self.graph.clone();
        let reads = op.reads();
        let writes = op.writes();
        let new = candidate.add_node(Node {
            position,
            reads: reads.clone(),
            writes: writes.clone(),
        });

        let existing: Vec<NodeIndex> = candidate.node_indices().filter(|&i| i != new).collect();
        for other in existing {
            let node = &candidate[other];
            let forward = overlap(&writes, &node.reads);
            let backward = overlap(&node.writes, &reads);
            if let Some(range) = forward {
                candidate.add_edge(new, other, range);
            }
            if let Some(range) = backward {
                candidate.add_edge(other, new, range);
            }
        }

        if is_cyclic_directed(&candidate) {
            let cycle = kosaraju_scc(&candidate)
                .into_iter()
                .find(|component| component.len() > 1 && component.contains(&new))
                .unwrap_or_else(|| vec![new]);
            let mut positions: Vec<usize> = cycle.iter().map(|&i| candidate[i].position).collect();
            positions.sort_unstable();
            let listed: Vec<String> = positions.iter().map(|p| format!("#{}", p)).collect();
            return Err(format!(
                "operations {} read ranges each other writes",
                listed.join(", ")
            ));
        }

        Ok(candidate)
    }
}

fn overlap(writes: &[RangeRef], reads: &[RangeRef]) -> Option<RangeRef> {
    writes
        .iter()
        .find_map(|w| reads.iter().find(|r| w.overlaps(r)).map(|_| w.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchOp;
    use crate::conflict::Fingerprint;
    use crate::values::grid;

    fn r(s: &str) -> RangeRef {
        s.parse().unwrap()
    }

    fn copy(source: &str, destination: &str) -> TxOperation {
        TxOperation::new(BatchOp::CopyRange {
            source: r(source),
            destination: r(destination),
        })
    }

    #[test]
    fn test_read_after_write_is_allowed() {
        let mut graph = DependencyGraph::new();
        graph
            .try_add(
                0,
                &TxOperation::new(BatchOp::Update {
                    range: r("A1:A10"),
                    values: grid(vec![vec!["1"]]),
                }),
            )
            .unwrap();
        graph
            .try_add(1, &TxOperation::new(BatchOp::Read { range: r("A5") }))
            .unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_mutual_copy_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.try_add(0, &copy("A1:A5", "B1:B5")).unwrap();
        let err = graph.try_add(1, &copy("B2", "A2")).unwrap_err();
        assert!(err.contains("#0, #1"), "{}", err);
        // Rejected op leaves the graph untouched
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_longer_cycle_detected() {
        let mut graph = DependencyGraph::new();
        graph.try_add(0, &copy("A1", "B1")).unwrap();
        graph.try_add(1, &copy("B1", "C1")).unwrap();
        assert!(graph.try_add(2, &copy("C1", "A1")).is_err());
        assert!(graph.try_add(2, &copy("C1", "D1")).is_ok());
    }

    #[test]
    fn test_guarded_writes_to_same_range_conflict() {
        let mut graph = DependencyGraph::new();
        let write = |v: &str| {
            TxOperation::guarded(
                BatchOp::Update {
                    range: r("A1"),
                    values: grid(vec![vec![v]]),
                },
                Fingerprint::of(&Vec::new()),
                None,
            )
        };
        graph.try_add(0, &write("1")).unwrap();
        assert!(graph.try_add(1, &write("2")).is_err());
    }
}
