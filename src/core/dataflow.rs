// This module implements a generic worklist dataflow analysis over the
// control skeleton of a behavior graph. Analyses plug in via the FlowAnalysis
// trait (direction, initial value, meet, transfer); the driver iterates to a
// fixed point. Branch-end nodes flow into their merge through the ordinary
// successor edge, so no special casing is needed at joins. The allocation
// pass's backward may-liveness runs on this framework.

use crate::core::graph::{BehaviorGraph, NodeId};
use hashbrown::HashMap;
use std::collections::VecDeque;

/// Direction of a dataflow analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A dataflow analysis in the kill/gen style.
pub trait FlowAnalysis {
    type Value: Clone + PartialEq;

    fn direction(&self) -> Direction;

    /// Value attached to every node before iteration begins.
    fn initial(&self) -> Self::Value;

    /// Combine the values flowing in from multiple paths.
    fn meet(&self, values: &[&Self::Value]) -> Self::Value;

    /// Apply the node's kill/gen effects. For a backward analysis the input
    /// is the node's OUT value and the result its IN value.
    fn transfer(&self, graph: &BehaviorGraph, node: NodeId, input: &Self::Value) -> Self::Value;
}

/// IN and OUT values per control node after a fixed point was reached.
pub struct FlowResult<V> {
    ins: HashMap<NodeId, V>,
    outs: HashMap<NodeId, V>,
}

impl<V> FlowResult<V> {
    pub fn value_in(&self, node: NodeId) -> &V {
        &self.ins[&node]
    }

    pub fn value_out(&self, node: NodeId) -> &V {
        &self.outs[&node]
    }
}

/// Run `analysis` over the control skeleton of `graph` to a fixed point.
pub fn analyze<A: FlowAnalysis>(analysis: &A, graph: &BehaviorGraph) -> FlowResult<A::Value> {
    let nodes: Vec<NodeId> = graph
        .ids()
        .filter(|&id| graph.node(id).is_control())
        .collect();

    let mut ins: HashMap<NodeId, A::Value> = HashMap::new();
    let mut outs: HashMap<NodeId, A::Value> = HashMap::new();
    for &n in &nodes {
        ins.insert(n, analysis.initial());
        outs.insert(n, analysis.initial());
    }

    let mut worklist: VecDeque<NodeId> = nodes.iter().copied().collect();
    while let Some(node) = worklist.pop_front() {
        let (new_in, new_out, neighbors) = match analysis.direction() {
            Direction::Forward => {
                let preds = graph.control_preds(node);
                let incoming: Vec<&A::Value> = preds.iter().map(|p| &outs[p]).collect();
                let in_value = analysis.meet(&incoming);
                let out_value = analysis.transfer(graph, node, &in_value);
                (in_value, out_value, graph.control_succs(node))
            }
            Direction::Backward => {
                let succs = graph.control_succs(node);
                let outgoing: Vec<&A::Value> = succs.iter().map(|s| &ins[s]).collect();
                let out_value = analysis.meet(&outgoing);
                let in_value = analysis.transfer(graph, node, &out_value);
                (in_value, out_value, graph.control_preds(node))
            }
        };

        let changed = ins[&node] != new_in || outs[&node] != new_out;
        ins.insert(node, new_in);
        outs.insert(node, new_out);
        if changed {
            worklist.extend(neighbors);
        }
    }

    FlowResult { ins, outs }
}
