// This module converts generic memory read/write nodes into word-size-aware
// load/store nodes for the downstream emitter. A read whose only consumer is
// a conversion starting at the load's natural width folds the conversion's
// extend mode directly into the load; a store whose value is a truncating
// conversion that preserves at least the stored width reads the
// pre-truncation value directly.

use crate::core::error::LowerResult;
use crate::core::graph::{BehaviorGraph, Model, NodeId};
use crate::core::node::{Extend, Node, NodeKind};
use crate::core::session::LoweringSession;
use crate::passes::{Pass, PassResults};
use log::debug;

pub const NAME: &str = "memory-access";

/// Fuses adjacent conversions into memory accesses.
pub struct MemoryAccessPass;

impl Pass for MemoryAccessPass {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(
        &mut self,
        model: &mut Model,
        _session: &LoweringSession,
        _results: &mut PassResults,
    ) -> LowerResult<()> {
        let mut fused = 0;
        for instr in &mut model.instructions {
            fused += transform_graph(&mut instr.graph);
        }
        debug!("memory transformation fused {} conversions", fused);
        Ok(())
    }
}

fn transform_graph(graph: &mut BehaviorGraph) -> usize {
    let mut fused = 0;

    let reads: Vec<NodeId> = graph
        .ids()
        .filter(|&id| matches!(graph.node(id).kind, NodeKind::ReadMem { .. }))
        .collect();
    for read in reads {
        fused += lower_read(graph, read);
    }

    let writes: Vec<NodeId> = graph
        .ids()
        .filter(|&id| matches!(graph.node(id).kind, NodeKind::WriteMem { .. }))
        .collect();
    for write in writes {
        fused += lower_write(graph, write);
    }

    graph.delete_unused_dependencies();
    fused
}

fn lower_read(graph: &mut BehaviorGraph, read: NodeId) -> usize {
    let (mem, addr, width) = match graph.node(read).kind {
        NodeKind::ReadMem { mem, addr } => (mem, addr, graph.node(read).width),
        _ => unreachable!(),
    };

    // a single consuming conversion over the natural width folds into the load
    let users: Vec<NodeId> = graph.users(read).to_vec();
    let fusable = match users.as_slice() {
        [only] => match graph.node(*only).kind {
            NodeKind::Extract {
                mode, from_width, ..
            } if from_width == width => Some((*only, mode)),
            _ => None,
        },
        _ => None,
    };

    match fusable {
        Some((conversion, mode)) => {
            let load = graph.add(Node::dep(NodeKind::Load { mem, addr, mode }, width, false));
            graph.replace_and_delete(conversion, load);
            graph.delete(read);
            1
        }
        None => {
            let load = graph.add(Node::dep(
                NodeKind::Load {
                    mem,
                    addr,
                    mode: Extend::Zero,
                },
                width,
                false,
            ));
            graph.replace_and_delete(read, load);
            0
        }
    }
}

fn lower_write(graph: &mut BehaviorGraph, write: NodeId) -> usize {
    let (mem, addr, value, width) = match graph.node(write).kind {
        NodeKind::WriteMem { mem, addr, value } => (mem, addr, value, graph.node(write).width),
        _ => unreachable!(),
    };

    // a truncation that keeps at least the stored bits is irrelevant here
    let (stored, fused) = match graph.node(value).kind {
        NodeKind::Extract {
            value: base,
            mode: Extend::Zero,
            from_width,
            to_width,
        } if from_width.min(to_width) >= width => (base, 1),
        _ => (value, 0),
    };

    let store = graph.add(Node::dep(
        NodeKind::Store {
            mem,
            addr,
            value: stored,
        },
        width,
        false,
    ));
    graph.replace_and_delete(write, store);
    fused
}
