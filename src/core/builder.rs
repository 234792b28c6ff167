// This module provides programmatic construction of valid behavior graphs.
// The upstream front end produces graphs in exactly this shape: a start node,
// a chain of directional nodes with side effects already anchored by
// scheduling markers, optional control splits whose branches converge at a
// merge, optional instruction exits carrying the new-PC write, and a unique
// end node. Tests use the builder as a stand-in for that front end.

use crate::core::graph::{BehaviorGraph, Instruction, NodeId};
use crate::core::node::{Extend, MemId, Node, NodeKind, Op, RegFileId, RegId};

/// Incremental builder for one instruction's behavior graph.
///
/// Expression constructors only add dependency nodes; side-effect
/// constructors additionally anchor the effect in the control order the way
/// the upstream side-effect scheduling leaves it.
pub struct GraphBuilder {
    graph: BehaviorGraph,
    cursor: NodeId,
}

impl GraphBuilder {
    pub fn new() -> Self {
        let mut graph = BehaviorGraph::new();
        let start = graph.add(Node::control(NodeKind::Start));
        GraphBuilder {
            graph,
            cursor: start,
        }
    }

    fn append(&mut self, node: Node) -> NodeId {
        let id = self.graph.add(node);
        self.graph.set_succ(self.cursor, Some(id));
        self.cursor = id;
        id
    }

    // --- expressions ---

    pub fn konst(&mut self, value: u64, width: u8) -> NodeId {
        self.graph
            .add(Node::dep(NodeKind::Const { value }, width, false))
    }

    pub fn read_reg(&mut self, reg: RegId, width: u8) -> NodeId {
        self.graph
            .add(Node::dep(NodeKind::ReadReg { reg }, width, false))
    }

    pub fn read_reg_file(&mut self, file: RegFileId, index: NodeId, width: u8) -> NodeId {
        self.graph
            .add(Node::dep(NodeKind::ReadRegFile { file, index }, width, false))
    }

    pub fn read_mem(&mut self, mem: MemId, addr: NodeId, width: u8) -> NodeId {
        self.graph
            .add(Node::dep(NodeKind::ReadMem { mem, addr }, width, false))
    }

    pub fn op(&mut self, op: Op, width: u8, args: Vec<NodeId>) -> NodeId {
        self.graph
            .add(Node::dep(NodeKind::BuiltIn { op, args }, width, false))
    }

    pub fn unary(&mut self, op: Op, width: u8, a: NodeId) -> NodeId {
        self.op(op, width, vec![a])
    }

    pub fn binary(&mut self, op: Op, width: u8, a: NodeId, b: NodeId) -> NodeId {
        self.op(op, width, vec![a, b])
    }

    pub fn select(&mut self, cond: NodeId, on_true: NodeId, on_false: NodeId, width: u8) -> NodeId {
        self.graph.add(Node::dep(
            NodeKind::Select {
                cond,
                on_true,
                on_false,
            },
            width,
            false,
        ))
    }

    /// Conversion node; `width` is the declared semantic width of the result.
    pub fn extract(
        &mut self,
        value: NodeId,
        mode: Extend,
        from_width: u8,
        to_width: u8,
        width: u8,
    ) -> NodeId {
        self.graph.add(Node::dep(
            NodeKind::Extract {
                value,
                mode,
                from_width,
                to_width,
            },
            width,
            mode == Extend::Sign,
        ))
    }

    /// Sign- or zero-extension from the value's declared width up to `to`.
    pub fn extend(&mut self, value: NodeId, mode: Extend, to: u8) -> NodeId {
        let from = self.graph.node(value).width;
        self.extract(value, mode, from, to, to)
    }

    /// Truncation down to `to` bits.
    pub fn truncate(&mut self, value: NodeId, to: u8) -> NodeId {
        let from = self.graph.node(value).width;
        self.extract(value, Extend::Zero, from, to, to)
    }

    // --- scheduled side effects ---

    /// Append a scheduling marker for `dep` at the current position.
    pub fn schedule(&mut self, dep: NodeId) -> NodeId {
        self.append(Node::control(NodeKind::Scheduled { dep }))
    }

    /// Register write, anchored at the current position.
    pub fn write_reg(&mut self, reg: RegId, value: NodeId) -> NodeId {
        let width = self.graph.node(value).width;
        let write = self
            .graph
            .add(Node::dep(NodeKind::WriteReg { reg, value }, width, false));
        self.schedule(write);
        write
    }

    /// Register-file write, anchored at the current position.
    pub fn write_reg_file(&mut self, file: RegFileId, index: NodeId, value: NodeId) -> NodeId {
        let width = self.graph.node(value).width;
        let write = self.graph.add(Node::dep(
            NodeKind::WriteRegFile { file, index, value },
            width,
            false,
        ));
        self.schedule(write);
        write
    }

    /// Memory write of `width` bits, anchored at the current position.
    pub fn write_mem(&mut self, mem: MemId, addr: NodeId, value: NodeId, width: u8) -> NodeId {
        let write = self.graph.add(Node::dep(
            NodeKind::WriteMem { mem, addr, value },
            width,
            false,
        ));
        self.schedule(write);
        write
    }

    // --- control flow ---

    /// Conditional with both branches converging at a fresh merge node.
    pub fn if_else(
        &mut self,
        cond: NodeId,
        then_f: impl FnOnce(&mut Self),
        else_f: impl FnOnce(&mut Self),
    ) {
        let then_begin = self.graph.add(Node::control(NodeKind::BranchBegin));
        let else_begin = self.graph.add(Node::control(NodeKind::BranchBegin));
        let split = self.graph.add(Node::control(NodeKind::If {
            condition: cond,
            then_begin,
            else_begin,
        }));
        self.graph.set_succ(self.cursor, Some(split));

        self.cursor = then_begin;
        then_f(self);
        let then_end = self.append(Node::control(NodeKind::BranchEnd));

        self.cursor = else_begin;
        else_f(self);
        let else_end = self.append(Node::control(NodeKind::BranchEnd));

        let merge = self.graph.add(Node::control(NodeKind::Merge));
        self.graph.set_succ(then_end, Some(merge));
        self.graph.set_succ(else_end, Some(merge));
        self.cursor = merge;
    }

    /// Instruction exit: a PC write wrapped in an exit node. The write is not
    /// scheduled here; the PC access converter decides whether it must be.
    pub fn exit_pc(&mut self, pc: RegId, target: NodeId) -> NodeId {
        let width = self.graph.node(target).width;
        let write = self.graph.add(Node::dep(
            NodeKind::WriteReg {
                reg: pc,
                value: target,
            },
            width,
            false,
        ));
        self.append(Node::control(NodeKind::Exit { pc_write: write }));
        write
    }

    /// Close the skeleton with the unique end node and return the graph.
    pub fn finish(mut self) -> BehaviorGraph {
        self.append(Node::control(NodeKind::End));
        self.graph
    }

    pub fn finish_instruction(self, name: &str) -> Instruction {
        Instruction {
            name: name.to_string(),
            graph: self.finish(),
        }
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line_graph_verifies() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 32);
        let y = b.konst(1, 32);
        let sum = b.binary(Op::Add, 32, x, y);
        b.write_reg(RegId(2), sum);
        let graph = b.finish();
        graph.verify("straight").expect("valid graph");
    }

    #[test]
    fn test_branching_graph_verifies() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 32);
        let zero = b.konst(0, 32);
        let cond = b.binary(Op::Eq, 1, x, zero);
        let one = b.konst(1, 32);
        b.if_else(
            cond,
            |b| {
                b.write_reg(RegId(2), one);
            },
            |_| {},
        );
        let graph = b.finish();
        graph.verify("branching").expect("valid graph");
    }
}
