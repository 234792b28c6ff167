// This module implements width normalization. The downstream code generator
// operates on 32- or 64-bit variables only, while instruction behaviors may
// compute on arbitrary narrower widths; computing narrow arithmetic naively at
// target width produces wrong results. The normalizer therefore visits every
// expression once, inputs before users, and inserts conversion (Extract) nodes
// per operator: truncating results back to their declared width, sign-
// extending operands of signed operators, normalizing shift amounts, and
// synthesizing rotate and leading-bit-count operators that have no direct
// target primitive. A follow-up pass merges the inserted conversion chains.

use crate::core::error::{LowerError, LowerResult};
use crate::core::graph::{BehaviorGraph, Model, NodeId};
use crate::core::node::{Extend, Node, NodeKind, Op};
use crate::core::session::LoweringSession;
use crate::passes::{Pass, PassResults};
use log::debug;

pub const NAME: &str = "width-normalize";

/// Inserts conversion nodes so every operation is well-defined at target
/// width while preserving its declared narrower semantics.
pub struct NormalizePass;

impl Pass for NormalizePass {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(
        &mut self,
        model: &mut Model,
        session: &LoweringSession,
        _results: &mut PassResults,
    ) -> LowerResult<()> {
        let target = session.config().width();
        let mut inserted = 0;
        for instr in &mut model.instructions {
            let before = instr.graph.node_count();
            Normalizer::new(&mut instr.graph, target, &instr.name).run()?;
            inserted += instr.graph.node_count().saturating_sub(before);
        }
        session.update_stats(|s| s.nodes_inserted += inserted);
        debug!("normalization inserted {} conversion nodes", inserted);
        Ok(())
    }
}

/// Smallest width that can represent `value`.
fn min_width_for(value: u64) -> u8 {
    (64 - value.leading_zeros()).max(1) as u8
}

/// Whether an amount of `amount_width` bits can reach or exceed `width`.
pub(crate) fn amount_can_reach(width: u8, amount_width: u8) -> bool {
    amount_width >= 64 || (1u64 << amount_width) > width as u64
}

struct Normalizer<'g> {
    graph: &'g mut BehaviorGraph,
    target: u8,
    instr: &'g str,
    handled: hashbrown::HashSet<NodeId>,
}

impl<'g> Normalizer<'g> {
    fn new(graph: &'g mut BehaviorGraph, target: u8, instr: &'g str) -> Self {
        Normalizer {
            graph,
            target,
            instr,
            handled: hashbrown::HashSet::new(),
        }
    }

    fn run(&mut self) -> LowerResult<()> {
        // root expressions: those no other expression consumes
        let roots: Vec<NodeId> = self
            .graph
            .ids()
            .filter(|&id| self.graph.node(id).is_expression())
            .filter(|&id| {
                self.graph
                    .users(id)
                    .iter()
                    .all(|&u| !self.graph.node(u).is_expression())
            })
            .collect();
        for root in roots {
            if self.graph.is_live(root) {
                self.normalize(root)?;
            }
        }
        Ok(())
    }

    fn normalize(&mut self, node: NodeId) -> LowerResult<()> {
        if self.handled.contains(&node) {
            return Ok(());
        }
        self.normalize_inputs(node)?;
        self.dispatch(node)?;
        self.handled.insert(node);
        Ok(())
    }

    fn normalize_inputs(&mut self, node: NodeId) -> LowerResult<()> {
        for input in self.graph.node(node).value_inputs() {
            self.normalize(input)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, node: NodeId) -> LowerResult<()> {
        match self.graph.node(node).kind.clone() {
            // leaves and nodes that need no adaptation
            NodeKind::Const { .. }
            | NodeKind::ReadReg { .. }
            | NodeKind::ReadRegFile { .. }
            | NodeKind::ReadMem { .. }
            | NodeKind::StaticPc
            | NodeKind::Select { .. } => Ok(()),

            // upstream conversions are already in uniform extract form
            NodeKind::Extract { .. } => Ok(()),

            NodeKind::BuiltIn { op, .. } => self.dispatch_op(node, op),

            // nodes that should not exist before later passes ran
            NodeKind::FieldExtract { .. } | NodeKind::Load { .. } | NodeKind::Store { .. } => {
                Err(LowerError::invariant(
                    self.instr,
                    format!("node {} must not exist before width normalization", node),
                ))
            }

            // side effects and control nodes are never dispatched as expressions
            NodeKind::WriteReg { .. }
            | NodeKind::WriteRegFile { .. }
            | NodeKind::WriteMem { .. }
            | NodeKind::Start
            | NodeKind::If { .. }
            | NodeKind::BranchBegin
            | NodeKind::BranchEnd
            | NodeKind::Merge
            | NodeKind::Scheduled { .. }
            | NodeKind::Exit { .. }
            | NodeKind::End
            | NodeKind::GetVar { .. }
            | NodeKind::FreeVar { .. } => Err(LowerError::invariant(
                self.instr,
                format!("{} reached expression normalization", node),
            )),
        }
    }

    fn dispatch_op(&mut self, node: NodeId, op: Op) -> LowerResult<()> {
        match op {
            Op::Add | Op::Sub | Op::Mul | Op::UMul => {
                self.truncate_result(node);
                Ok(())
            }
            Op::Neg => {
                self.sign_extend_arg(node, 0);
                self.truncate_result(node);
                Ok(())
            }
            Op::SMul | Op::SDiv | Op::SMod => {
                self.sign_extend_all_args(node);
                self.truncate_result(node);
                Ok(())
            }
            Op::UDiv | Op::UMod => Ok(()),
            Op::Not | Op::And | Op::Or | Op::Xor => {
                self.truncate_result(node);
                Ok(())
            }
            Op::Eq | Op::Ne | Op::Ult | Op::Ule | Op::Ugt | Op::Uge => Ok(()),
            Op::Slt | Op::Sle | Op::Sgt | Op::Sge => {
                self.sign_extend_all_args(node);
                Ok(())
            }
            Op::Lsl => {
                self.normalize_shift_amount(node);
                self.truncate_result(node);
                Ok(())
            }
            Op::Lsr => {
                // result is a subset of the zero-filled operand
                self.normalize_shift_amount(node);
                Ok(())
            }
            Op::Asr => {
                self.normalize_shift_amount(node);
                self.sign_extend_arg(node, 0);
                self.truncate_result(node);
                Ok(())
            }
            Op::Rol | Op::Ror => self.synthesize_rotate(node, op),
            Op::Clz => self.adjust_clz(node),
            Op::Cls => self.synthesize_cls(node),
        }
    }

    // --- conversion helpers ---

    fn width_of(&self, node: NodeId) -> u8 {
        self.graph.node(node).width
    }

    fn args_of(&self, call: NodeId) -> Vec<NodeId> {
        match &self.graph.node(call).kind {
            NodeKind::BuiltIn { args, .. } => args.clone(),
            other => panic!("expected operator node, got {:?}", other),
        }
    }

    fn extract(&mut self, value: NodeId, mode: Extend, from: u8, to: u8, declared: u8) -> NodeId {
        let id = self.graph.add(Node::dep(
            NodeKind::Extract {
                value,
                mode,
                from_width: from,
                to_width: to,
            },
            declared,
            mode == Extend::Sign,
        ));
        self.handled.insert(id);
        id
    }

    fn konst(&mut self, value: u64, width: u8) -> NodeId {
        let id = self
            .graph
            .add(Node::dep(NodeKind::Const { value }, width, false));
        self.handled.insert(id);
        id
    }

    fn builtin(&mut self, op: Op, width: u8, args: Vec<NodeId>) -> NodeId {
        let id = self
            .graph
            .add(Node::dep(NodeKind::BuiltIn { op, args }, width, false));
        self.handled.insert(id);
        id
    }

    /// Truncate the node's result back to its declared width; all existing
    /// users observe the truncated value.
    fn truncate_result(&mut self, node: NodeId) {
        let width = self.width_of(node);
        let target = self.target;
        let ext = self.extract(node, Extend::Zero, width, target, width);
        self.graph.replace_all_usages(node, ext);
    }

    /// Sign-extend operand `i` of an operator up to target width.
    fn sign_extend_arg(&mut self, call: NodeId, i: usize) {
        let arg = self.args_of(call)[i];
        let from = self.width_of(arg);
        let target = self.target;
        let ext = self.extract(arg, Extend::Sign, from, target, from);
        self.graph.set_builtin_arg(call, i, ext);
    }

    fn sign_extend_all_args(&mut self, call: NodeId) {
        for i in 0..self.args_of(call).len() {
            self.sign_extend_arg(call, i);
        }
    }

    /// Reduce the shift amount modulo the operand width whenever the amount
    /// could reach it: a bitwise AND for power-of-two widths, an unsigned
    /// modulo otherwise.
    fn normalize_shift_amount(&mut self, call: NodeId) {
        let args = self.args_of(call);
        let value_width = self.width_of(args[0]);
        let amount = args[1];
        let amount_width = self.width_of(amount);
        if !amount_can_reach(value_width, amount_width) {
            return;
        }
        let normalized = if value_width.is_power_of_two() {
            let mask = self.konst(value_width as u64 - 1, amount_width);
            self.builtin(Op::And, amount_width, vec![amount, mask])
        } else {
            let modulus = self.konst(value_width as u64, amount_width);
            self.builtin(Op::UMod, amount_width, vec![amount, modulus])
        };
        self.graph.set_builtin_arg(call, 1, normalized);
    }

    /// Rotates have no target primitive: expand into two opposing shifts
    /// joined by OR, truncated to the rotated width.
    fn synthesize_rotate(&mut self, node: NodeId, op: Op) -> LowerResult<()> {
        self.normalize_shift_amount(node);
        let args = self.args_of(node);
        let (value, amount) = (args[0], args[1]);
        let n = self.width_of(value);

        let span_width = min_width_for(n as u64).max(self.width_of(amount));
        let span = self.konst(n as u64, span_width);
        let counter = self.builtin(Op::Sub, span_width, vec![span, amount]);

        let (left_amount, right_amount) = match op {
            Op::Rol => (amount, counter),
            Op::Ror => (counter, amount),
            _ => unreachable!("not a rotate"),
        };
        let left = self.builtin(Op::Lsl, n, vec![value, left_amount]);
        let right = self.builtin(Op::Lsr, n, vec![value, right_amount]);
        let joined = self.builtin(Op::Or, n, vec![left, right]);
        let target = self.target;
        let truncated = self.extract(joined, Extend::Zero, n, target, n);

        self.graph.replace_and_delete(node, truncated);
        Ok(())
    }

    /// A count-leading-zeros at target width overreports by the guaranteed
    /// zero bits above the narrow field; subtract them.
    fn adjust_clz(&mut self, node: NodeId) -> LowerResult<()> {
        let value = self.args_of(node)[0];
        let n = self.width_of(value);
        if n == self.target {
            return Ok(());
        }
        let width = self.width_of(node);
        let correction = self.konst((self.target - n) as u64, 8);
        let adjusted = self.builtin(Op::Sub, width, vec![node, correction]);
        self.graph.replace_all_usages(node, adjusted);
        Ok(())
    }

    /// Count-leading-sign-bits has no target primitive: count leading zeros
    /// of the conditionally inverted value and correct for the guaranteed
    /// zeros plus the sign bit itself.
    fn synthesize_cls(&mut self, node: NodeId) -> LowerResult<()> {
        let value = self.args_of(node)[0];
        let n = self.width_of(value);
        let width = self.width_of(node);
        let target = self.target;

        let top_shift = self.konst(n as u64 - 1, min_width_for(n as u64 - 1));
        let sign = self.builtin(Op::Lsr, 1, vec![value, top_shift]);
        let inverted = self.builtin(Op::Not, n, vec![value]);
        let inverted_clean = self.extract(inverted, Extend::Zero, n, target, n);
        let adjusted_value = self.graph.add(Node::dep(
            NodeKind::Select {
                cond: sign,
                on_true: inverted_clean,
                on_false: value,
            },
            n,
            false,
        ));
        self.handled.insert(adjusted_value);

        let count = self.builtin(Op::Clz, width, vec![adjusted_value]);
        let correction = self.konst((target - n) as u64 + 1, 8);
        let result = self.builtin(Op::Sub, width, vec![count, correction]);

        self.graph.replace_and_delete(node, result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::GraphBuilder;
    use crate::core::node::RegId;

    fn normalize(graph: &mut BehaviorGraph) {
        Normalizer::new(graph, 64, "test").run().expect("normalizes");
    }

    fn find_extract_over(graph: &BehaviorGraph, base: NodeId) -> Option<NodeId> {
        graph.ids().find(|&id| {
            matches!(graph.node(id).kind, NodeKind::Extract { value, .. } if value == base)
        })
    }

    #[test]
    fn test_add_result_is_truncated() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 8);
        let y = b.read_reg(RegId(2), 8);
        let sum = b.binary(Op::Add, 8, x, y);
        b.write_reg(RegId(3), sum);
        let mut graph = b.finish();
        normalize(&mut graph);

        let trunc = find_extract_over(&graph, sum).expect("truncation inserted");
        match graph.node(trunc).kind {
            NodeKind::Extract {
                mode,
                from_width,
                to_width,
                ..
            } => {
                assert_eq!(mode, Extend::Zero);
                assert_eq!(from_width, 8);
                assert_eq!(to_width, 64);
            }
            _ => unreachable!(),
        }
        // the write consumes the truncated value, not the raw sum
        let write = graph
            .ids()
            .find(|&id| matches!(graph.node(id).kind, NodeKind::WriteReg { .. }))
            .unwrap();
        assert_eq!(graph.node(write).value_inputs(), vec![trunc]);
    }

    #[test]
    fn test_signed_compare_extends_both_operands() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 16);
        let y = b.read_reg(RegId(2), 16);
        let lt = b.binary(Op::Slt, 1, x, y);
        b.write_reg(RegId(3), lt);
        let mut graph = b.finish();
        normalize(&mut graph);

        let args = match &graph.node(lt).kind {
            NodeKind::BuiltIn { args, .. } => args.clone(),
            _ => unreachable!(),
        };
        for arg in args {
            match graph.node(arg).kind {
                NodeKind::Extract {
                    mode, from_width, ..
                } => {
                    assert_eq!(mode, Extend::Sign);
                    assert_eq!(from_width, 16);
                }
                other => panic!("operand not sign-extended: {:?}", other),
            }
        }
    }

    #[test]
    fn test_wide_shift_amount_is_masked() {
        let mut b = GraphBuilder::new();
        let v = b.read_reg(RegId(1), 8);
        let amount = b.read_reg(RegId(2), 8);
        let shifted = b.binary(Op::Lsl, 8, v, amount);
        b.write_reg(RegId(3), shifted);
        let mut graph = b.finish();
        normalize(&mut graph);

        let args = match &graph.node(shifted).kind {
            NodeKind::BuiltIn { args, .. } => args.clone(),
            _ => unreachable!(),
        };
        // 8 is a power of two: amount AND 7
        match &graph.node(args[1]).kind {
            NodeKind::BuiltIn { op: Op::And, args } => {
                assert!(matches!(
                    graph.node(args[1]).kind,
                    NodeKind::Const { value: 7 }
                ));
            }
            other => panic!("amount not masked: {:?}", other),
        }
    }

    #[test]
    fn test_narrow_shift_amount_left_alone() {
        let mut b = GraphBuilder::new();
        let v = b.read_reg(RegId(1), 8);
        let amount = b.read_reg(RegId(2), 3);
        let shifted = b.binary(Op::Lsr, 8, v, amount);
        b.write_reg(RegId(3), shifted);
        let mut graph = b.finish();
        normalize(&mut graph);

        let args = match &graph.node(shifted).kind {
            NodeKind::BuiltIn { args, .. } => args.clone(),
            _ => unreachable!(),
        };
        // a 3-bit amount cannot reach 8
        assert_eq!(args[1], amount);
    }

    #[test]
    fn test_rotate_expands_to_shift_or() {
        let mut b = GraphBuilder::new();
        let v = b.read_reg(RegId(1), 8);
        let amount = b.read_reg(RegId(2), 8);
        let rot = b.binary(Op::Rol, 8, v, amount);
        b.write_reg(RegId(3), rot);
        let mut graph = b.finish();
        normalize(&mut graph);

        assert!(!graph.is_live(rot));
        assert!(!graph.ids().any(|id| matches!(
            graph.node(id).kind,
            NodeKind::BuiltIn { op: Op::Rol, .. }
        )));
        // an OR of two opposing shifts remains
        let or = graph
            .ids()
            .find(|&id| matches!(graph.node(id).kind, NodeKind::BuiltIn { op: Op::Or, .. }))
            .expect("rotate joined by or");
        let or_args = match &graph.node(or).kind {
            NodeKind::BuiltIn { args, .. } => args.clone(),
            _ => unreachable!(),
        };
        assert!(matches!(
            graph.node(or_args[0]).kind,
            NodeKind::BuiltIn { op: Op::Lsl, .. }
        ));
        assert!(matches!(
            graph.node(or_args[1]).kind,
            NodeKind::BuiltIn { op: Op::Lsr, .. }
        ));
    }

    #[test]
    fn test_clz_narrow_value_corrected() {
        let mut b = GraphBuilder::new();
        let v = b.read_reg(RegId(1), 8);
        let clz = b.unary(Op::Clz, 8, v);
        b.write_reg(RegId(3), clz);
        let mut graph = b.finish();
        normalize(&mut graph);

        let write = graph
            .ids()
            .find(|&id| matches!(graph.node(id).kind, NodeKind::WriteReg { .. }))
            .unwrap();
        let written = graph.node(write).value_inputs()[0];
        match &graph.node(written).kind {
            NodeKind::BuiltIn { op: Op::Sub, args } => {
                assert_eq!(args[0], clz);
                assert!(matches!(
                    graph.node(args[1]).kind,
                    NodeKind::Const { value: 56 }
                ));
            }
            other => panic!("clz not adjusted: {:?}", other),
        }
    }

    #[test]
    fn test_cls_expands_to_conditional_clz() {
        let mut b = GraphBuilder::new();
        let v = b.read_reg(RegId(1), 8);
        let cls = b.unary(Op::Cls, 8, v);
        b.write_reg(RegId(3), cls);
        let mut graph = b.finish();
        normalize(&mut graph);

        assert!(!graph.is_live(cls));
        let select = graph
            .ids()
            .find(|&id| matches!(graph.node(id).kind, NodeKind::Select { .. }))
            .expect("sign selection present");
        let clz = graph
            .ids()
            .find(|&id| matches!(graph.node(id).kind, NodeKind::BuiltIn { op: Op::Clz, .. }))
            .expect("clz over adjusted value");
        assert_eq!(graph.node(clz).value_inputs(), vec![select]);
        // the final result subtracts guaranteed zeros plus the sign bit
        let write = graph
            .ids()
            .find(|&id| matches!(graph.node(id).kind, NodeKind::WriteReg { .. }))
            .unwrap();
        let written = graph.node(write).value_inputs()[0];
        match &graph.node(written).kind {
            NodeKind::BuiltIn { op: Op::Sub, args } => {
                assert_eq!(args[0], clz);
                assert!(matches!(
                    graph.node(args[1]).kind,
                    NodeKind::Const { value: 57 }
                ));
            }
            other => panic!("cls not rewritten: {:?}", other),
        }
    }
}
