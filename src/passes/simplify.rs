// This module does local operator simplifications after normalization and
// chain folding. Two rewrites: (1) an operand truncation whose preserved
// width already covers a bit-local operator's declared width is redundant and
// the operator reads the base value directly; (2) a logical or arithmetic
// right shift by a translation-time-fixed amount becomes a direct bit-field
// extraction (offset = amount, length = width - amount), which the downstream
// emitter can realize as a single extract instruction instead of a shift.

use crate::core::error::LowerResult;
use crate::core::graph::{BehaviorGraph, Model, NodeId};
use crate::core::node::{Extend, Node, NodeKind, Op};
use crate::core::session::LoweringSession;
use crate::passes::{Pass, PassResults};
use log::debug;

pub const NAME: &str = "simplify";

/// Folds redundant operand truncations and rewrites fixed-amount right
/// shifts into bit-field extractions.
pub struct SimplifyPass;

impl Pass for SimplifyPass {
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
        let mut rewritten = 0;
        for instr in &mut model.instructions {
            rewritten += Simplifier::new(&mut instr.graph, target).run()?;
        }
        debug!("simplification rewrote {} operators", rewritten);
        Ok(())
    }
}

/// Operators whose result bits depend only on the same-position operand
/// bits, making high operand bits irrelevant.
fn is_bit_local(op: Op) -> bool {
    matches!(
        op,
        Op::Add | Op::Sub | Op::Mul | Op::And | Op::Or | Op::Xor | Op::Not
    )
}

struct Simplifier<'g> {
    graph: &'g mut BehaviorGraph,
    target: u8,
}

impl<'g> Simplifier<'g> {
    fn new(graph: &'g mut BehaviorGraph, target: u8) -> Self {
        Simplifier { graph, target }
    }

    fn run(&mut self) -> LowerResult<usize> {
        let mut rewritten = 0;
        let calls: Vec<(NodeId, Op)> = self
            .graph
            .ids()
            .filter_map(|id| match self.graph.node(id).kind {
                NodeKind::BuiltIn { op, .. } => Some((id, op)),
                _ => None,
            })
            .collect();

        for (call, op) in calls {
            if !self.graph.is_live(call) {
                continue;
            }
            if is_bit_local(op) {
                rewritten += self.fold_operand_truncations(call);
            }
            match op {
                Op::Lsr => rewritten += self.shift_to_extract(call, Extend::Zero),
                Op::Asr => rewritten += self.shift_to_extract(call, Extend::Sign),
                _ => {}
            }
        }

        self.graph.delete_unused_dependencies();
        Ok(rewritten)
    }

    /// Drop operand truncations that preserve at least the operator's own
    /// declared width; the narrowing has no effect on the surviving bits.
    fn fold_operand_truncations(&mut self, call: NodeId) -> usize {
        let result_width = self.graph.node(call).width;
        let args = match &self.graph.node(call).kind {
            NodeKind::BuiltIn { args, .. } => args.clone(),
            _ => unreachable!(),
        };
        let mut folded = 0;
        for (i, arg) in args.iter().enumerate() {
            if let NodeKind::Extract {
                value,
                mode: Extend::Zero,
                from_width,
                to_width,
            } = self.graph.node(*arg).kind
            {
                let preserved = from_width.min(to_width);
                if preserved >= result_width {
                    self.graph.set_builtin_arg(call, i, value);
                    folded += 1;
                }
            }
        }
        folded
    }

    /// `value >> amount` with a translation-time-fixed amount becomes a
    /// bit-field extraction of `(offset = amount, length = width - amount)`.
    fn shift_to_extract(&mut self, call: NodeId, mode: Extend) -> usize {
        let (args, call_width) = match &self.graph.node(call).kind {
            NodeKind::BuiltIn { args, .. } => (args.clone(), self.graph.node(call).width),
            _ => unreachable!(),
        };
        let (value, amount) = (args[0], args[1]);
        if self.graph.depends_on_resource_read(amount) {
            return 0;
        }

        let value_width = self.graph.node(value).width;
        let amount_width = self.graph.node(amount).width;

        // the extraction offset must stay below the value width
        let offset = if super::normalize::amount_can_reach(value_width, amount_width) {
            let modulus = self.graph.add(Node::dep(
                NodeKind::Const {
                    value: value_width as u64,
                },
                amount_width,
                false,
            ));
            self.graph.add(Node::dep(
                NodeKind::BuiltIn {
                    op: Op::UMod,
                    args: vec![amount, modulus],
                },
                amount_width,
                false,
            ))
        } else {
            amount
        };

        let span = self.graph.add(Node::dep(
            NodeKind::Const {
                value: value_width as u64,
            },
            32,
            false,
        ));
        let length = self.graph.add(Node::dep(
            NodeKind::BuiltIn {
                op: Op::Sub,
                args: vec![span, offset],
            },
            32,
            false,
        ));

        let extract = self.graph.add(Node::dep(
            NodeKind::FieldExtract {
                value,
                offset,
                length,
                mode,
            },
            call_width,
            mode == Extend::Sign,
        ));
        self.graph.replace_and_delete(call, extract);

        // conversions made redundant around the new extraction
        if let NodeKind::Extract {
            value: base,
            from_width,
            to_width,
            ..
        } = self.graph.node(value).kind
        {
            if from_width.min(to_width) >= value_width {
                self.graph.replace_all_usages(value, base);
            }
        }
        for user in self.graph.users(extract).to_vec() {
            if let NodeKind::Extract {
                mode: Extend::Sign,
                from_width,
                to_width,
                ..
            } = self.graph.node(user).kind
            {
                if from_width.min(to_width) >= value_width && to_width == self.target {
                    self.graph.replace_all_usages(user, extract);
                }
            }
        }
        1
    }
}
