// This module minimizes the conversion nodes inserted by width normalization.
// Chains of sign-extends, zero-extends and truncations can mostly be expressed
// by a single conversion. Each maximal chain is flattened base-first and
// folded into segments {preserved width, out width, extension?, signed};
// a narrower conversion supersedes the whole segment, a truncation after an
// extension only shrinks the output, and extensions merge unless a zero
// extension would have to undo a sign fill. A trailing truncation folds into a
// preceding extension by narrowing its output. Conversions that preserve at
// least the value's guaranteed significant width are pass-throughs and are
// deleted outright. Re-running the pass changes nothing.

use crate::core::error::{LowerError, LowerResult};
use crate::core::graph::{BehaviorGraph, Model, NodeId};
use crate::core::node::{Extend, Node, NodeKind, Op};
use crate::core::session::LoweringSession;
use crate::passes::{Pass, PassResults};
use log::debug;

pub const NAME: &str = "extract-optimize";

/// Folds redundant conversion chains into minimal equivalent forms.
pub struct ExtractOptPass;

impl Pass for ExtractOptPass {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(
        &mut self,
        model: &mut Model,
        session: &LoweringSession,
        _results: &mut PassResults,
    ) -> LowerResult<()> {
        let mut folded = 0;
        for instr in &mut model.instructions {
            let before = instr.graph.node_count();
            ExtractOptimizer::new(&mut instr.graph, &instr.name).run()?;
            folded += before.saturating_sub(instr.graph.node_count());
        }
        session.update_stats(|s| s.conversions_folded += folded);
        debug!("extract optimization removed {} nodes", folded);
        Ok(())
    }
}

/// Upper bound on the significant width a node's value can carry at runtime.
/// Used to recognize conversions that change nothing.
fn value_width_bound(graph: &BehaviorGraph, id: NodeId) -> u8 {
    let node = graph.node(id);
    match &node.kind {
        NodeKind::Const { .. }
        | NodeKind::ReadReg { .. }
        | NodeKind::ReadRegFile { .. }
        | NodeKind::ReadMem { .. }
        | NodeKind::Load { .. }
        | NodeKind::StaticPc
        | NodeKind::FieldExtract { .. } => node.width,
        NodeKind::Select {
            on_true, on_false, ..
        } => value_width_bound(graph, *on_true).max(value_width_bound(graph, *on_false)),
        NodeKind::Extract {
            value,
            mode,
            from_width,
            to_width,
        } => {
            let preserved = (*from_width).min(*to_width);
            match mode {
                Extend::Zero => preserved.min(value_width_bound(graph, *value)),
                Extend::Sign => {
                    let inner = value_width_bound(graph, *value);
                    if inner < *from_width {
                        // the sign bit is a guaranteed zero
                        preserved.min(inner)
                    } else if to_width > from_width {
                        *to_width
                    } else {
                        preserved
                    }
                }
            }
        }
        NodeKind::BuiltIn { op, args } => match op {
            op if op.is_comparison() => 1,
            Op::Lsr | Op::UDiv | Op::UMod => value_width_bound(graph, args[0]),
            Op::And | Op::Or | Op::Xor => args
                .iter()
                .map(|&a| value_width_bound(graph, a))
                .max()
                .unwrap_or(node.width),
            Op::Clz | Op::Cls => node.width,
            _ => 64,
        },
        _ => 64,
    }
}

/// One foldable stretch of a conversion chain.
#[derive(Debug, Clone, Copy)]
struct Segment {
    /// Bits selected from the base; never grows within the segment.
    preserved: u8,
    /// Output width after the segment's operations.
    out: u8,
    /// Whether the segment ends in an extension rather than a truncation.
    is_ext: bool,
    /// Extension mode when `is_ext` (true for sign extension).
    sign: bool,
}

/// Snapshot of one conversion node in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChainLink {
    id: NodeId,
    mode: Extend,
    from: u8,
    to: u8,
}

impl ChainLink {
    fn preserved(&self) -> u8 {
        self.from.min(self.to)
    }

    fn is_truncate(&self) -> bool {
        self.to <= self.from
    }

    fn is_signed(&self) -> bool {
        self.mode == Extend::Sign
    }
}

impl Segment {
    fn of(link: &ChainLink) -> Self {
        Segment {
            preserved: link.preserved(),
            out: link.to,
            is_ext: !link.is_truncate(),
            sign: link.is_signed(),
        }
    }

    fn set_to(&mut self, link: &ChainLink) {
        *self = Segment::of(link);
    }

    fn mode(&self) -> Extend {
        if self.is_ext && self.sign {
            Extend::Sign
        } else {
            Extend::Zero
        }
    }
}

struct ExtractOptimizer<'g> {
    graph: &'g mut BehaviorGraph,
    instr: &'g str,
    /// Per-chain rebuild memo, so shared chains rebuild once.
    rebuilt: hashbrown::HashMap<NodeId, NodeId>,
}

impl<'g> ExtractOptimizer<'g> {
    fn new(graph: &'g mut BehaviorGraph, instr: &'g str) -> Self {
        ExtractOptimizer {
            graph,
            instr,
            rebuilt: hashbrown::HashMap::new(),
        }
    }

    fn run(&mut self) -> LowerResult<()> {
        let targets: Vec<NodeId> = self
            .graph
            .ids()
            .filter(|&id| {
                self.graph.node(id).is_dependency()
                    && !matches!(self.graph.node(id).kind, NodeKind::Extract { .. })
            })
            .collect();
        for node in targets {
            if self.graph.is_live(node) {
                self.optimize_inputs_of(node)?;
            }
        }

        self.remove_pass_through_zero_extends();
        self.graph.delete_unused_dependencies();
        Ok(())
    }

    /// Conversions are only optimized from their consumers; chains below a
    /// consumer fold into minimal form.
    fn optimize_inputs_of(&mut self, node: NodeId) -> LowerResult<()> {
        let mut extract_inputs: Vec<NodeId> = self
            .graph
            .node(node)
            .value_inputs()
            .into_iter()
            .filter(|&i| matches!(self.graph.node(i).kind, NodeKind::Extract { .. }))
            .collect();
        extract_inputs.sort();
        extract_inputs.dedup();

        for ext in extract_inputs {
            let optimized = self.optimize_chain(ext)?;
            if optimized != ext {
                self.graph.replace_input(node, ext, optimized);
            }
        }
        Ok(())
    }

    fn optimize_chain(&mut self, ext: NodeId) -> LowerResult<NodeId> {
        if let Some(&done) = self.rebuilt.get(&ext) {
            return Ok(done);
        }

        let (chain, base) = self.flatten_chain(ext);
        let segments = self.fold_segments(&chain)?;

        // already minimal: keep the existing nodes
        if segments.len() == chain.len()
            && segments.iter().zip(&chain).all(|(seg, link)| {
                seg.preserved == link.preserved() && seg.out == link.to && seg.mode() == link.mode
            })
        {
            self.rebuilt.insert(ext, ext);
            return Ok(ext);
        }

        let declared = self.graph.node(ext).width;
        let mut current = base;
        for seg in &segments {
            let mode = seg.mode();
            current = self.graph.add(Node::dep(
                NodeKind::Extract {
                    value: current,
                    mode,
                    from_width: seg.preserved,
                    to_width: seg.out,
                },
                declared,
                mode == Extend::Sign,
            ));
        }
        self.rebuilt.insert(ext, current);
        Ok(current)
    }

    /// Flatten consecutive conversions; the returned list runs from the base
    /// upward, together with the underlying non-conversion value.
    fn flatten_chain(&self, ext: NodeId) -> (Vec<ChainLink>, NodeId) {
        let mut chain = Vec::new();
        let mut cur = ext;
        loop {
            match self.graph.node(cur).kind {
                NodeKind::Extract {
                    value,
                    mode,
                    from_width,
                    to_width,
                } => {
                    chain.push(ChainLink {
                        id: cur,
                        mode,
                        from: from_width,
                        to: to_width,
                    });
                    cur = value;
                }
                _ => break,
            }
        }
        chain.reverse();
        (chain, cur)
    }

    fn fold_segments(&self, chain: &[ChainLink]) -> LowerResult<Vec<Segment>> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut current: Option<Segment> = None;

        for link in chain {
            let cur = match current.as_mut() {
                None => {
                    current = Some(Segment::of(link));
                    continue;
                }
                Some(cur) => cur,
            };

            if link.preserved() <= cur.preserved {
                // the narrower conversion supersedes everything so far
                cur.set_to(link);
            } else if link.is_truncate() {
                cur.out = link.to;
            } else if cur.is_ext && cur.sign && !link.is_signed() {
                // a zero extension cannot undo a sign fill
                segments.push(*cur);
                cur.set_to(link);
            } else {
                // the extension merges into the segment and must widen it
                if link.to < cur.out {
                    return Err(LowerError::invariant(
                        self.instr,
                        format!(
                            "conversion {} narrows an extension segment ({} < {})",
                            link.id, link.to, cur.out
                        ),
                    ));
                }
                if cur.is_ext && !cur.sign && link.is_signed() {
                    // sign over zero-filled bits: the sign matters only when
                    // the preserved bits reach the new source width
                    cur.sign = cur.preserved >= link.from;
                    cur.out = link.to;
                } else {
                    cur.out = link.to;
                    cur.is_ext = true;
                    cur.sign = link.is_signed();
                }
            }
        }

        let last = current.ok_or_else(|| {
            LowerError::invariant(self.instr, "conversion chain is empty".to_string())
        })?;
        segments.push(last);

        // a trailing truncation narrows the preceding extension instead of
        // surviving as its own node
        while segments.len() >= 2 {
            let last = segments[segments.len() - 1];
            let prev = segments[segments.len() - 2];
            if !last.is_ext && prev.is_ext {
                let idx = segments.len() - 2;
                segments[idx].out = last.out;
                segments.pop();
            } else {
                break;
            }
        }

        Ok(segments)
    }

    /// A zero extension whose preserved width covers everything the value can
    /// carry changes nothing; its non-conversion users read the base value.
    fn remove_pass_through_zero_extends(&mut self) {
        let candidates: Vec<NodeId> = self
            .graph
            .ids()
            .filter(|&id| {
                matches!(
                    self.graph.node(id).kind,
                    NodeKind::Extract {
                        mode: Extend::Zero,
                        from_width,
                        to_width,
                        ..
                    } if from_width <= to_width
                )
            })
            .collect();
        for ext in candidates {
            let (value, from) = match self.graph.node(ext).kind {
                NodeKind::Extract {
                    value, from_width, ..
                } => (value, from_width),
                _ => unreachable!(),
            };
            if value_width_bound(self.graph, value) > from {
                continue;
            }
            for user in self.graph.users(ext).to_vec() {
                if matches!(self.graph.node(user).kind, NodeKind::Extract { .. }) {
                    continue;
                }
                self.graph.replace_input(user, ext, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::GraphBuilder;
    use crate::core::node::RegId;

    fn optimize(graph: &mut BehaviorGraph) {
        ExtractOptimizer::new(graph, "test").run().expect("optimizes");
    }

    fn conversion_count(graph: &BehaviorGraph) -> usize {
        graph
            .ids()
            .filter(|&id| matches!(graph.node(id).kind, NodeKind::Extract { .. }))
            .count()
    }

    fn written_value(graph: &BehaviorGraph) -> NodeId {
        let write = graph
            .ids()
            .find(|&id| matches!(graph.node(id).kind, NodeKind::WriteReg { .. }))
            .expect("write present");
        graph.node(write).value_inputs()[0]
    }

    #[test]
    fn test_sign_then_truncate_collapses_to_pass_through() {
        // truncate(8 <- extend_sign(32 <- 16, x)) over an 8-bit x vanishes
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 8);
        let ext = b.extract(x, Extend::Sign, 16, 32, 32);
        let trunc = b.extract(ext, Extend::Zero, 32, 8, 8);
        b.write_reg(RegId(2), trunc);
        let mut graph = b.finish();
        optimize(&mut graph);

        assert_eq!(written_value(&graph), x);
        assert_eq!(conversion_count(&graph), 0);
    }

    #[test]
    fn test_double_sign_extension_merges() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 8);
        let e1 = b.extract(x, Extend::Sign, 8, 16, 16);
        let e2 = b.extract(e1, Extend::Sign, 16, 64, 64);
        b.write_reg(RegId(2), e2);
        let mut graph = b.finish();
        optimize(&mut graph);

        let survivor = written_value(&graph);
        match graph.node(survivor).kind {
            NodeKind::Extract {
                value,
                mode,
                from_width,
                to_width,
            } => {
                assert_eq!(value, x);
                assert_eq!(mode, Extend::Sign);
                assert_eq!(from_width, 8);
                assert_eq!(to_width, 64);
            }
            _ => panic!("expected one merged extension"),
        }
        assert_eq!(conversion_count(&graph), 1);
    }

    #[test]
    fn test_sign_then_zero_extension_stays_split() {
        // the sign fill reaches [8, 32); zero-extending its low 16 bits
        // afterwards cuts that fill and cannot merge into one conversion
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 8);
        let e1 = b.extract(x, Extend::Sign, 8, 32, 32);
        let e2 = b.extract(e1, Extend::Zero, 16, 64, 64);
        b.write_reg(RegId(2), e2);
        let mut graph = b.finish();
        optimize(&mut graph);

        assert_eq!(conversion_count(&graph), 2);
    }

    #[test]
    fn test_zero_then_sign_extension_merges_to_zero() {
        // the sign bit of the zero-filled wider value is always 0
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 8);
        let e1 = b.extract(x, Extend::Zero, 8, 16, 16);
        let e2 = b.extract(e1, Extend::Sign, 16, 64, 64);
        b.write_reg(RegId(2), e2);
        let mut graph = b.finish();
        optimize(&mut graph);

        // preserved width 8 < source width 16 of the sign extension: the
        // whole chain is one zero extension, which is itself a pass-through
        assert_eq!(written_value(&graph), x);
        assert_eq!(conversion_count(&graph), 0);
    }

    #[test]
    fn test_trailing_truncation_merges_into_extension() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 32);
        let narrowed = b.extract(x, Extend::Sign, 12, 64, 64);
        let trunc = b.extract(narrowed, Extend::Zero, 64, 16, 16);
        b.write_reg(RegId(2), trunc);
        let mut graph = b.finish();
        optimize(&mut graph);

        let survivor = written_value(&graph);
        match graph.node(survivor).kind {
            NodeKind::Extract {
                value,
                mode,
                from_width,
                to_width,
            } => {
                assert_eq!(value, x);
                assert_eq!(mode, Extend::Sign);
                assert_eq!(from_width, 12);
                assert_eq!(to_width, 16);
            }
            _ => panic!("expected merged extension"),
        }
        assert_eq!(conversion_count(&graph), 1);
    }

    #[test]
    fn test_idempotent() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 8);
        let e1 = b.extract(x, Extend::Sign, 8, 16, 16);
        let e2 = b.extract(e1, Extend::Sign, 16, 64, 64);
        b.write_reg(RegId(2), e2);
        let mut graph = b.finish();
        optimize(&mut graph);
        let after_first = graph.node_count();
        optimize(&mut graph);
        assert_eq!(graph.node_count(), after_first);
    }
}
