// This module linearizes the dependency graph into an explicit, branch-
// respecting execution order. The walk follows the control skeleton: at every
// pre-anchored scheduling marker the wrapped node's unscheduled operands are
// scheduled immediately before it, inputs first; at a control split the
// condition is scheduled before the split. Each branch pushes a fresh
// visible-results scope and discards its memoized results at the branch end,
// so a value computed only inside one branch is recomputed in a sibling
// rather than referenced across. Resource reads always become operations,
// translation-time values (constants, the static PC) never do, and any other
// expression becomes one exactly when one of its inputs did. Register-file
// and memory addresses must remain translation-time immediates.

use crate::core::error::{LowerError, LowerResult};
use crate::core::graph::{BehaviorGraph, Model, NodeId};
use crate::core::node::{Node, NodeKind};
use crate::core::session::LoweringSession;
use crate::passes::{Pass, PassResults};
use hashbrown::HashMap;
use log::debug;

pub const NAME: &str = "schedule";

/// Produces the explicit per-branch operation order.
pub struct SchedulePass;

impl Pass for SchedulePass {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(
        &mut self,
        model: &mut Model,
        session: &LoweringSession,
        _results: &mut PassResults,
    ) -> LowerResult<()> {
        let mut scheduled = 0;
        for instr in &mut model.instructions {
            scheduled += Scheduler::new(&mut instr.graph, &instr.name).run()?;
        }
        session.update_stats(|s| s.operations_scheduled += scheduled);
        debug!("scheduled {} operations", scheduled);
        Ok(())
    }
}

struct Scheduler<'g> {
    graph: &'g mut BehaviorGraph,
    instr: &'g str,
    /// Memoized schedule decision per dependency, scoped to the current
    /// branch nesting.
    processed: HashMap<NodeId, Option<NodeId>>,
    /// One scope per open branch; popped entries leave `processed`.
    branch_scopes: Vec<Vec<NodeId>>,
    /// Markers that existed before this run (side effects, forced PC writes).
    pre_anchored: HashMap<NodeId, NodeId>,
    /// Control node the next markers are inserted before.
    root: NodeId,
    created: usize,
}

impl<'g> Scheduler<'g> {
    fn new(graph: &'g mut BehaviorGraph, instr: &'g str) -> Self {
        let pre_anchored = graph
            .ids()
            .filter_map(|id| match graph.node(id).kind {
                NodeKind::Scheduled { dep } => Some((dep, id)),
                _ => None,
            })
            .collect();
        let root = graph.start();
        Scheduler {
            graph,
            instr,
            processed: HashMap::new(),
            branch_scopes: Vec::new(),
            pre_anchored,
            root,
            created: 0,
        }
    }

    fn run(mut self) -> LowerResult<usize> {
        let start = self.graph.start();
        let terminal = self.traverse_branch(start)?;
        if !matches!(self.graph.node(terminal).kind, NodeKind::End) {
            return Err(LowerError::invariant(
                self.instr,
                "main branch does not terminate at the instruction end",
            ));
        }
        Ok(self.created)
    }

    fn traverse_branch(&mut self, begin: NodeId) -> LowerResult<NodeId> {
        self.branch_scopes.push(Vec::new());
        let mut cur = begin;
        loop {
            match self.graph.node(cur).kind.clone() {
                NodeKind::Scheduled { dep } => {
                    self.root = cur;
                    self.process(dep)?;
                }
                NodeKind::If {
                    condition,
                    then_begin,
                    else_begin,
                } => {
                    self.root = cur;
                    self.process(condition)?;

                    let then_end = self.traverse_branch(then_begin)?;
                    let else_end = self.traverse_branch(else_begin)?;
                    let merge = self.graph.node(then_end).succ;
                    if merge.is_none() || merge != self.graph.node(else_end).succ {
                        return Err(LowerError::invariant(
                            self.instr,
                            format!("branches of {} do not share a merge node", cur),
                        ));
                    }
                    cur = merge.expect("checked above");
                    continue;
                }
                NodeKind::BranchEnd | NodeKind::End => {
                    for dep in self.branch_scopes.pop().unwrap_or_default() {
                        self.processed.remove(&dep);
                    }
                    return Ok(cur);
                }
                NodeKind::Start
                | NodeKind::BranchBegin
                | NodeKind::Merge
                | NodeKind::Exit { .. }
                | NodeKind::GetVar { .. }
                | NodeKind::FreeVar { .. } => {}
                other => {
                    return Err(LowerError::invariant(
                        self.instr,
                        format!("dependency node {:?} threaded into the control order", other),
                    ))
                }
            }
            cur = self.graph.node(cur).succ.ok_or_else(|| {
                LowerError::invariant(self.instr, format!("{} has no successor", cur))
            })?;
        }
    }

    /// Schedule decision for one dependency: `Some(marker)` when the value is
    /// computed at runtime, `None` when it stays a translation-time immediate.
    fn process(&mut self, dep: NodeId) -> LowerResult<Option<NodeId>> {
        if let Some(&decision) = self.processed.get(&dep) {
            return Ok(decision);
        }

        for input in self.graph.node(dep).value_inputs() {
            self.process(input)?;
        }

        if let Some(scope) = self.branch_scopes.last_mut() {
            scope.push(dep);
        }

        self.validate_addresses(dep)?;

        // side effects and forced writes come pre-anchored
        if let Some(&marker) = self.pre_anchored.get(&dep) {
            self.processed.insert(dep, Some(marker));
            return Ok(Some(marker));
        }

        let decision = match self.graph.node(dep).kind.clone() {
            NodeKind::Const { .. } | NodeKind::StaticPc => None,
            NodeKind::ReadReg { .. }
            | NodeKind::ReadRegFile { .. }
            | NodeKind::ReadMem { .. }
            | NodeKind::Load { .. } => Some(self.insert_marker(dep)),
            NodeKind::BuiltIn { ref args, .. } => self.schedule_if_any_input_is(dep, args)?,
            NodeKind::Select {
                cond,
                on_true,
                on_false,
            } => self.schedule_if_any_input_is(dep, &[cond, on_true, on_false])?,
            NodeKind::Extract { value, .. } => self.schedule_if_any_input_is(dep, &[value])?,
            NodeKind::FieldExtract {
                value,
                offset,
                length,
                ..
            } => self.schedule_if_any_input_is(dep, &[value, offset, length])?,
            NodeKind::WriteReg { .. }
            | NodeKind::WriteRegFile { .. }
            | NodeKind::WriteMem { .. }
            | NodeKind::Store { .. } => {
                return Err(LowerError::invariant(
                    self.instr,
                    format!("side effect {} consumed as a value", dep),
                ))
            }
            _ => {
                return Err(LowerError::invariant(
                    self.instr,
                    format!("control node {} consumed as a value", dep),
                ))
            }
        };

        self.processed.insert(dep, decision);
        Ok(decision)
    }

    fn schedule_if_any_input_is(
        &mut self,
        dep: NodeId,
        inputs: &[NodeId],
    ) -> LowerResult<Option<NodeId>> {
        let any_scheduled = inputs
            .iter()
            .any(|i| matches!(self.processed.get(i), Some(Some(_))));
        Ok(if any_scheduled {
            Some(self.insert_marker(dep))
        } else {
            None
        })
    }

    fn insert_marker(&mut self, dep: NodeId) -> NodeId {
        let marker = self
            .graph
            .insert_before(self.root, Node::control(NodeKind::Scheduled { dep }))
            .expect("anchor has a single directional predecessor");
        self.created += 1;
        marker
    }

    /// Register-file and memory addresses are translation-time immediates in
    /// the target execution model; a scheduled address is unrepresentable.
    fn validate_addresses(&self, dep: NodeId) -> LowerResult<()> {
        let (address, what) = match self.graph.node(dep).kind {
            NodeKind::ReadRegFile { index, .. } | NodeKind::WriteRegFile { index, .. } => {
                (index, "register-file index")
            }
            NodeKind::ReadMem { addr, .. }
            | NodeKind::Load { addr, .. }
            | NodeKind::WriteMem { addr, .. }
            | NodeKind::Store { addr, .. } => (addr, "memory address"),
            _ => return Ok(()),
        };
        if matches!(self.processed.get(&address), Some(Some(_))) {
            return Err(LowerError::illegal(
                self.instr,
                format!(
                    "{} {} of {} depends on runtime state and cannot be \
                     evaluated at translation time",
                    what, address, dep
                ),
            ));
        }
        Ok(())
    }
}

/// Dependencies in scheduled order (then-branch before else-branch), for
/// tests and the downstream emitter.
pub fn scheduled_order(graph: &BehaviorGraph) -> Vec<NodeId> {
    fn walk(graph: &BehaviorGraph, begin: NodeId, order: &mut Vec<NodeId>) -> Option<NodeId> {
        let mut cur = begin;
        loop {
            match graph.node(cur).kind {
                NodeKind::Scheduled { dep } => order.push(dep),
                NodeKind::If {
                    then_begin,
                    else_begin,
                    ..
                } => {
                    let then_end = walk(graph, then_begin, order)?;
                    walk(graph, else_begin, order)?;
                    cur = graph.node(then_end).succ?;
                    continue;
                }
                NodeKind::BranchEnd | NodeKind::End => return Some(cur),
                _ => {}
            }
            cur = graph.node(cur).succ?;
        }
    }

    let mut order = Vec::new();
    walk(graph, graph.start(), &mut order);
    order
}
