// This module implements the behavior graph storage: a slot arena addressed by
// stable NodeIds plus a parallel usage table (incoming edge lists). Passes
// mutate the graph destructively in place: nodes are added, rewired, replaced
// and deleted, and the usage table keeps predecessor/user queries exact across
// rewrites. Replacement and deletion are "swap the slot, fix up the incoming
// edge lists", never pointer rewriting. The module also provides structural
// verification of the control skeleton (unique start and end, branch
// convergence at a single merge, acyclicity), which the pass manager runs
// between passes in debug builds.

use crate::core::error::{LowerError, LowerResult};
use crate::core::node::{Node, NodeKind, RegId};
use std::fmt;

/// Stable index of a node inside its owning [`BehaviorGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// The per-instruction IR consumed by every pass: a control skeleton threaded
/// through a data-dependency graph, stored in one slot arena.
#[derive(Debug, Default, Clone)]
pub struct BehaviorGraph {
    nodes: Vec<Option<Node>>,
    uses: Vec<Vec<NodeId>>,
}

impl BehaviorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, registering its value and control references.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for r in node.value_inputs() {
            self.uses[r.index()].push(id);
        }
        for r in node.control_refs() {
            self.uses[r.index()].push(id);
        }
        self.nodes.push(Some(node));
        self.uses.push(Vec::new());
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.index()].as_ref().expect("node was deleted")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.index()].as_mut().expect("node was deleted")
    }

    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|slot| slot.as_ref())
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.try_node(id).is_some()
    }

    /// All live node ids.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }

    /// Users of a node: every node holding a value or control reference to it,
    /// one entry per reference.
    pub fn users(&self, id: NodeId) -> &[NodeId] {
        &self.uses[id.index()]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    fn remove_one_use(&mut self, of: NodeId, user: NodeId) {
        let list = &mut self.uses[of.index()];
        if let Some(pos) = list.iter().position(|&u| u == user) {
            list.swap_remove(pos);
        }
    }

    /// Rewire the successor edge of a directional control node.
    pub fn set_succ(&mut self, id: NodeId, succ: Option<NodeId>) {
        let old = self.node(id).succ;
        if old == succ {
            return;
        }
        if let Some(o) = old {
            self.remove_one_use(o, id);
        }
        if let Some(s) = succ {
            self.uses[s.index()].push(id);
        }
        self.node_mut(id).succ = succ;
    }

    /// Replace every value-input reference of `user` to `old` by `new`.
    pub fn replace_input(&mut self, user: NodeId, old: NodeId, new: NodeId) {
        let count = self
            .node(user)
            .value_inputs()
            .iter()
            .filter(|&&i| i == old)
            .count();
        if count == 0 {
            return;
        }
        self.node_mut(user).replace_value_input(old, new);
        for _ in 0..count {
            self.remove_one_use(old, user);
            self.uses[new.index()].push(user);
        }
    }

    /// Replace a single positional operand of an operator node, leaving other
    /// occurrences of the same input untouched.
    pub fn set_builtin_arg(&mut self, call: NodeId, index: usize, new: NodeId) {
        let old = match &self.node(call).kind {
            NodeKind::BuiltIn { args, .. } => args[index],
            other => panic!("set_builtin_arg on non-operator node {:?}", other),
        };
        if old == new {
            return;
        }
        match &mut self.node_mut(call).kind {
            NodeKind::BuiltIn { args, .. } => args[index] = new,
            _ => unreachable!(),
        }
        self.remove_one_use(old, call);
        self.uses[new.index()].push(call);
    }

    /// Rewire every user of `old` to consume `new` instead. The replacement
    /// node itself is skipped so a conversion wrapping `old` keeps its input.
    pub fn replace_all_usages(&mut self, old: NodeId, new: NodeId) {
        let users: Vec<NodeId> = self.users(old).to_vec();
        for user in users {
            if user == new {
                continue;
            }
            self.replace_input(user, old, new);
        }
    }

    /// Rewire all users of `old` to `new`, then delete `old`.
    pub fn replace_and_delete(&mut self, old: NodeId, new: NodeId) {
        self.replace_all_usages(old, new);
        self.delete(old);
    }

    /// Delete a node that no longer has users, fixing up the edge lists of
    /// its inputs.
    pub fn delete(&mut self, id: NodeId) {
        assert!(
            self.uses[id.index()].is_empty(),
            "deleting {} which still has users",
            id
        );
        let node = self.nodes[id.index()].take().expect("node was deleted");
        for r in node.value_inputs() {
            self.remove_one_use(r, id);
        }
        for r in node.control_refs() {
            self.remove_one_use(r, id);
        }
        self.uses[id.index()].clear();
    }

    /// Delete expression nodes without users, repeatedly, so whole dead
    /// sub-trees disappear.
    pub fn delete_unused_dependencies(&mut self) -> usize {
        let mut deleted = 0;
        loop {
            let dead: Vec<NodeId> = self
                .ids()
                .filter(|&id| self.node(id).is_expression() && self.users(id).is_empty())
                .collect();
            if dead.is_empty() {
                return deleted;
            }
            for id in dead {
                self.delete(id);
                deleted += 1;
            }
        }
    }

    /// Insert a directional node right after `at` in the control order.
    pub fn insert_after(&mut self, at: NodeId, mut node: Node) -> NodeId {
        let old_succ = self.node(at).succ;
        node.succ = old_succ;
        let id = self.add(node);
        self.set_succ(at, Some(id));
        id
    }

    /// Insert a directional node right before `at`, which must have exactly
    /// one directional predecessor. Returns `None` otherwise (e.g. before a
    /// branch begin or a merge).
    pub fn insert_before(&mut self, at: NodeId, node: Node) -> Option<NodeId> {
        let preds: Vec<NodeId> = self
            .control_preds(at)
            .into_iter()
            .filter(|&p| self.node(p).succ == Some(at))
            .collect();
        if preds.len() != 1 {
            return None;
        }
        Some(self.insert_after(preds[0], node))
    }

    /// Control predecessors: nodes whose successor edge or branch target
    /// points at `id`.
    pub fn control_preds(&self, id: NodeId) -> Vec<NodeId> {
        self.users(id)
            .iter()
            .copied()
            .filter(|&u| self.node(u).control_refs().contains(&id))
            .collect()
    }

    /// Control successors: both branch begins for a split, the successor edge
    /// otherwise.
    pub fn control_succs(&self, id: NodeId) -> Vec<NodeId> {
        match self.node(id).kind {
            NodeKind::If {
                then_begin,
                else_begin,
                ..
            } => vec![then_begin, else_begin],
            _ => self.node(id).succ.into_iter().collect(),
        }
    }

    fn single_of(&self, pred: impl Fn(&NodeKind) -> bool) -> Option<NodeId> {
        let mut found = None;
        for id in self.ids() {
            if pred(&self.node(id).kind) {
                if found.is_some() {
                    return None;
                }
                found = Some(id);
            }
        }
        found
    }

    /// The unique start node.
    pub fn start(&self) -> NodeId {
        self.single_of(|k| matches!(k, NodeKind::Start))
            .expect("graph has no unique start node")
    }

    /// The unique instruction-end node.
    pub fn end(&self) -> NodeId {
        self.single_of(|k| matches!(k, NodeKind::End))
            .expect("graph has no unique end node")
    }

    /// Scheduling marker of a dependency node, if any.
    pub fn schedule_marker(&self, dep: NodeId) -> Option<NodeId> {
        self.users(dep)
            .iter()
            .copied()
            .find(|&u| matches!(self.node(u).kind, NodeKind::Scheduled { .. }))
    }

    /// Whether `node` transitively depends on an architectural resource read
    /// (register, register file or memory). The translation-time PC does not
    /// count.
    pub fn depends_on_resource_read(&self, node: NodeId) -> bool {
        let mut stack = vec![node];
        let mut seen = hashbrown::HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match self.node(id).kind {
                NodeKind::ReadReg { .. }
                | NodeKind::ReadRegFile { .. }
                | NodeKind::ReadMem { .. }
                | NodeKind::Load { .. } => return true,
                _ => stack.extend(self.node(id).value_inputs()),
            }
        }
        false
    }

    /// Structural verification of the control skeleton.
    pub fn verify(&self, instr: &str) -> LowerResult<()> {
        let start = self
            .single_of(|k| matches!(k, NodeKind::Start))
            .ok_or_else(|| malformed(instr, "expected exactly one start node"))?;
        self.single_of(|k| matches!(k, NodeKind::End))
            .ok_or_else(|| malformed(instr, "expected exactly one end node"))?;

        let mut visited = hashbrown::HashSet::new();
        let terminal = self.verify_branch(instr, start, &mut visited)?;
        if !matches!(self.node(terminal).kind, NodeKind::End) {
            return Err(malformed(instr, "main branch does not terminate at the end node"));
        }
        Ok(())
    }

    /// Walk one branch, recursing into splits; returns the branch-end (or the
    /// instruction end for the main branch).
    fn verify_branch(
        &self,
        instr: &str,
        begin: NodeId,
        visited: &mut hashbrown::HashSet<NodeId>,
    ) -> LowerResult<NodeId> {
        let mut cur = begin;
        loop {
            if !visited.insert(cur) {
                return Err(malformed(
                    instr,
                    format!("control skeleton revisits {} (cycle or cross-edge)", cur),
                ));
            }
            match self.node(cur).kind {
                NodeKind::If {
                    then_begin,
                    else_begin,
                    ..
                } => {
                    let then_end = self.verify_branch(instr, then_begin, visited)?;
                    let else_end = self.verify_branch(instr, else_begin, visited)?;
                    let (a, b) = (self.node(then_end).succ, self.node(else_end).succ);
                    if a.is_none() || a != b {
                        return Err(malformed(
                            instr,
                            format!("branches of {} end at different merge nodes", cur),
                        ));
                    }
                    let merge = a.expect("checked above");
                    if !matches!(self.node(merge).kind, NodeKind::Merge) {
                        return Err(malformed(
                            instr,
                            format!("branch ends of {} are not joined by a merge node", cur),
                        ));
                    }
                    cur = merge;
                    // the merge is visited as part of the continuing walk
                    continue;
                }
                NodeKind::BranchEnd | NodeKind::End => return Ok(cur),
                _ => match self.node(cur).succ {
                    Some(next) => cur = next,
                    None => {
                        return Err(malformed(
                            instr,
                            format!("directional node {} has no successor", cur),
                        ))
                    }
                },
            }
        }
    }
}

fn malformed(instr: &str, detail: impl Into<String>) -> LowerError {
    LowerError::MalformedGraph {
        instr: instr.to_string(),
        detail: detail.into(),
    }
}

/// One instruction: a name and its behavior graph.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub name: String,
    pub graph: BehaviorGraph,
}

/// The specification-wide model handed to the pass manager: every
/// instruction's behavior plus the identity of the architectural program
/// counter. Produced by the upstream front end.
#[derive(Debug, Clone)]
pub struct Model {
    pub pc: RegId,
    pub instructions: Vec<Instruction>,
}

impl Model {
    pub fn new(pc: RegId) -> Self {
        Model {
            pc,
            instructions: Vec::new(),
        }
    }
}
