// This module detects resource reads whose observed value could be ambiguous
// with respect to conditional writes of the same resource. Dominator lists
// are computed in one stack-based walk over the control skeleton: pushed along
// each branch, truncated back at branch ends. For every resource, the control
// nodes transitively consuming each read form the conflict set; if every
// conflict node is dominated by every write of the resource the ordering is
// unambiguous and no safeguard is needed. Otherwise the lowest common
// dominator of all conflict nodes and writes is recorded as the point where
// the read's value must be captured into a stable slot. The capture itself is
// materialized by a later stage; this pass only reports where it is required.

use crate::core::error::{LowerError, LowerResult};
use crate::core::graph::{BehaviorGraph, Model, NodeId};
use crate::core::node::{MemId, NodeKind, RegFileId, RegId};
use crate::core::session::LoweringSession;
use crate::passes::{Pass, PassResults};
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};
use log::debug;

pub const NAME: &str = "read-hazard";

/// Identity of an architectural resource for hazard grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    Reg(RegId),
    RegFile(RegFileId),
    Mem(MemId),
}

/// One required read capture.
#[derive(Debug, Clone, Copy)]
pub struct HazardCapture {
    pub resource: ResourceKey,
    pub read: NodeId,
    /// Control node before which the read's value must be captured.
    pub capture_at: NodeId,
}

/// Typed result of the hazard analysis, keyed by instruction name.
#[derive(Debug, Default)]
pub struct HazardReport {
    pub per_instr: HashMap<String, Vec<HazardCapture>>,
}

impl HazardReport {
    pub fn captures_for(&self, instr: &str) -> &[HazardCapture] {
        self.per_instr.get(instr).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Flags reads that may race with conditional writes to the same resource.
pub struct ReadHazardPass;

impl Pass for ReadHazardPass {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(
        &mut self,
        model: &mut Model,
        session: &LoweringSession,
        results: &mut PassResults,
    ) -> LowerResult<()> {
        let mut report = HazardReport::default();
        let mut total = 0;
        for instr in &model.instructions {
            let captures = analyze_graph(&instr.graph, &instr.name, session.arena())?;
            total += captures.len();
            report.per_instr.insert(instr.name.clone(), captures);
        }
        session.update_stats(|s| s.reads_captured += total);
        debug!("{} resource reads require capturing", total);
        results.insert(NAME, report);
        Ok(())
    }
}

/// Dominator list per control node, from the start node downward, computed by
/// pushing along each branch and truncating at branch ends. The lists are
/// dense and short-lived, so they live in the run's bump arena.
fn dominator_sets<'a>(
    graph: &BehaviorGraph,
    instr: &str,
    arena: &'a Bump,
) -> LowerResult<HashMap<NodeId, BumpVec<'a, NodeId>>> {
    let mut sets = HashMap::new();
    let mut doms = Vec::new();
    walk_branch(graph, instr, graph.start(), arena, &mut doms, &mut sets)?;
    Ok(sets)
}

fn walk_branch<'a>(
    graph: &BehaviorGraph,
    instr: &str,
    begin: NodeId,
    arena: &'a Bump,
    doms: &mut Vec<NodeId>,
    sets: &mut HashMap<NodeId, BumpVec<'a, NodeId>>,
) -> LowerResult<NodeId> {
    let mut cur = begin;
    loop {
        doms.push(cur);
        sets.insert(cur, BumpVec::from_iter_in(doms.iter().copied(), arena));
        match graph.node(cur).kind {
            NodeKind::If {
                then_begin,
                else_begin,
                ..
            } => {
                let depth = doms.len();
                let then_end = walk_branch(graph, instr, then_begin, arena, doms, sets)?;
                doms.truncate(depth);
                let else_end = walk_branch(graph, instr, else_begin, arena, doms, sets)?;
                doms.truncate(depth);

                let merge = graph.node(then_end).succ;
                if merge.is_none() || merge != graph.node(else_end).succ {
                    return Err(LowerError::invariant(
                        instr,
                        format!("branches of {} do not share a merge node", cur),
                    ));
                }
                cur = merge.expect("checked above");
            }
            NodeKind::BranchEnd | NodeKind::End => return Ok(cur),
            _ => {
                cur = graph.node(cur).succ.ok_or_else(|| {
                    LowerError::invariant(instr, format!("{} has no successor", cur))
                })?;
            }
        }
    }
}

/// Control nodes that transitively consume a dependency node's value.
fn control_users_of(graph: &BehaviorGraph, dep: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![dep];
    let mut seen = HashSet::new();
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        for &user in graph.users(n) {
            if graph.node(user).is_control() {
                out.push(user);
            } else {
                stack.push(user);
            }
        }
    }
    out
}

/// Control anchor of a write: its scheduling marker or the exit carrying it.
fn write_anchor(graph: &BehaviorGraph, write: NodeId) -> Option<NodeId> {
    graph.users(write).iter().copied().find(|&u| {
        matches!(
            graph.node(u).kind,
            NodeKind::Scheduled { .. } | NodeKind::Exit { .. }
        )
    })
}

fn resource_of(graph: &BehaviorGraph, id: NodeId) -> Option<(ResourceKey, bool)> {
    match graph.node(id).kind {
        NodeKind::ReadReg { reg } => Some((ResourceKey::Reg(reg), false)),
        NodeKind::ReadRegFile { file, .. } => Some((ResourceKey::RegFile(file), false)),
        NodeKind::ReadMem { mem, .. } | NodeKind::Load { mem, .. } => {
            Some((ResourceKey::Mem(mem), false))
        }
        NodeKind::WriteReg { reg, .. } => Some((ResourceKey::Reg(reg), true)),
        NodeKind::WriteRegFile { file, .. } => Some((ResourceKey::RegFile(file), true)),
        NodeKind::WriteMem { mem, .. } | NodeKind::Store { mem, .. } => {
            Some((ResourceKey::Mem(mem), true))
        }
        _ => None,
    }
}

fn analyze_graph(
    graph: &BehaviorGraph,
    instr: &str,
    arena: &Bump,
) -> LowerResult<Vec<HazardCapture>> {
    let doms = dominator_sets(graph, instr, arena)?;

    let mut reads_by_resource: HashMap<ResourceKey, Vec<NodeId>> = HashMap::new();
    let mut writes_by_resource: HashMap<ResourceKey, Vec<NodeId>> = HashMap::new();
    for id in graph.ids() {
        if let Some((key, is_write)) = resource_of(graph, id) {
            if is_write {
                writes_by_resource.entry(key).or_default().push(id);
            } else {
                reads_by_resource.entry(key).or_default().push(id);
            }
        }
    }

    let mut captures = Vec::new();
    let mut resources: Vec<ResourceKey> = reads_by_resource.keys().copied().collect();
    resources.sort();

    for key in resources {
        let reads = &reads_by_resource[&key];
        let writes = writes_by_resource.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        if writes.is_empty() {
            continue;
        }

        let mut write_anchors = Vec::new();
        for &write in writes {
            let anchor = write_anchor(graph, write).ok_or_else(|| {
                LowerError::invariant(instr, format!("write {} is not anchored", write))
            })?;
            write_anchors.push(anchor);
        }

        let mut conflicts: HashSet<NodeId> = HashSet::new();
        for &read in reads {
            conflicts.extend(control_users_of(graph, read));
        }

        // reads whose every consumer is dominated by every write observe a
        // consistent ordering; the dominator lists hold definite dominators
        // only, so this is a conservative check
        let unambiguous = conflicts
            .iter()
            .filter(|&c| !write_anchors.contains(c))
            .all(|c| {
                write_anchors
                    .iter()
                    .all(|w| doms.get(c).map(|d| d.contains(w)).unwrap_or(false))
            });
        if unambiguous {
            conflicts.clear();
        }
        conflicts.extend(write_anchors.iter().copied());

        if conflicts.len() <= 1 {
            continue;
        }

        let capture_at = lowest_common_dominator(&conflicts, &doms, instr)?;
        let mut flagged: Vec<NodeId> = reads.clone();
        flagged.sort();
        for read in flagged {
            captures.push(HazardCapture {
                resource: key,
                read,
                capture_at,
            });
        }
    }
    Ok(captures)
}

/// Intersect dominator lists in traversal order; the last common entry is the
/// deepest node dominating every conflict.
fn lowest_common_dominator(
    nodes: &HashSet<NodeId>,
    doms: &HashMap<NodeId, BumpVec<'_, NodeId>>,
    instr: &str,
) -> LowerResult<NodeId> {
    let mut chains = Vec::new();
    for node in nodes {
        let chain = doms.get(node).ok_or_else(|| {
            LowerError::invariant(instr, format!("{} has no dominator list", node))
        })?;
        chains.push(chain);
    }

    let first = chains[0];
    let mut last_common = None;
    for (i, &candidate) in first.iter().enumerate() {
        if chains
            .iter()
            .all(|chain| chain.get(i) == Some(&candidate))
        {
            last_common = Some(candidate);
        } else {
            break;
        }
    }
    last_common
        .ok_or_else(|| LowerError::invariant(instr, "conflict nodes share no dominator"))
}
