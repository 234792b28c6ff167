// This module minimizes temporary variables. Live ranges of the SSA-shaped
// variables are computed by a backward may-analysis over the scheduled
// control order; every variable defined at a node interferes with everything
// live out of it. Greedy first-fit coloring then merges variables: each color
// picks an existing register, register-file or constant variable as its
// representative when one exists, and all same-color temporaries are
// redirected to it. Register, register-file and constant variables survive
// the instruction, so they seed the live set at the instruction end; reading
// any cell of a register file keeps every variable of that file alive, since
// the concrete index is unknown. A release operation is placed at the
// instruction end for every color whose representative stays a temporary.

use crate::core::dataflow::{self, Direction, FlowAnalysis};
use crate::core::error::{LowerError, LowerResult};
use crate::core::graph::{BehaviorGraph, Model, NodeId};
use crate::core::node::{Node, NodeKind, VarId, VarKind};
use crate::core::session::LoweringSession;
use crate::passes::var_assign::{self, InstrVars, VarAssignment};
use crate::passes::{Pass, PassResults};
use hashbrown::{HashMap, HashSet};
use log::debug;
use std::collections::BTreeSet;

pub const NAME: &str = "allocate";

/// Final allocation of one instruction.
#[derive(Debug, Default)]
pub struct InstrAllocation {
    pub colors: HashMap<VarId, u32>,
    pub representative: HashMap<u32, VarId>,
    pub colors_used: usize,
    pub temps_after: usize,
}

/// Typed result: one entry per instruction, parallel to the model.
#[derive(Debug, Default)]
pub struct Allocation {
    pub per_instr: Vec<InstrAllocation>,
}

/// Merges variables via liveness, interference and greedy coloring.
pub struct AllocatePass;

impl Pass for AllocatePass {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(
        &mut self,
        model: &mut Model,
        session: &LoweringSession,
        results: &mut PassResults,
    ) -> LowerResult<()> {
        let assignment = results.get_mut::<VarAssignment>(var_assign::NAME)?;
        if assignment.per_instr.len() != model.instructions.len() {
            return Err(LowerError::MissingPassResult {
                pass: var_assign::NAME,
            });
        }

        let mut allocation = Allocation::default();
        let mut temps_after = 0;
        for (instr, vars) in model
            .instructions
            .iter_mut()
            .zip(assignment.per_instr.iter_mut())
        {
            let alloc = allocate_graph(&mut instr.graph, vars, &instr.name)?;
            temps_after += alloc.temps_after;
            allocation.per_instr.push(alloc);
        }
        session.update_stats(|s| s.temporaries_after_allocation = temps_after);
        debug!("{} temporaries survive allocation", temps_after);
        results.insert(NAME, allocation);
        Ok(())
    }
}

/// Variables defined by a control node.
fn defined_vars(graph: &BehaviorGraph, vars: &InstrVars, node: NodeId) -> Vec<VarId> {
    match graph.node(node).kind {
        NodeKind::Scheduled { dep } => vars.var_of(dep).into_iter().collect(),
        NodeKind::GetVar { var } => vec![var],
        _ => Vec::new(),
    }
}

/// Variables a control node reads.
fn used_vars(graph: &BehaviorGraph, vars: &InstrVars, node: NodeId) -> Vec<VarId> {
    let scheduled_input_vars = |dep: NodeId| -> Vec<VarId> {
        graph
            .node(dep)
            .value_inputs()
            .into_iter()
            .filter(|&i| graph.schedule_marker(i).is_some())
            .filter_map(|i| vars.var_of(i))
            .collect()
    };

    match graph.node(node).kind {
        NodeKind::Scheduled { dep } => {
            let mut used = scheduled_input_vars(dep);
            match graph.node(dep).kind {
                NodeKind::ReadReg { .. } => used.extend(vars.var_of(dep)),
                NodeKind::ReadRegFile { file, .. } => {
                    used.extend(vars.var_of(dep));
                    // the concrete index is unknown: no sibling cell of this
                    // file may be treated as dead
                    used.extend(vars.table.file_cells_of(file));
                }
                _ => {}
            }
            used
        }
        // non-operation control nodes read whatever their inputs define
        _ => graph
            .node(node)
            .value_inputs()
            .into_iter()
            .filter(|&i| graph.schedule_marker(i).is_some())
            .filter_map(|i| vars.var_of(i))
            .collect(),
    }
}

/// Backward may-analysis over the control skeleton.
struct Liveness<'v> {
    vars: &'v InstrVars,
}

impl FlowAnalysis for Liveness<'_> {
    type Value = BTreeSet<VarId>;

    fn direction(&self) -> Direction {
        Direction::Backward
    }

    fn initial(&self) -> Self::Value {
        BTreeSet::new()
    }

    fn meet(&self, values: &[&Self::Value]) -> Self::Value {
        let mut result = BTreeSet::new();
        for v in values {
            result.extend(v.iter().copied());
        }
        result
    }

    fn transfer(&self, graph: &BehaviorGraph, node: NodeId, input: &Self::Value) -> Self::Value {
        if matches!(graph.node(node).kind, NodeKind::End) {
            // architectural state and materialized constants survive the
            // instruction
            return self
                .vars
                .table
                .iter()
                .filter(|(_, info)| info.kind != VarKind::Temp)
                .map(|(id, _)| id)
                .collect();
        }
        let mut out = input.clone();
        for def in defined_vars(graph, self.vars, node) {
            out.remove(&def);
        }
        out.extend(used_vars(graph, self.vars, node));
        out
    }
}

fn allocate_graph(
    graph: &mut BehaviorGraph,
    vars: &mut InstrVars,
    instr: &str,
) -> LowerResult<InstrAllocation> {
    let live = dataflow::analyze(&Liveness { vars }, graph);

    // interference: a definition conflicts with everything live after it
    let mut adjacency: HashMap<VarId, HashSet<VarId>> = HashMap::new();
    let control: Vec<NodeId> = graph
        .ids()
        .filter(|&id| graph.node(id).is_control())
        .collect();
    for &node in &control {
        for def in defined_vars(graph, vars, node) {
            for &other in live.value_out(node) {
                if other != def {
                    adjacency.entry(def).or_default().insert(other);
                    adjacency.entry(other).or_default().insert(def);
                }
            }
        }
    }

    // greedy first-fit coloring in variable order
    let mut colors: HashMap<VarId, u32> = HashMap::new();
    let mut colors_used = 0;
    for (var, _) in vars.table.iter() {
        let neighbor_colors: HashSet<u32> = adjacency
            .get(&var)
            .map(|ns| ns.iter().filter_map(|n| colors.get(n).copied()).collect())
            .unwrap_or_default();
        let mut color = 0u32;
        while neighbor_colors.contains(&color) {
            color += 1;
        }
        colors.insert(var, color);
        colors_used = colors_used.max(color as usize + 1);
    }

    // per color, an architectural or constant variable is the representative
    let mut representative: HashMap<u32, VarId> = HashMap::new();
    for (var, info) in vars.table.iter() {
        if info.kind == VarKind::Temp {
            continue;
        }
        let color = colors[&var];
        if let Some(&previous) = representative.get(&color) {
            return Err(LowerError::invariant(
                instr,
                format!(
                    "non-sharable variables `{}` and `{}` share color {}",
                    vars.table.info(previous).name,
                    info.name,
                    color
                ),
            ));
        }
        representative.insert(color, var);
    }
    for (var, info) in vars.table.iter() {
        if info.kind == VarKind::Temp {
            representative.entry(colors[&var]).or_insert(var);
        }
    }

    // redirect every node to its color's representative
    for var in vars.assigned.values_mut() {
        let rep = representative[&colors[var]];
        *var = rep;
    }

    // release surviving temporaries at the instruction end
    let end = graph.end();
    let mut temp_reps: Vec<VarId> = representative
        .values()
        .copied()
        .filter(|&v| vars.table.info(v).kind == VarKind::Temp)
        .collect();
    temp_reps.sort();
    temp_reps.dedup();
    for &var in temp_reps.iter().rev() {
        graph
            .insert_before(end, Node::control(NodeKind::FreeVar { var }))
            .ok_or_else(|| {
                LowerError::invariant(instr, "instruction end has no directional predecessor")
            })?;
    }

    Ok(InstrAllocation {
        colors,
        colors_used,
        temps_after: temp_reps.len(),
        representative,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::GraphBuilder;
    use crate::core::node::{Op, RegFileId, RegId};
    use crate::passes::schedule::tests_support::schedule_for_tests;
    use crate::passes::var_assign::tests_support::assign_for_tests;

    fn lower(graph: &mut BehaviorGraph) -> (InstrVars, InstrAllocation) {
        schedule_for_tests(graph);
        let mut vars = assign_for_tests(graph);
        let alloc = allocate_graph(graph, &mut vars, "test").expect("allocates");
        (vars, alloc)
    }

    #[test]
    fn test_no_two_live_variables_share_a_color() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 32);
        let y = b.read_reg(RegId(2), 32);
        let sum = b.binary(Op::Add, 32, x, y);
        b.write_reg(RegId(3), sum);
        let mut graph = b.finish();
        let (vars, alloc) = lower(&mut graph);

        // the two register reads are simultaneously live: distinct colors
        let x_var = vars.var_of(x).unwrap();
        let y_var = vars.var_of(y).unwrap();
        assert_ne!(alloc.colors[&x_var], alloc.colors[&y_var]);
    }

    #[test]
    fn test_temporary_reuses_written_register_variable() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 32);
        let one = b.konst(1, 32);
        let sum = b.binary(Op::Add, 32, x, one);
        let write = b.write_reg(RegId(2), sum);
        let mut graph = b.finish();
        let (vars, alloc) = lower(&mut graph);

        // the sum temporary dies into the write: it shares the written
        // register's variable and no temporary survives
        let sum_var = vars.var_of(sum).unwrap();
        let write_var = vars.var_of(write).unwrap();
        assert_eq!(sum_var, write_var);
        assert_eq!(vars.table.info(sum_var).kind, VarKind::Reg);
        assert_eq!(alloc.temps_after, 0);
    }

    #[test]
    fn test_surviving_temporary_is_released_at_end() {
        let mut b = GraphBuilder::new();
        let addr = b.konst(0x40, 32);
        let loaded = b.read_mem(crate::core::node::MemId(0), addr, 32);
        b.write_mem(crate::core::node::MemId(0), addr, loaded, 32);
        let mut graph = b.finish();
        let (vars, alloc) = lower(&mut graph);

        // the loaded value has no architectural variable to merge into
        assert_eq!(alloc.temps_after, 1);
        let frees: Vec<VarId> = graph
            .ids()
            .filter_map(|id| match graph.node(id).kind {
                NodeKind::FreeVar { var } => Some(var),
                _ => None,
            })
            .collect();
        assert_eq!(frees.len(), 1);
        assert_eq!(vars.table.info(frees[0]).kind, VarKind::Temp);
    }

    #[test]
    fn test_reg_file_cells_never_merge_with_each_other() {
        let mut b = GraphBuilder::new();
        let i = b.konst(1, 8);
        let j = b.konst(2, 8);
        let a = b.read_reg_file(RegFileId(0), i, 32);
        let bb = b.read_reg_file(RegFileId(0), j, 32);
        let sum = b.binary(Op::Add, 32, a, bb);
        b.write_reg_file(RegFileId(0), i, sum);
        let mut graph = b.finish();
        let (vars, alloc) = lower(&mut graph);

        let a_var = vars.var_of(a).unwrap();
        let b_var = vars.var_of(bb).unwrap();
        assert_ne!(alloc.colors[&a_var], alloc.colors[&b_var]);
    }

    #[test]
    fn test_temporary_count_never_grows() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 32);
        let y = b.read_reg(RegId(2), 32);
        let sum = b.binary(Op::Add, 32, x, y);
        let shifted = b.binary(Op::Lsl, 32, sum, y);
        b.write_reg(RegId(3), shifted);
        let mut graph = b.finish();
        schedule_for_tests(&mut graph);
        let mut vars = assign_for_tests(&mut graph);
        let temps_before = vars.table.vars_of_kind(VarKind::Temp).len();
        let alloc = allocate_graph(&mut graph, &mut vars, "test").expect("allocates");
        assert!(alloc.temps_after <= temps_before);
    }
}
