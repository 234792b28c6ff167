// This module assigns exactly one virtual variable to every scheduled node
// that defines a consumed value. Register and register-file variables are
// keyed by resource identity (register-file cells additionally by index
// expression and access direction, since writes may target a read-only-
// shadowed cell such as an architectural zero register); constants get a
// shared variable per value, every other expression a unique temporary. The
// assignment is SSA-shaped and not final: the allocation pass afterwards
// merges variables by coloring. Register and register-file variables also get
// an explicit getter operation at instruction start, so their architectural
// value is fetched once before any use.

use crate::core::error::{LowerError, LowerResult};
use crate::core::graph::{BehaviorGraph, Model, NodeId};
use crate::core::node::{Node, NodeKind, RegFileId, RegId, VarId, VarKind};
use crate::core::session::LoweringSession;
use crate::passes::{Pass, PassResults};
use hashbrown::HashMap;
use log::debug;

pub const NAME: &str = "var-assign";

/// One virtual variable.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub kind: VarKind,
    pub name: String,
    pub width: u8,
    /// Owning register file for `RegFileCell` variables.
    pub file: Option<RegFileId>,
}

/// Variable table of one instruction.
#[derive(Debug, Default)]
pub struct VarTable {
    vars: Vec<VarInfo>,
    reg_map: HashMap<RegId, VarId>,
    file_map: HashMap<(RegFileId, NodeId, bool), VarId>,
    tmp_map: HashMap<NodeId, VarId>,
    const_map: HashMap<(u64, u8), VarId>,
}

impl VarTable {
    fn alloc(&mut self, info: VarInfo) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(info);
        id
    }

    pub fn info(&self, var: VarId) -> &VarInfo {
        &self.vars[var.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &VarInfo)> {
        self.vars
            .iter()
            .enumerate()
            .map(|(i, info)| (VarId(i as u32), info))
    }

    pub fn vars_of_kind(&self, kind: VarKind) -> Vec<VarId> {
        self.iter()
            .filter(|(_, info)| info.kind == kind)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn file_cells_of(&self, file: RegFileId) -> Vec<VarId> {
        self.iter()
            .filter(|(_, info)| info.file == Some(file))
            .map(|(id, _)| id)
            .collect()
    }

    fn reg_var(&mut self, reg: RegId, width: u8) -> VarId {
        if let Some(&var) = self.reg_map.get(&reg) {
            return var;
        }
        let var = self.alloc(VarInfo {
            kind: VarKind::Reg,
            name: format!("reg_{}", reg.0),
            width,
            file: None,
        });
        self.reg_map.insert(reg, var);
        var
    }

    fn file_var(&mut self, file: RegFileId, index: NodeId, is_dest: bool, width: u8) -> VarId {
        let key = (file, index, is_dest);
        if let Some(&var) = self.file_map.get(&key) {
            return var;
        }
        let suffix = if is_dest { "_dest" } else { "" };
        let var = self.alloc(VarInfo {
            kind: VarKind::RegFileCell,
            name: format!("regfile_{}_{}{}", file.0, index, suffix),
            width,
            file: Some(file),
        });
        self.file_map.insert(key, var);
        var
    }

    fn tmp_var(&mut self, expr: NodeId, width: u8) -> VarId {
        if let Some(&var) = self.tmp_map.get(&expr) {
            return var;
        }
        let var = self.alloc(VarInfo {
            kind: VarKind::Temp,
            name: format!("tmp_{}", expr),
            width,
            file: None,
        });
        self.tmp_map.insert(expr, var);
        var
    }

    fn const_var(&mut self, value: u64, width: u8) -> VarId {
        let key = (value, width);
        if let Some(&var) = self.const_map.get(&key) {
            return var;
        }
        let var = self.alloc(VarInfo {
            kind: VarKind::Const,
            name: format!("const_{:#x}", value),
            width,
            file: None,
        });
        self.const_map.insert(key, var);
        var
    }
}

/// Variables of one instruction plus the node-to-variable map.
#[derive(Debug, Default)]
pub struct InstrVars {
    pub table: VarTable,
    pub assigned: HashMap<NodeId, VarId>,
}

impl InstrVars {
    pub fn var_of(&self, node: NodeId) -> Option<VarId> {
        self.assigned.get(&node).copied()
    }
}

/// Typed result: one entry per instruction, parallel to the model.
#[derive(Debug, Default)]
pub struct VarAssignment {
    pub per_instr: Vec<InstrVars>,
}

/// Names every scheduled value definition and inserts register getters.
pub struct VarAssignPass;

impl Pass for VarAssignPass {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(
        &mut self,
        model: &mut Model,
        session: &LoweringSession,
        results: &mut PassResults,
    ) -> LowerResult<()> {
        let width = session.config().width();
        let mut assignment = VarAssignment::default();
        let mut temps = 0;
        for instr in &mut model.instructions {
            let vars = assign_graph(&mut instr.graph, width, &instr.name)?;
            temps += vars.table.vars_of_kind(VarKind::Temp).len();
            assignment.per_instr.push(vars);
        }
        session.update_stats(|s| s.temporaries_before_allocation = temps);
        debug!("assigned variables for {} instructions", assignment.per_instr.len());
        results.insert(NAME, assignment);
        Ok(())
    }
}

fn assign_graph(graph: &mut BehaviorGraph, width: u8, instr: &str) -> LowerResult<InstrVars> {
    let mut vars = InstrVars::default();

    let anchors: Vec<NodeId> = graph
        .ids()
        .filter(|&id| {
            matches!(
                graph.node(id).kind,
                NodeKind::Scheduled { .. } | NodeKind::Exit { .. }
            )
        })
        .collect();
    for anchor in anchors {
        for dep in graph.node(anchor).value_inputs() {
            assign_dest(graph, &mut vars, dep, width, instr)?;
        }
    }

    insert_getters(graph, &vars);
    Ok(vars)
}

fn assign_dest(
    graph: &BehaviorGraph,
    vars: &mut InstrVars,
    dep: NodeId,
    width: u8,
    instr: &str,
) -> LowerResult<()> {
    if graph.schedule_marker(dep).is_none() {
        // only scheduled nodes define a variable
        return Ok(());
    }
    let var = match graph.node(dep).kind {
        NodeKind::ReadReg { reg } => Some(vars.table.reg_var(reg, width)),
        NodeKind::ReadRegFile { file, index } => {
            Some(vars.table.file_var(file, index, false, width))
        }
        NodeKind::WriteReg { reg, .. } => Some(vars.table.reg_var(reg, width)),
        NodeKind::WriteRegFile { file, index, .. } => {
            Some(vars.table.file_var(file, index, true, width))
        }
        NodeKind::WriteMem { .. } | NodeKind::Store { .. } => None,
        NodeKind::Const { value } => Some(vars.table.const_var(value, width)),
        NodeKind::ReadMem { .. }
        | NodeKind::Load { .. }
        | NodeKind::BuiltIn { .. }
        | NodeKind::Select { .. }
        | NodeKind::Extract { .. }
        | NodeKind::FieldExtract { .. } => Some(vars.table.tmp_var(dep, width)),
        NodeKind::StaticPc => None,
        _ => {
            return Err(LowerError::invariant(
                instr,
                format!("unexpected scheduled dependency {}", dep),
            ))
        }
    };
    if let Some(var) = var {
        vars.assigned.insert(dep, var);
    }
    Ok(())
}

/// Architectural values must be available before any use: fetch them into
/// their working variables right after the start node.
fn insert_getters(graph: &mut BehaviorGraph, vars: &InstrVars) {
    let start = graph.start();
    let mut getters: Vec<VarId> = vars
        .assigned
        .values()
        .copied()
        .filter(|&v| {
            matches!(
                vars.table.info(v).kind,
                VarKind::Reg | VarKind::RegFileCell
            )
        })
        .collect();
    getters.sort();
    getters.dedup();
    // descending insertion keeps the final chain in ascending order
    for &var in getters.iter().rev() {
        graph.insert_after(start, Node::control(NodeKind::GetVar { var }));
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::GraphBuilder;
    use crate::core::node::Op;
    use crate::passes::schedule::tests_support::schedule_for_tests;

    fn assigned(graph: &mut BehaviorGraph) -> InstrVars {
        schedule_for_tests(graph);
        assign_graph(graph, 64, "test").expect("assigns")
    }

    #[test]
    fn test_unique_temp_per_expression() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 32);
        let y = b.read_reg(RegId(2), 32);
        let sum = b.binary(Op::Add, 32, x, y);
        let diff = b.binary(Op::Sub, 32, x, y);
        b.write_reg(RegId(3), sum);
        b.write_reg(RegId(4), diff);
        let mut graph = b.finish();
        let vars = assigned(&mut graph);

        let sum_var = vars.var_of(sum).expect("sum named");
        let diff_var = vars.var_of(diff).expect("diff named");
        assert_ne!(sum_var, diff_var);
        assert_eq!(vars.table.info(sum_var).kind, VarKind::Temp);
    }

    #[test]
    fn test_read_and_write_of_same_register_share_variable() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 32);
        let one = b.konst(1, 32);
        let sum = b.binary(Op::Add, 32, x, one);
        let write = b.write_reg(RegId(1), sum);
        let mut graph = b.finish();
        let vars = assigned(&mut graph);

        assert_eq!(vars.var_of(x), vars.var_of(write));
        assert_eq!(vars.table.info(vars.var_of(x).unwrap()).kind, VarKind::Reg);
    }

    #[test]
    fn test_reg_file_write_direction_split() {
        let mut b = GraphBuilder::new();
        let idx = b.konst(3, 8);
        let value = b.read_reg_file(RegFileId(0), idx, 32);
        let one = b.konst(1, 32);
        let sum = b.binary(Op::Add, 32, value, one);
        let write = b.write_reg_file(RegFileId(0), idx, sum);
        let mut graph = b.finish();
        let vars = assigned(&mut graph);

        let read_var = vars.var_of(value).expect("read named");
        let write_var = vars.var_of(write).expect("write named");
        // same cell, opposite direction: distinct variables
        assert_ne!(read_var, write_var);
        assert_eq!(vars.table.info(read_var).kind, VarKind::RegFileCell);
        assert_eq!(vars.table.info(write_var).kind, VarKind::RegFileCell);
    }

    #[test]
    fn test_getters_inserted_for_architectural_variables() {
        let mut b = GraphBuilder::new();
        let x = b.read_reg(RegId(1), 32);
        b.write_reg(RegId(2), x);
        let mut graph = b.finish();
        let vars = assigned(&mut graph);

        let start = graph.start();
        let mut cur = graph.node(start).succ;
        let mut getter_vars = Vec::new();
        while let Some(id) = cur {
            match graph.node(id).kind {
                NodeKind::GetVar { var } => getter_vars.push(var),
                _ => break,
            }
            cur = graph.node(id).succ;
        }
        // both the read and written registers are fetched up front
        assert_eq!(getter_vars.len(), 2);
        for var in getter_vars {
            assert!(matches!(
                vars.table.info(var).kind,
                VarKind::Reg | VarKind::RegFileCell
            ));
        }
    }

    #[test]
    fn test_unscheduled_expression_gets_no_variable() {
        let mut b = GraphBuilder::new();
        let a = b.konst(2, 32);
        let bb = b.konst(3, 32);
        let sum = b.binary(Op::Add, 32, a, bb);
        b.write_reg(RegId(3), sum);
        let mut graph = b.finish();
        let vars = assigned(&mut graph);

        assert!(vars.var_of(sum).is_none());
    }
}
