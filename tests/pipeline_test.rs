// This test suite runs the full lowering pipeline over small but realistic
// instruction behaviors and checks the contract every downstream emitter
// relies on: the pass manager completes, every pass result is retrievable by
// pass identity, scheduled operands appear strictly before their users in the
// control order, conditional writes racing with later reads are flagged by
// the hazard analysis, and allocation only ever shrinks the set of
// temporaries while keeping interfering variables apart.

//! End-to-end pipeline tests over the pass manager.

use bumpalo::Bump;
use oplower::core::{
    GraphBuilder, LowerConfig, LoweringSession, Model, NodeId, NodeKind, TargetWidth, VarKind,
};
use oplower::passes::var_assign::VarAssignment;
use oplower::passes::{read_hazard, schedule, var_assign, PassManager};
use oplower::{Op, RegFileId, RegId};

const PC: RegId = RegId(0);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// rd := rs1 + rs2 over a register file, with a fall-through PC update.
fn alu_instruction(name: &str) -> oplower::Instruction {
    let mut b = GraphBuilder::new();
    let rs1 = b.konst(1, 5);
    let rs2 = b.konst(2, 5);
    let rd = b.konst(3, 5);
    let a = b.read_reg_file(RegFileId(0), rs1, 32);
    let bb = b.read_reg_file(RegFileId(0), rs2, 32);
    let sum = b.binary(Op::Add, 32, a, bb);
    b.write_reg_file(RegFileId(0), rd, sum);
    let pc = b.read_reg(PC, 64);
    let four = b.konst(4, 64);
    let next = b.binary(Op::Add, 64, pc, four);
    b.exit_pc(PC, next);
    b.finish_instruction(name)
}

/// Conditional register write followed by a use of the old value.
fn hazard_instruction(name: &str) -> oplower::Instruction {
    let mut b = GraphBuilder::new();
    let r = b.read_reg(RegId(1), 32);
    let zero = b.konst(0, 32);
    let cond = b.binary(Op::Eq, 1, r, zero);
    let seven = b.konst(7, 32);
    b.if_else(
        cond,
        |b| {
            b.write_reg(RegId(1), seven);
        },
        |_| {},
    );
    b.write_reg(RegId(2), r);
    b.finish_instruction(name)
}

/// Indirect jump through a register.
fn jump_instruction(name: &str) -> oplower::Instruction {
    let mut b = GraphBuilder::new();
    let target = b.read_reg(RegId(5), 64);
    b.exit_pc(PC, target);
    b.finish_instruction(name)
}

#[test]
fn test_pipeline_completes_and_results_are_typed() {
    init_logging();
    let arena = Bump::new();
    let session = LoweringSession::new(&arena, LowerConfig::new(TargetWidth::W64));
    let mut model = Model::new(PC);
    model.instructions.push(alu_instruction("alu"));
    model.instructions.push(hazard_instruction("hazard"));
    model.instructions.push(jump_instruction("jump"));

    let mut manager = PassManager::default_pipeline(&session);
    manager.run(&mut model).expect("pipeline succeeds");

    let hazards = manager
        .results()
        .get::<read_hazard::HazardReport>(read_hazard::NAME)
        .expect("hazard result stored");
    assert!(hazards.captures_for("alu").is_empty());
    assert_eq!(hazards.captures_for("hazard").len(), 1);

    let vars = manager
        .results()
        .get::<VarAssignment>(var_assign::NAME)
        .expect("assignment stored");
    assert_eq!(vars.per_instr.len(), 3);

    for instr in &model.instructions {
        instr.graph.verify(&instr.name).expect("graph stays valid");
    }
}

#[test]
fn test_scheduled_operands_precede_their_users() {
    init_logging();
    let arena = Bump::new();
    let session = LoweringSession::new(&arena, LowerConfig::new(TargetWidth::W64));
    let mut model = Model::new(PC);
    model.instructions.push(alu_instruction("alu"));

    let mut manager = PassManager::default_pipeline(&session);
    manager.run(&mut model).expect("pipeline succeeds");

    let graph = &model.instructions[0].graph;
    let order = schedule::scheduled_order(graph);
    let position: std::collections::HashMap<NodeId, usize> = order
        .iter()
        .enumerate()
        .map(|(i, &dep)| (dep, i))
        .collect();

    for (&dep, &pos) in &position {
        for input in graph.node(dep).value_inputs() {
            if let Some(&input_pos) = position.get(&input) {
                assert!(
                    input_pos < pos,
                    "operand {} of {} scheduled at {} but used at {}",
                    input,
                    dep,
                    input_pos,
                    pos
                );
            }
        }
    }
}

#[test]
fn test_static_exit_unscheduled_dynamic_exit_scheduled() {
    init_logging();
    let arena = Bump::new();
    let session = LoweringSession::new(&arena, LowerConfig::new(TargetWidth::W64));
    let mut model = Model::new(PC);
    model.instructions.push(alu_instruction("alu"));
    model.instructions.push(jump_instruction("jump"));

    let mut manager = PassManager::default_pipeline(&session);
    manager.run(&mut model).expect("pipeline succeeds");

    let pc_write_scheduled = |graph: &oplower::BehaviorGraph| {
        graph.ids().any(|id| {
            matches!(graph.node(id).kind, NodeKind::Scheduled { dep }
                if matches!(graph.node(dep).kind, NodeKind::WriteReg { reg, .. } if reg == PC))
        })
    };
    // the fall-through exit needs no PC operation, the indirect jump does
    assert!(!pc_write_scheduled(&model.instructions[0].graph));
    assert!(pc_write_scheduled(&model.instructions[1].graph));
}

#[test]
fn test_allocation_shrinks_temporaries_and_frees_survivors() {
    init_logging();
    let arena = Bump::new();
    let session = LoweringSession::new(&arena, LowerConfig::new(TargetWidth::W64));
    let mut model = Model::new(PC);
    model.instructions.push(alu_instruction("alu"));
    model.instructions.push(hazard_instruction("hazard"));

    let mut manager = PassManager::default_pipeline(&session);
    manager.run(&mut model).expect("pipeline succeeds");

    let stats = session.stats();
    assert!(stats.temporaries_after_allocation <= stats.temporaries_before_allocation);

    // every released variable is a temporary, released exactly once
    let vars = manager
        .results()
        .get::<VarAssignment>(var_assign::NAME)
        .expect("assignment stored");
    for (instr, instr_vars) in model.instructions.iter().zip(&vars.per_instr) {
        let mut freed = Vec::new();
        for id in instr.graph.ids() {
            if let NodeKind::FreeVar { var } = instr.graph.node(id).kind {
                freed.push(var);
            }
        }
        let unique: std::collections::HashSet<_> = freed.iter().copied().collect();
        assert_eq!(unique.len(), freed.len());
        for var in freed {
            assert_eq!(instr_vars.table.info(var).kind, VarKind::Temp);
        }
    }
}

#[test]
fn test_getters_precede_all_operations() {
    init_logging();
    let arena = Bump::new();
    let session = LoweringSession::new(&arena, LowerConfig::new(TargetWidth::W64));
    let mut model = Model::new(PC);
    model.instructions.push(alu_instruction("alu"));

    let mut manager = PassManager::default_pipeline(&session);
    manager.run(&mut model).expect("pipeline succeeds");

    let graph = &model.instructions[0].graph;
    let mut cur = graph.node(graph.start()).succ;
    let mut seen_operation = false;
    while let Some(id) = cur {
        match graph.node(id).kind {
            NodeKind::GetVar { .. } => {
                assert!(!seen_operation, "getter after a scheduled operation");
            }
            NodeKind::Scheduled { .. } => seen_operation = true,
            _ => {}
        }
        cur = graph.node(id).succ;
    }
    assert!(seen_operation);
}
