// This module distinguishes statically-known from dynamically-known control
// transfers. Reads of the architectural program counter become StaticPc
// references: the PC of the current instruction is known at translation time
// and is realized as direct access to interpreter context state, not as an
// operation. For every instruction exit the pass checks whether the new PC
// value transitively depends on an architectural resource read; only such
// dynamic targets force the PC write to be materialized, by scheduling it
// immediately before the exit. Statically-derivable targets (PC plus
// instruction length) need no operation at all.

use crate::core::error::{LowerError, LowerResult};
use crate::core::graph::{BehaviorGraph, Model, NodeId};
use crate::core::node::{Node, NodeKind, RegId};
use crate::core::session::LoweringSession;
use crate::passes::{Pass, PassResults};
use log::debug;

pub const NAME: &str = "pc-access";

/// Converts PC reads to translation-time references and forces scheduling of
/// dynamic control-transfer writes.
pub struct PcAccessPass;

impl Pass for PcAccessPass {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(
        &mut self,
        model: &mut Model,
        _session: &LoweringSession,
        _results: &mut PassResults,
    ) -> LowerResult<()> {
        let pc = model.pc;
        let mut dynamic_exits = 0;
        for instr in &mut model.instructions {
            dynamic_exits += convert_graph(&mut instr.graph, pc, &instr.name)?;
        }
        debug!("{} instruction exits require a materialized PC write", dynamic_exits);
        Ok(())
    }
}

fn convert_graph(graph: &mut BehaviorGraph, pc: RegId, instr: &str) -> LowerResult<usize> {
    let pc_reads: Vec<NodeId> = graph
        .ids()
        .filter(|&id| matches!(graph.node(id).kind, NodeKind::ReadReg { reg } if reg == pc))
        .collect();
    for read in pc_reads {
        let width = graph.node(read).width;
        let static_pc = graph.add(Node::dep(NodeKind::StaticPc, width, false));
        graph.replace_and_delete(read, static_pc);
    }

    let exits: Vec<NodeId> = graph
        .ids()
        .filter(|&id| matches!(graph.node(id).kind, NodeKind::Exit { .. }))
        .collect();
    let mut dynamic = 0;
    for exit in exits {
        let pc_write = match graph.node(exit).kind {
            NodeKind::Exit { pc_write } => pc_write,
            _ => unreachable!(),
        };
        let target = match graph.node(pc_write).kind {
            NodeKind::WriteReg { reg, value } if reg == pc => value,
            _ => {
                return Err(LowerError::invariant(
                    instr,
                    format!("exit {} does not carry a PC write", exit),
                ))
            }
        };

        if !graph.depends_on_resource_read(target) {
            // translation-time-derivable target: the emitter encodes it
            // directly, no operation is scheduled
            continue;
        }
        dynamic += 1;
        if graph.schedule_marker(pc_write).is_none() {
            graph
                .insert_before(exit, Node::control(NodeKind::Scheduled { dep: pc_write }))
                .ok_or_else(|| {
                    LowerError::invariant(
                        instr,
                        format!("exit {} has no directional predecessor", exit),
                    )
                })?;
        }
    }
    Ok(dynamic)
}
