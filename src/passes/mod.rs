// This module defines the pass-manager contract of the lowering pipeline.
// Each pass receives the specification-wide model and the results of prior
// passes (looked up by pass identity) and deposits a typed result object other
// passes may read. The manager runs the fixed default pipeline in order:
// width normalization, extract-chain optimization, local simplification,
// memory access transformation, program-counter access conversion, resource-
// read hazard analysis, operation scheduling, variable assignment and
// variable allocation. In debug builds every instruction graph is structurally
// verified after each pass.

//! The lowering pipeline and its pass-manager contract.

pub mod alloc;
pub mod extract_opt;
pub mod memory;
pub mod normalize;
pub mod pc_access;
pub mod read_hazard;
pub mod schedule;
pub mod simplify;
pub mod var_assign;

use crate::core::error::{LowerError, LowerResult};
use crate::core::graph::Model;
use crate::core::session::LoweringSession;
use log::debug;
use std::any::Any;

pub use self::alloc::AllocatePass;
pub use self::extract_opt::ExtractOptPass;
pub use self::memory::MemoryAccessPass;
pub use self::normalize::NormalizePass;
pub use self::pc_access::PcAccessPass;
pub use self::read_hazard::ReadHazardPass;
pub use self::schedule::SchedulePass;
pub use self::simplify::SimplifyPass;
pub use self::var_assign::VarAssignPass;

/// One pass of the pipeline.
///
/// A pass either fully succeeds for every instruction or fails the whole
/// run; partial output is never left behind for a failed instruction.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(
        &mut self,
        model: &mut Model,
        session: &LoweringSession,
        results: &mut PassResults,
    ) -> LowerResult<()>;
}

/// Typed results deposited by completed passes, keyed by pass identity.
#[derive(Default)]
pub struct PassResults {
    map: hashbrown::HashMap<&'static str, Box<dyn Any>>,
}

impl PassResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any>(&mut self, pass: &'static str, value: T) {
        self.map.insert(pass, Box::new(value));
    }

    pub fn get<T: Any>(&self, pass: &'static str) -> LowerResult<&T> {
        self.map
            .get(pass)
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .ok_or(LowerError::MissingPassResult { pass })
    }

    pub fn get_mut<T: Any>(&mut self, pass: &'static str) -> LowerResult<&mut T> {
        self.map
            .get_mut(pass)
            .and_then(|boxed| boxed.downcast_mut::<T>())
            .ok_or(LowerError::MissingPassResult { pass })
    }
}

/// Runs a sequence of passes over the model, verifying graph structure
/// between passes in debug builds.
pub struct PassManager<'s, 'arena> {
    session: &'s LoweringSession<'arena>,
    passes: Vec<Box<dyn Pass>>,
    results: PassResults,
}

impl<'s, 'arena> PassManager<'s, 'arena> {
    pub fn new(session: &'s LoweringSession<'arena>) -> Self {
        PassManager {
            session,
            passes: Vec::new(),
            results: PassResults::new(),
        }
    }

    /// The full lowering pipeline in its canonical order.
    pub fn default_pipeline(session: &'s LoweringSession<'arena>) -> Self {
        let mut manager = Self::new(session);
        manager.add_pass(Box::new(NormalizePass));
        manager.add_pass(Box::new(ExtractOptPass));
        manager.add_pass(Box::new(SimplifyPass));
        manager.add_pass(Box::new(MemoryAccessPass));
        manager.add_pass(Box::new(PcAccessPass));
        manager.add_pass(Box::new(ReadHazardPass));
        manager.add_pass(Box::new(SchedulePass));
        manager.add_pass(Box::new(VarAssignPass));
        manager.add_pass(Box::new(AllocatePass));
        manager
    }

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn run(&mut self, model: &mut Model) -> LowerResult<()> {
        for pass in &mut self.passes {
            debug!("running pass `{}`", pass.name());
            pass.run(model, self.session, &mut self.results)?;
            if cfg!(debug_assertions) {
                for instr in &model.instructions {
                    instr.graph.verify(&instr.name)?;
                }
            }
        }
        self.session.update_stats(|s| {
            s.instructions_processed = model.instructions.len();
        });
        Ok(())
    }

    pub fn results(&self) -> &PassResults {
        &self.results
    }
}
