//! oplower - Behavior-graph lowering for fixed-width code generators.
//!
//! oplower is the backend of a retargetable instruction-set-description
//! toolchain. An upstream front end describes each processor instruction
//! declaratively and lowers it into a per-instruction *behavior graph*: a
//! control skeleton plus a data-dependency graph describing what the
//! instruction computes. This crate rewrites that graph, pass by pass, until
//! every operation that must materialize at runtime is a fixed-width
//! (32/64-bit) operation with an explicit position in the control order and
//! an assigned virtual variable, ready for an external JIT code generator.
//!
//! # Primary Usage
//!
//! ```ignore
//! use oplower::core::{LowerConfig, LoweringSession, TargetWidth};
//! use oplower::passes::PassManager;
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = LoweringSession::new(&arena, LowerConfig::new(TargetWidth::W64));
//!
//! let mut manager = PassManager::default_pipeline(&session);
//! manager.run(&mut model)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Shared infrastructure (behavior graph, session, dataflow)
//! - [`passes`] - The lowering pipeline (normalization through allocation)

pub mod core;
pub mod passes;

// Re-export common types from organized modules
pub use crate::core::{
    // Graph model
    BehaviorGraph, GraphBuilder, Instruction, Model, Node, NodeId, NodeKind,
    // Operators and conversions
    Extend, Op,
    // Resources
    MemId, RegFileId, RegId,
    // Session management
    LowerConfig, LoweringSession, RunStats, TargetWidth,
    // Error handling
    LowerError, LowerResult,
};
pub use passes::{Pass, PassManager, PassResults};
