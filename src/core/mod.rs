// This module serves as the central hub for oplower's core infrastructure,
// providing the building blocks shared by every pass of the lowering pipeline.
// It exports and organizes the key subsystems: the behavior-graph model (slot
// arena with stable node ids, usage tracking and structural verification), the
// node vocabulary (expression, side-effect and control-skeleton kinds plus the
// operator and conversion enums), the graph builder used by the upstream front
// end and by tests, session management (bumpalo arena, run statistics, target
// width configuration), the generic worklist dataflow framework, and the error
// types. All components operate on one instruction's graph at a time; no graph
// is shared across instructions and every pass owns exclusive write access to
// the graph while it runs.

//! Core oplower infrastructure.
//!
//! This module provides the fundamental building blocks for behavior-graph
//! lowering, shared by every pass in the pipeline.
//!
//! # Key Components
//!
//! ## Behavior Graph (`graph`, `node`)
//! - Slot-arena storage addressed by stable [`NodeId`]s
//! - Usage (incoming edge) tracking for rewrites and deletions
//! - Structural verification of the control skeleton
//!
//! ## Graph Construction (`builder`)
//! - Programmatic construction of valid behavior graphs
//! - Stands in for the upstream front end in tests
//!
//! ## Session Management (`session`)
//! - Arena-based allocation using `bumpalo`
//! - Target width configuration and run statistics
//!
//! ## Dataflow (`dataflow`)
//! - Generic forward/backward worklist analysis over the control skeleton
//! - Used by the liveness analysis of the allocation pass

pub mod builder;
pub mod dataflow;
pub mod error;
pub mod graph;
pub mod node;
pub mod session;

// Re-export core components
pub use builder::GraphBuilder;

pub use dataflow::{Direction, FlowAnalysis, FlowResult};

pub use error::{LowerError, LowerResult};

pub use graph::{BehaviorGraph, Instruction, Model, NodeId};

pub use node::{Extend, MemId, Node, NodeKind, Op, RegFileId, RegId, VarId, VarKind};

pub use session::{LowerConfig, LoweringSession, RunStats, TargetWidth};
