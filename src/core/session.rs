// This module provides arena-based session management for a lowering run using
// the bumpalo crate. LoweringSession owns the arena allocator, the read-only
// run configuration (target register width) and the run statistics. All
// interned strings share the session lifetime, which keeps diagnostic and
// variable-name storage out of the per-instruction graphs. RunStats tracks
// counters the passes update as they rewrite graphs: nodes inserted and
// deleted, conversion nodes folded away, and the number of temporaries before
// and after allocation.

//! Arena-based lowering session management.

use bumpalo::Bump;
use std::cell::RefCell;

/// Target register width of the downstream code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetWidth {
    W32,
    W64,
}

impl TargetWidth {
    pub fn bits(self) -> u8 {
        match self {
            TargetWidth::W32 => 32,
            TargetWidth::W64 => 64,
        }
    }
}

/// Read-only configuration of a lowering run.
#[derive(Debug, Clone, Copy)]
pub struct LowerConfig {
    target: TargetWidth,
}

impl LowerConfig {
    pub fn new(target: TargetWidth) -> Self {
        LowerConfig { target }
    }

    pub fn target_width(&self) -> TargetWidth {
        self.target
    }

    /// Target width in bits.
    pub fn width(&self) -> u8 {
        self.target.bits()
    }
}

/// Statistics gathered over one lowering run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    pub instructions_processed: usize,
    pub nodes_inserted: usize,
    pub nodes_deleted: usize,
    pub conversions_folded: usize,
    pub reads_captured: usize,
    pub operations_scheduled: usize,
    pub temporaries_before_allocation: usize,
    pub temporaries_after_allocation: usize,
}

/// Arena-based lowering session.
///
/// Owns the arena, the run configuration and the statistics; shared read-only
/// by every pass of a run.
pub struct LoweringSession<'arena> {
    arena: &'arena Bump,
    config: LowerConfig,
    stats: RefCell<RunStats>,
    interned: RefCell<hashbrown::HashMap<String, &'arena str>>,
}

impl<'arena> LoweringSession<'arena> {
    pub fn new(arena: &'arena Bump, config: LowerConfig) -> Self {
        LoweringSession {
            arena,
            config,
            stats: RefCell::new(RunStats::default()),
            interned: RefCell::new(hashbrown::HashMap::new()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn config(&self) -> &LowerConfig {
        &self.config
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut interned = self.interned.borrow_mut();
        if let Some(&existing) = interned.get(s) {
            return existing;
        }
        let stored = self.arena.alloc_str(s);
        interned.insert(s.to_string(), stored);
        stored
    }

    pub fn stats(&self) -> RunStats {
        *self.stats.borrow()
    }

    pub fn update_stats(&self, f: impl FnOnce(&mut RunStats)) {
        f(&mut self.stats.borrow_mut());
    }
}
