// This module defines error types for the oplower pipeline using the thiserror
// crate for idiomatic Rust error handling. LowerError is the main error enum
// covering the three failure classes of the pipeline: unsupported constructs
// (an operator or node shape a pass has no rule for), invariant violations
// (structural assumptions broken by upstream input or a prior pass), and
// illegal specifications (architecturally invalid constructs surfaced as
// user-facing diagnostics). Each variant carries the offending instruction and
// enough node context for debugging. There is no recovery or retry: a pass
// either fully succeeds for an instruction or the whole generation run fails.

//! Error types for the oplower pipeline.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Main error type for behavior-graph lowering.
#[derive(Error, Debug)]
pub enum LowerError {
    #[error("unsupported {construct} in `{instr}`: {detail}")]
    UnsupportedConstruct {
        construct: &'static str,
        instr: String,
        detail: String,
    },

    #[error("invariant violation in `{instr}`: {detail}")]
    InvariantViolation { instr: String, detail: String },

    #[error("illegal specification in `{instr}`: {detail}")]
    IllegalSpec { instr: String, detail: String },

    #[error("malformed behavior graph in `{instr}`: {detail}")]
    MalformedGraph { instr: String, detail: String },

    #[error("missing result of pass `{pass}`")]
    MissingPassResult { pass: &'static str },
}

impl LowerError {
    /// Invariant violation with instruction context.
    pub fn invariant(instr: &str, detail: impl Into<String>) -> Self {
        LowerError::InvariantViolation {
            instr: instr.to_string(),
            detail: detail.into(),
        }
    }

    /// Illegal-specification diagnostic with instruction context.
    pub fn illegal(instr: &str, detail: impl Into<String>) -> Self {
        LowerError::IllegalSpec {
            instr: instr.to_string(),
            detail: detail.into(),
        }
    }

    /// Unsupported-construct diagnostic with instruction context.
    pub fn unsupported(construct: &'static str, instr: &str, detail: impl Into<String>) -> Self {
        LowerError::UnsupportedConstruct {
            construct,
            instr: instr.to_string(),
            detail: detail.into(),
        }
    }
}

/// Result type alias for lowering operations.
pub type LowerResult<T> = Result<T, LowerError>;
