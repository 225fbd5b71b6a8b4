//! Errors that stop (part of) an analysis, and diagnostics that merely get recorded.

use crate::block::CodeLocation;
use crate::processor_state::ProcessorState;
use crate::variable::VariableIdent;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    #[error("function {func_addr:#x} has no blocks to analyze")]
    EmptyFunction { func_addr: u64 },
    #[error("no block at {addr:#x}")]
    MissingBlock { addr: u64 },
    #[error("unsupported expression `{expr}` at {loc:?}")]
    UnsupportedExpression { loc: CodeLocation, expr: String },
    #[error("malformed instruction at {addr:#x}: {reason}")]
    MalformedInstruction { addr: u64, reason: String },
    #[error("temporary t{idx} read before being written at {loc:?}")]
    UndefinedTemporary { loc: CodeLocation, idx: usize },
    #[error("invalid listing, line {line}: {reason}")]
    InvalidListing { line: usize, reason: String },
}

/// A non-fatal finding. Collected into the analysis result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// Two differing processor states met at `block`; resolved by the merge fallback rules
    InconsistentMerge {
        block: u64,
        left: ProcessorState,
        right: ProcessorState,
    },
    /// More than one variable covered a stack read; the first was used
    OverlappingVariables {
        loc: CodeLocation,
        offset: i64,
        candidates: Vec<VariableIdent>,
    },
    /// Evaluation of a statement failed and continued with an unbound result
    DegradedEvaluation { error: RecoveryError },
    /// A call site with no usable stack delta for its callee
    UnknownCallingConvention { call_site: u64, callee: Option<u64> },
    /// `block` was not revisited after reaching the per-node iteration cap
    IterationCapReached { block: u64, iterations: usize },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Diagnostic::InconsistentMerge { block, left, right } => write!(
                f,
                "inconsistent processor states merged at {:#x}: {:?} vs {:?}",
                block, left, right
            ),
            Diagnostic::OverlappingVariables {
                loc,
                offset,
                candidates,
            } => write!(
                f,
                "overlapping variables {:?} at stack offset {} read at {:?}",
                candidates,
                crate::value::signed_hex(*offset),
                loc
            ),
            Diagnostic::DegradedEvaluation { error } => write!(f, "degraded: {}", error),
            Diagnostic::UnknownCallingConvention { call_site, callee } => match callee {
                Some(callee) => write!(
                    f,
                    "no calling convention for callee {:#x} of call at {:#x}",
                    callee, call_site
                ),
                None => write!(f, "no calling convention for call at {:#x}", call_site),
            },
            Diagnostic::IterationCapReached { block, iterations } => write!(
                f,
                "block {:#x} reached the iteration cap ({})",
                block, iterations
            ),
        }
    }
}
