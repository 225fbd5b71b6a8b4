//! Stack-pointer and frame-base bookkeeping.

use crate::arch::Arch;
use crate::error::Diagnostic;
use crate::log::*;
use crate::value::{signed_hex, Value};

#[derive(Clone, PartialEq, Eq)]
pub struct ProcessorState {
    /// Whether the stack pointer has been explicitly adjusted since function entry
    pub sp_adjusted: bool,
    /// Cumulative byte delta of the stack pointer since function entry
    pub sp_adjustment: i64,
    /// Whether the frame-base register currently holds a stack address
    pub bp_as_base: bool,
    /// Content of the frame-base register
    pub bp: Value,
}

impl std::fmt::Debug for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "<ProcessorState bp={:?} sp{}{}{}>",
            self.bp,
            signed_hex(self.sp_adjustment),
            if self.sp_adjusted { " adjusted" } else { "" },
            if self.bp_as_base { " bp-as-base" } else { "" },
        )
    }
}

impl ProcessorState {
    pub fn new(arch: &Arch) -> Self {
        Self {
            sp_adjusted: false,
            sp_adjustment: if arch.call_pushes_ret {
                arch.bytes() as i64
            } else {
                0
            },
            bp_as_base: false,
            bp: Value::Unknown,
        }
    }

    /// Record a new frame-base register value
    pub fn set_bp(&mut self, bp: Value) {
        self.bp_as_base = bp.as_stack_offset().is_some();
        self.bp = bp;
    }

    /// Join two processor states arriving at `block`.
    ///
    /// The stack adjustment takes the larger operand and the frame base prefers whichever side
    /// is known (the larger integer if both are). This is a heuristic, not a sound join. When the
    /// operands differ, a diagnostic is returned.
    pub fn merge(&self, other: &ProcessorState, block: u64) -> (ProcessorState, Option<Diagnostic>) {
        let bp = match (&self.bp, &other.bp) {
            (a, b) if a == b => a.clone(),
            (Value::Unknown, b) => b.clone(),
            (a, Value::Unknown) => a.clone(),
            (Value::Int(a), Value::Int(b)) => Value::Int(*a.max(b)),
            _ => Value::Unknown,
        };
        let merged = ProcessorState {
            sp_adjusted: self.sp_adjusted || other.sp_adjusted,
            sp_adjustment: self.sp_adjustment.max(other.sp_adjustment),
            bp_as_base: self.bp_as_base || other.bp_as_base,
            bp,
        };
        if self == other {
            return (merged, None);
        }
        warn!(
            "Merging inconsistent processor states";
            "block" => format_args!("{:#x}", block),
            "left" => ?self,
            "right" => ?other,
        );
        (
            merged,
            Some(Diagnostic::InconsistentMerge {
                block,
                left: self.clone(),
                right: other.clone(),
            }),
        )
    }
}
