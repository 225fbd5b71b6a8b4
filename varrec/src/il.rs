//! Low-level lifted form of a basic block.
//!
//! Inspired by (but distinct from) Ghidra's [P-Code intermediate
//! language](https://ghidra.re/courses/languages/html/pcoderef.html): every instruction is a
//! single operation over registers, block-local temporaries and constants. One instruction is
//! one statement for the purposes of program-point identity.

use crate::error::RecoveryError;

/// An IL operation that operates on [`Varnode`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Op {
    /// Copy `input0` to `output`
    Copy,
    /// Wrapping sum of `input0` and `input1`
    IntAdd,
    /// Wrapping subtraction `input0 - input1`
    IntSub,
    /// Wrapping multiplication of `input0` and `input1`
    IntMult,
    /// Bitwise AND of `input0` and `input1`
    IntAnd,
    /// Bitwise OR or `input0` and `input1`
    IntOr,
    /// Bitwise XOR of `input0` and `input1`
    IntXor,
    /// Left shift `input0 << input1`
    IntLeftShift,
    /// Unsigned right shift `input0 u>> input1`
    IntURightShift,
    /// Signed right shift `input0 s>> input1`
    IntSRightShift,
    /// Zero-extend `input0`
    IntZext,
    /// Sign-extend `input0`
    IntSext,
    /// Check if `input0 == input1`
    IntEqual,
    /// Check if `input0 != input1`
    IntNotEqual,
    /// Unsigned integer comparison `input0 u< input1`
    IntLess,
    /// Signed integer comparison `input0 s< input1`
    IntSLess,
    /// Load `output.size` bytes from the address `input0`
    Load,
    /// Store `input1` at the address `input0`
    Store,
    /// Unconditional branch to `input0`
    Branch,
    /// A conditional branch to `input0` taken iff `input1` is non-zero
    Cbranch,
    /// Call the function at `input0`
    Call,
    /// Call the function whose address is held in `input0`
    CallIndirect,
    /// Return to the address held in `input0`
    Return,
    /// A no-op
    Nop,
    /// Map weird (non-control flow) instructions to this when lifting; marks the output as
    /// havoc'd, ignoring the inputs.
    UnderspecifiedOutputModification,
}

/// An input to or output from an [`Op`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Varnode {
    /// An unused input/output for the relevant op.
    // Note: We use this rather than an `Option<Varnode>` at every
    // use case to keep pattern matching cleaner.
    Unused,
    /// A slice of the register file
    Register { offset: usize, size: usize },
    /// A temporary, local to its block
    Temporary { idx: usize, size: usize },
    /// Constant or "immediate" value
    Constant { value: u64, size: usize },
    /// A code address (branch or call target)
    Address { addr: u64 },
}

impl Varnode {
    pub fn try_size(&self) -> Option<usize> {
        match self {
            Varnode::Unused | Varnode::Address { .. } => None,
            Varnode::Register { size, .. }
            | Varnode::Temporary { size, .. }
            | Varnode::Constant { size, .. } => Some(*size),
        }
    }

    pub fn is_used(&self) -> bool {
        !matches!(self, Varnode::Unused)
    }
}

impl std::fmt::Debug for Varnode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use Varnode::*;
        match self {
            Unused => write!(f, "_"),
            Register { offset, size } => write!(f, "r{}:{}", offset, size),
            Temporary { idx, size } => write!(f, "t{}:{}", idx, size),
            Constant { value, size } => {
                if f.alternate() {
                    write!(f, "${:#x}u{}", value, size)
                } else {
                    write!(f, "${:}u{}", value, size)
                }
            }
            Address { addr } => write!(f, "MCA({:#x?})", addr),
        }
    }
}

/// An IL instruction.
///
/// Original processor instructions may be translated to one or more IL instructions.
#[derive(Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The address of the original processor instruction this instruction was translated from.
    pub address: u64,
    /// The actual operation performed by the instruction. This dictates the number of `inputs`
    /// and whether or not there is any `output`.
    pub op: Op,
    /// The output of the instruction. If it produces no output, must be set to
    /// [`Varnode::Unused`].
    pub output: Varnode,
    /// The inputs to the instruction. Any unused inputs must be set to [`Varnode::Unused`].
    pub inputs: [Varnode; 2],
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Instruction {{ addr: {:#x}, op: {:?}, output: {:?}, inputs: {:?} }}",
            self.address, self.op, self.output, self.inputs
        )
    }
}

impl Instruction {
    pub fn new(address: u64, op: Op, output: Varnode, inputs: [Varnode; 2]) -> Self {
        Self {
            address,
            op,
            output,
            inputs,
        }
    }

    /// Confirms the validity of the instruction.
    pub fn try_confirm_valid(&self) -> Result<(), RecoveryError> {
        let fail = |reason: String| {
            Err(RecoveryError::MalformedInstruction {
                addr: self.address,
                reason,
            })
        };
        macro_rules! exp {
            (__m $e:expr => [$($pat:pat_param)|+] $name:literal) => {
                if !matches!($e, $($pat)|+) {
                    return fail(format!(
                        "Got {} {:?} for operation {:?}. Expected {}.",
                        stringify!($e), $e, self.op, $name
                    ));
                }
            };
            (_m $e:expr => [0]) => { exp!(__m $e => [Varnode::Unused] "unused") };
            (_m $e:expr => [vn]) => {
                exp!(__m $e => [Varnode::Register { .. } | Varnode::Temporary { .. }] "register or temporary")
            };
            (_m $e:expr => [vnc]) => {
                exp!(__m $e => [Varnode::Register { .. } | Varnode::Temporary { .. } | Varnode::Constant { .. }] "register, temporary or constant")
            };
            (_m $e:expr => [pc]) => {
                exp!(__m $e => [Varnode::Address { .. } | Varnode::Constant { .. }] "code address")
            };
            (__ref i0) => { self.inputs[0] };
            (__ref i1) => { self.inputs[1] };
            (__ref o) => { self.output };
            ($ti0:tt $ti1:tt $to:tt) => {{
                exp!(_m self.inputs[0] => [$ti0]);
                exp!(_m self.inputs[1] => [$ti1]);
                exp!(_m self.output => [$to]);
            }};
            (szeq($a:tt,$b:tt) $($rest:tt)*) => {{
                exp!($($rest)*);
                if let (Some(sz1), Some(sz2)) = (exp!(__ref $a).try_size(), exp!(__ref $b).try_size()) {
                    if sz1 != sz2 {
                        return fail(format!(
                            "Got unequal sizes {} and {} for {} and {} operation {:?}",
                            sz1, sz2, stringify!($a), stringify!($b), self.op));
                    }
                }
            }};
            (szlt($a:tt,$b:tt) $($rest:tt)*) => {{
                exp!($($rest)*);
                if let (Some(sz1), Some(sz2)) = (exp!(__ref $a).try_size(), exp!(__ref $b).try_size()) {
                    if sz1 >= sz2 {
                        return fail(format!(
                            "Got invalid sizes {} and {} for {} and {} operation {:?}",
                            sz1, sz2, stringify!($a), stringify!($b), self.op));
                    }
                }
            }};
            (sz($a:tt,$b:literal) $($rest:tt)*) => {{
                exp!($($rest)*);
                if exp!(__ref $a).try_size() != Some($b) {
                    return fail(format!(
                        "Got size {:?} for {} in operation {:?}. Expected {}",
                        exp!(__ref $a).try_size(), stringify!($a), self.op, $b));
                }
            }};
        }
        match self.op {
            Op::Copy => exp!(szeq(i0,o) vnc 0 vn),
            Op::IntAdd
            | Op::IntSub
            | Op::IntMult
            | Op::IntAnd
            | Op::IntOr
            | Op::IntXor => exp!(szeq(i0,i1) szeq(i0,o) vnc vnc vn),
            Op::IntLeftShift | Op::IntURightShift | Op::IntSRightShift => {
                exp!(szeq(i0,o) vnc vnc vn)
            }
            Op::IntZext | Op::IntSext => exp!(szlt(i0,o) vnc 0 vn),
            Op::IntEqual | Op::IntNotEqual | Op::IntLess | Op::IntSLess => {
                exp!(szeq(i0,i1) sz(o,1) vnc vnc vn)
            }
            Op::Load => exp!(vnc 0 vn),
            Op::Store => exp!(vnc vnc 0),
            Op::Branch | Op::Call => exp!(pc 0 0),
            Op::Cbranch => exp!(pc vnc 0),
            Op::CallIndirect | Op::Return => exp!(vnc 0 0),
            Op::Nop => exp!(0 0 0),
            Op::UnderspecifiedOutputModification => {
                if !self.output.is_used() {
                    return fail(format!("Expected an output for operation {:?}", self.op));
                }
            }
        }
        Ok(())
    }
}

/// A basic block in lifted form.
#[derive(Clone, Debug)]
pub struct LiftedBlock {
    pub addr: u64,
    /// Size in bytes of the machine code the block was lifted from
    pub size: usize,
    pub instructions: Vec<Instruction>,
}

impl LiftedBlock {
    /// Check every instruction, reporting the first malformed one
    pub fn try_confirm_valid(&self) -> Result<(), RecoveryError> {
        self.instructions
            .iter()
            .try_for_each(|ins| ins.try_confirm_valid())
    }

    /// Target of the call ending this block, if any
    pub fn call_target(&self) -> Option<u64> {
        self.instructions.iter().rev().find_map(|ins| match ins {
            Instruction {
                op: Op::Call,
                inputs: [Varnode::Address { addr } | Varnode::Constant { value: addr, .. }, _],
                ..
            } => Some(*addr),
            _ => None,
        })
    }
}
