//! Program points and the two interchangeable basic-block representations.

use crate::il::LiftedBlock;
use crate::structured_il::StructuredBlock;

/// A program point: a statement within a block, optionally tagged with the machine instruction
/// it came from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeLocation {
    pub block_addr: u64,
    pub stmt_idx: usize,
    pub ins_addr: Option<u64>,
}

impl std::fmt::Debug for CodeLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<{:#x}[{}]", self.block_addr, self.stmt_idx)?;
        if let Some(ins_addr) = self.ins_addr {
            write!(f, "@{:#x}", ins_addr)?;
        }
        write!(f, ">")
    }
}

impl CodeLocation {
    pub fn new(block_addr: u64, stmt_idx: usize, ins_addr: Option<u64>) -> Self {
        Self {
            block_addr,
            stmt_idx,
            ins_addr,
        }
    }
}

/// Identity of a single statement or expression node inside a structured block
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Atom(pub usize);

/// A basic block, in whichever form the lifter produced it.
#[derive(Clone, Debug)]
pub enum Block {
    Lifted(LiftedBlock),
    Structured(StructuredBlock),
}

impl Block {
    pub fn addr(&self) -> u64 {
        match self {
            Block::Lifted(b) => b.addr,
            Block::Structured(b) => b.addr,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Block::Lifted(b) => b.size,
            Block::Structured(b) => b.size,
        }
    }

    /// Number of statements
    pub fn len(&self) -> usize {
        match self {
            Block::Lifted(b) => b.instructions.len(),
            Block::Structured(b) => b.statements.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<LiftedBlock> for Block {
    fn from(b: LiftedBlock) -> Self {
        Block::Lifted(b)
    }
}

impl From<StructuredBlock> for Block {
    fn from(b: StructuredBlock) -> Self {
        Block::Structured(b)
    }
}
