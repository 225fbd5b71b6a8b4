//! Structured form of a basic block: statements over expression trees.
//!
//! Every statement and expression node carries an `idx` unique within its block, its
//! [`Atom`](crate::block::Atom) identity.

use crate::block::Atom;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    CmpEQ,
    CmpNE,
    CmpLT,
    CmpLE,
    CmpGT,
    CmpGE,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::CmpEQ | BinOp::CmpNE | BinOp::CmpLT | BinOp::CmpLE | BinOp::CmpGT | BinOp::CmpGE
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Expr {
    pub idx: usize,
    pub kind: ExprKind,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ExprKind {
    Const {
        value: u64,
        bits: usize,
    },
    Register {
        offset: usize,
        bits: usize,
    },
    /// A block-local temporary
    Tmp {
        idx: usize,
        bits: usize,
    },
    Load {
        addr: Box<Expr>,
        size: usize,
    },
    BinaryOp {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        bits: usize,
    },
    UnaryOp {
        op: UnOp,
        operand: Box<Expr>,
        bits: usize,
    },
    Convert {
        from_bits: usize,
        to_bits: usize,
        signed: bool,
        operand: Box<Expr>,
    },
    /// An address relative to the frame base, already resolved by the lifter
    StackBaseOffset {
        offset: i64,
        bits: usize,
    },
    /// Anything the lifter could not express
    Unsupported {
        description: String,
    },
}

impl Expr {
    pub fn atom(&self) -> Atom {
        Atom(self.idx)
    }

    /// Width in bits, when known
    pub fn bits(&self) -> Option<usize> {
        match &self.kind {
            ExprKind::Const { bits, .. }
            | ExprKind::Register { bits, .. }
            | ExprKind::Tmp { bits, .. }
            | ExprKind::BinaryOp { bits, .. }
            | ExprKind::UnaryOp { bits, .. }
            | ExprKind::StackBaseOffset { bits, .. } => Some(*bits),
            ExprKind::Load { size, .. } => Some(size * 8),
            ExprKind::Convert { to_bits, .. } => Some(*to_bits),
            ExprKind::Unsupported { .. } => None,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Statement {
    pub idx: usize,
    pub ins_addr: Option<u64>,
    pub kind: StmtKind,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StmtKind {
    /// `dst` is a register or a temporary
    Assignment { dst: Expr, src: Expr },
    Store { addr: Expr, data: Expr, size: usize },
    Call { target: Expr },
    Jump { target: Expr },
    ConditionalJump {
        condition: Expr,
        true_target: Expr,
        false_target: Expr,
    },
    Return,
}

impl Statement {
    pub fn atom(&self) -> Atom {
        Atom(self.idx)
    }
}

/// A basic block in structured form.
#[derive(Clone, Debug)]
pub struct StructuredBlock {
    pub addr: u64,
    pub size: usize,
    pub statements: Vec<Statement>,
}

impl StructuredBlock {
    /// Target of the call in this block, if it is a constant
    pub fn call_target(&self) -> Option<u64> {
        self.statements.iter().rev().find_map(|s| match &s.kind {
            StmtKind::Call {
                target:
                    Expr {
                        kind: ExprKind::Const { value, .. },
                        ..
                    },
            } => Some(*value),
            _ => None,
        })
    }
}

/// Hands out node identities while building a structured block.
#[derive(Default)]
pub struct StructuredBuilder {
    next_idx: usize,
    ins_addr: Option<u64>,
    statements: Vec<Statement>,
}

impl StructuredBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    fn expr(&mut self, kind: ExprKind) -> Expr {
        let idx = self.next_idx;
        self.next_idx += 1;
        Expr { idx, kind }
    }

    /// Tag subsequently added statements with the machine address `addr`
    pub fn at(&mut self, addr: u64) -> &mut Self {
        self.ins_addr = Some(addr);
        self
    }

    pub fn constant(&mut self, value: u64, bits: usize) -> Expr {
        self.expr(ExprKind::Const { value, bits })
    }

    pub fn reg(&mut self, offset: usize, bits: usize) -> Expr {
        self.expr(ExprKind::Register { offset, bits })
    }

    pub fn tmp(&mut self, idx: usize, bits: usize) -> Expr {
        self.expr(ExprKind::Tmp { idx, bits })
    }

    pub fn load(&mut self, addr: Expr, size: usize) -> Expr {
        self.expr(ExprKind::Load {
            addr: Box::new(addr),
            size,
        })
    }

    pub fn binop(&mut self, op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        let bits = if op.is_comparison() {
            1
        } else {
            lhs.bits().or_else(|| rhs.bits()).unwrap_or(0)
        };
        self.expr(ExprKind::BinaryOp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            bits,
        })
    }

    pub fn unop(&mut self, op: UnOp, operand: Expr) -> Expr {
        let bits = operand.bits().unwrap_or(0);
        self.expr(ExprKind::UnaryOp {
            op,
            operand: Box::new(operand),
            bits,
        })
    }

    pub fn convert(&mut self, operand: Expr, to_bits: usize, signed: bool) -> Expr {
        let from_bits = operand.bits().unwrap_or(to_bits);
        self.expr(ExprKind::Convert {
            from_bits,
            to_bits,
            signed,
            operand: Box::new(operand),
        })
    }

    pub fn stack_base_offset(&mut self, offset: i64, bits: usize) -> Expr {
        self.expr(ExprKind::StackBaseOffset { offset, bits })
    }

    pub fn unsupported(&mut self, description: &str) -> Expr {
        self.expr(ExprKind::Unsupported {
            description: description.to_owned(),
        })
    }

    fn stmt(&mut self, kind: StmtKind) -> &mut Self {
        let idx = self.next_idx;
        self.next_idx += 1;
        self.statements.push(Statement {
            idx,
            ins_addr: self.ins_addr,
            kind,
        });
        self
    }

    pub fn assign(&mut self, dst: Expr, src: Expr) -> &mut Self {
        self.stmt(StmtKind::Assignment { dst, src })
    }

    pub fn store(&mut self, addr: Expr, data: Expr, size: usize) -> &mut Self {
        self.stmt(StmtKind::Store { addr, data, size })
    }

    pub fn call(&mut self, target: Expr) -> &mut Self {
        self.stmt(StmtKind::Call { target })
    }

    pub fn jump(&mut self, target: Expr) -> &mut Self {
        self.stmt(StmtKind::Jump { target })
    }

    pub fn conditional_jump(
        &mut self,
        condition: Expr,
        true_target: Expr,
        false_target: Expr,
    ) -> &mut Self {
        self.stmt(StmtKind::ConditionalJump {
            condition,
            true_target,
            false_target,
        })
    }

    pub fn ret(&mut self) -> &mut Self {
        self.stmt(StmtKind::Return)
    }

    pub fn finish(&mut self, addr: u64, size: usize) -> StructuredBlock {
        StructuredBlock {
            addr,
            size,
            statements: std::mem::take(&mut self.statements),
        }
    }
}
