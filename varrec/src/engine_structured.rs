//! Engine front-end for structured blocks.

use crate::engine::{ArithOp, RichR, VariableRecoveryEngine};
use crate::error::RecoveryError;
use crate::log::*;
use crate::state::AbstractState;
use crate::structured_il::{BinOp, Expr, ExprKind, Statement, StmtKind, StructuredBlock, UnOp};
use crate::value::{mask, SpOffset, Value};

impl<'a> VariableRecoveryEngine<'a> {
    pub(crate) fn process_structured(
        &mut self,
        state: &mut AbstractState,
        block: &StructuredBlock,
    ) -> Result<(), RecoveryError> {
        for (idx, stmt) in block.statements.iter().enumerate() {
            self.stmt_idx = idx;
            self.ins_addr = stmt.ins_addr;
            trace!("Statement"; "loc" => ?self.codeloc(), "stmt" => ?stmt.kind);
            self.process_statement(state, stmt)?;
        }
        Ok(())
    }

    fn process_statement(
        &mut self,
        state: &mut AbstractState,
        stmt: &Statement,
    ) -> Result<(), RecoveryError> {
        match &stmt.kind {
            StmtKind::Assignment { dst, src } => {
                let r = self.eval(state, src)?;
                match &dst.kind {
                    ExprKind::Register { offset, bits } => self.assign_to_register(
                        state,
                        *offset,
                        r,
                        bits / 8,
                        Some(src.atom()),
                        Some(dst.atom()),
                    ),
                    ExprKind::Tmp { idx, .. } => {
                        let mut r = r;
                        state.add_type_constraints(r.type_constraints.drain(..));
                        self.tmps.insert(*idx, r);
                    }
                    _ => {
                        let loc = self.codeloc();
                        self.degrade(RecoveryError::UnsupportedExpression {
                            loc,
                            expr: format!("assignment to {:?}", dst.kind),
                        })?;
                    }
                }
            }
            StmtKind::Store { addr, data, size } => {
                let addr = self.eval(state, addr)?;
                let data = self.eval(state, data)?;
                self.store(state, &addr, data, *size, Some(stmt.atom()));
            }
            StmtKind::Call { target } | StmtKind::Jump { target } => {
                let target = self.eval(state, target)?;
                state.add_type_constraints(target.type_constraints);
            }
            StmtKind::ConditionalJump {
                condition,
                true_target,
                false_target,
            } => {
                for e in [condition, true_target, false_target] {
                    let r = self.eval(state, e)?;
                    state.add_type_constraints(r.type_constraints);
                }
            }
            StmtKind::Return => {}
        }
        Ok(())
    }

    fn eval(&mut self, state: &mut AbstractState, expr: &Expr) -> Result<RichR, RecoveryError> {
        match &expr.kind {
            ExprKind::Const { value, bits } => Ok(RichR::new(Value::Int(mask(*value, *bits)))),
            ExprKind::Register { offset, bits } => {
                Ok(self.read_from_register(state, *offset, bits / 8, Some(expr.atom())))
            }
            ExprKind::Tmp { idx, .. } => match self.tmps.get(idx) {
                Some(r) => Ok(r.clone()),
                None => {
                    let loc = self.codeloc();
                    self.degrade(RecoveryError::UndefinedTemporary { loc, idx: *idx })
                }
            },
            ExprKind::Load { addr, size } => {
                let addr = self.eval(state, addr)?;
                Ok(self.load(state, addr, *size, Some(expr.atom())))
            }
            ExprKind::BinaryOp { op, lhs, rhs, bits } => {
                let lhs = self.eval(state, lhs)?;
                let rhs = self.eval(state, rhs)?;
                let op = match op {
                    BinOp::Add => ArithOp::Add,
                    BinOp::Sub => ArithOp::Sub,
                    BinOp::Mul => ArithOp::Mul,
                    BinOp::And => ArithOp::And,
                    BinOp::Or => ArithOp::Or,
                    BinOp::Xor => ArithOp::Xor,
                    BinOp::Shl => ArithOp::Shl,
                    BinOp::Shr => ArithOp::Shr,
                    BinOp::Sar => ArithOp::Sar,
                    BinOp::CmpEQ
                    | BinOp::CmpNE
                    | BinOp::CmpLT
                    | BinOp::CmpLE
                    | BinOp::CmpGT
                    | BinOp::CmpGE => ArithOp::Compare,
                };
                // Comparisons are evaluated at operand width
                let bits = if op == ArithOp::Compare {
                    lhs_bits(expr).unwrap_or(self.word_bits())
                } else {
                    *bits
                };
                Ok(self.arith(op, lhs, rhs, bits))
            }
            ExprKind::UnaryOp { op, operand, bits } => {
                let v = self.eval(state, operand)?;
                let data = match (op, &v.data) {
                    (UnOp::Not, Value::Int(n)) => Value::Int(mask(!n, *bits)),
                    (UnOp::Neg, Value::Int(n)) => Value::Int(mask(n.wrapping_neg(), *bits)),
                    _ => Value::Unknown,
                };
                let mut r = RichR::new(data);
                r.type_constraints = v.type_constraints;
                Ok(r)
            }
            ExprKind::Convert {
                from_bits,
                to_bits,
                signed,
                operand,
            } => {
                let v = self.eval(state, operand)?;
                let mut r = RichR::new(v.data.resize(*from_bits, *to_bits, *signed));
                r.type_constraints = v.type_constraints;
                Ok(r)
            }
            ExprKind::StackBaseOffset { offset, bits } => {
                Ok(RichR::new(Value::Stack(SpOffset::new(*bits, *offset))))
            }
            ExprKind::Unsupported { description } => {
                let loc = self.codeloc();
                self.degrade(RecoveryError::UnsupportedExpression {
                    loc,
                    expr: description.clone(),
                })
            }
        }
    }
}

fn lhs_bits(expr: &Expr) -> Option<usize> {
    match &expr.kind {
        ExprKind::BinaryOp { lhs, .. } => lhs.bits(),
        _ => None,
    }
}
