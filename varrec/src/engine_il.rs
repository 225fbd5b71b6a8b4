//! Engine front-end for lifted (low-level) blocks.

use crate::engine::{ArithOp, RichR, VariableRecoveryEngine};
use crate::error::RecoveryError;
use crate::il::{Instruction, LiftedBlock, Op, Varnode};
use crate::log::*;
use crate::state::AbstractState;
use crate::value::{mask, Value};

impl<'a> VariableRecoveryEngine<'a> {
    pub(crate) fn process_lifted(
        &mut self,
        state: &mut AbstractState,
        block: &LiftedBlock,
    ) -> Result<(), RecoveryError> {
        for (idx, ins) in block.instructions.iter().enumerate() {
            self.stmt_idx = idx;
            self.ins_addr = Some(ins.address);
            trace!("IL Instruction"; "loc" => ?self.codeloc(), "ins" => ?ins);
            if let Err(e) = ins.try_confirm_valid() {
                let havoc = self.degrade(e)?;
                if ins.output.is_used() {
                    self.write_varnode(state, &ins.output, havoc);
                }
                continue;
            }
            self.process_instruction(state, ins)?;
        }
        Ok(())
    }

    fn process_instruction(
        &mut self,
        state: &mut AbstractState,
        ins: &Instruction,
    ) -> Result<(), RecoveryError> {
        let [i0, i1] = &ins.inputs;
        let out_bits = ins.output.try_size().unwrap_or(0) * 8;
        match ins.op {
            Op::Copy => {
                let v = self.read_varnode(state, i0)?;
                self.write_varnode(state, &ins.output, v);
            }
            Op::IntAdd
            | Op::IntSub
            | Op::IntMult
            | Op::IntAnd
            | Op::IntOr
            | Op::IntXor
            | Op::IntLeftShift
            | Op::IntURightShift
            | Op::IntSRightShift
            | Op::IntEqual
            | Op::IntNotEqual
            | Op::IntLess
            | Op::IntSLess => {
                let op = match ins.op {
                    Op::IntAdd => ArithOp::Add,
                    Op::IntSub => ArithOp::Sub,
                    Op::IntMult => ArithOp::Mul,
                    Op::IntAnd => ArithOp::And,
                    Op::IntOr => ArithOp::Or,
                    Op::IntXor => ArithOp::Xor,
                    Op::IntLeftShift => ArithOp::Shl,
                    Op::IntURightShift => ArithOp::Shr,
                    Op::IntSRightShift => ArithOp::Sar,
                    _ => ArithOp::Compare,
                };
                let bits = i0.try_size().unwrap_or(0) * 8;
                let lhs = self.read_varnode(state, i0)?;
                let rhs = self.read_varnode(state, i1)?;
                let r = self.arith(op, lhs, rhs, bits);
                self.write_varnode(state, &ins.output, r);
            }
            Op::IntZext | Op::IntSext => {
                let v = self.read_varnode(state, i0)?;
                let from_bits = i0.try_size().unwrap_or(0) * 8;
                let mut r = RichR::new(v.data.resize(from_bits, out_bits, ins.op == Op::IntSext));
                r.type_constraints = v.type_constraints;
                self.write_varnode(state, &ins.output, r);
            }
            Op::Load => {
                let addr = self.read_varnode(state, i0)?;
                let size = ins.output.try_size().unwrap_or(0);
                let r = self.load(state, addr, size, None);
                self.write_varnode(state, &ins.output, r);
            }
            Op::Store => {
                let addr = self.read_varnode(state, i0)?;
                let data = self.read_varnode(state, i1)?;
                let size = i1.try_size().unwrap_or(0);
                self.store(state, &addr, data, size, None);
            }
            Op::Cbranch => {
                let cond = self.read_varnode(state, i1)?;
                state.add_type_constraints(cond.type_constraints);
            }
            Op::CallIndirect | Op::Return => {
                let target = self.read_varnode(state, i0)?;
                state.add_type_constraints(target.type_constraints);
            }
            Op::Branch | Op::Call | Op::Nop => {}
            Op::UnderspecifiedOutputModification => {
                self.write_varnode(state, &ins.output, RichR::unknown());
            }
        }
        Ok(())
    }

    fn read_varnode(
        &mut self,
        state: &mut AbstractState,
        vn: &Varnode,
    ) -> Result<RichR, RecoveryError> {
        match vn {
            Varnode::Register { offset, size } => {
                Ok(self.read_from_register(state, *offset, *size, None))
            }
            Varnode::Temporary { idx, .. } => match self.tmps.get(idx) {
                Some(r) => Ok(r.clone()),
                None => {
                    let loc = self.codeloc();
                    self.degrade(RecoveryError::UndefinedTemporary { loc, idx: *idx })
                }
            },
            Varnode::Constant { value, size } => Ok(RichR::new(Value::Int(mask(*value, size * 8)))),
            Varnode::Address { .. } | Varnode::Unused => Ok(RichR::unknown()),
        }
    }

    fn write_varnode(&mut self, state: &mut AbstractState, vn: &Varnode, mut r: RichR) {
        match vn {
            Varnode::Register { offset, size } => {
                self.assign_to_register(state, *offset, r, *size, None, None)
            }
            Varnode::Temporary { idx, .. } => {
                state.add_type_constraints(r.type_constraints.drain(..));
                self.tmps.insert(*idx, r);
            }
            Varnode::Constant { .. } | Varnode::Address { .. } | Varnode::Unused => {}
        }
    }
}
