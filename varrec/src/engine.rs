//! The statement/expression engine: evaluates one basic block against an abstract state.
//!
//! The four core operations ([`VariableRecoveryEngine::assign_to_register`],
//! [`VariableRecoveryEngine::store`], [`VariableRecoveryEngine::load`] and
//! [`VariableRecoveryEngine::read_from_register`]) are shared by both block representations;
//! the front-ends in [`engine_il`](crate::engine_il) and
//! [`engine_structured`](crate::engine_structured) only translate their statements into calls
//! to them.

use crate::arch::Arch;
use crate::block::{Atom, Block, CodeLocation};
use crate::catalog::{AccessSort, VariableCatalog};
use crate::containers::unordered::UnorderedMap;
use crate::error::{Diagnostic, RecoveryError};
use crate::log::*;
use crate::recovery_config::CONFIG;
use crate::state::AbstractState;
use crate::typevars::{Label, TypeConstraint, TypeTerm};
use crate::value::{signed_hex, to_signed, OffsetExpr, SpOffset, StackOffset, Symbol, Value};
use crate::variable::{Variable, VariableKind};

/// The result of evaluating an expression
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RichR {
    pub data: Value,
    pub variable: Option<Variable>,
    pub typevar: Option<TypeTerm>,
    /// Constraints produced while evaluating sub-expressions, committed by the consuming
    /// statement
    pub type_constraints: Vec<TypeConstraint>,
}

impl RichR {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            variable: None,
            typevar: None,
            type_constraints: vec![],
        }
    }

    /// An unbound result about which nothing is known
    pub fn unknown() -> Self {
        Self::new(Value::Unknown)
    }

    fn with_variable(mut self, variable: Variable) -> Self {
        self.variable = Some(variable);
        self
    }

    fn with_typevar(mut self, typevar: Option<TypeTerm>) -> Self {
        self.typevar = typevar;
        self
    }
}

/// How a block's evaluation went
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BlockOutcome {
    Complete,
    /// Some statements could not be fully evaluated and continued with unbound results
    Degraded { errors: Vec<RecoveryError> },
}

impl BlockOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, BlockOutcome::Degraded { .. })
    }
}

/// Arithmetic shared by both front-ends
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Compare,
}

pub struct VariableRecoveryEngine<'a> {
    pub(crate) arch: &'a Arch,
    pub(crate) catalog: &'a mut VariableCatalog,
    fail_fast: bool,
    block_addr: u64,
    pub(crate) stmt_idx: usize,
    pub(crate) ins_addr: Option<u64>,
    /// Block-local temporaries of the lifted form
    pub(crate) tmps: UnorderedMap<usize, RichR>,
    errors: Vec<RecoveryError>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> VariableRecoveryEngine<'a> {
    pub fn new(arch: &'a Arch, catalog: &'a mut VariableCatalog, fail_fast: bool) -> Self {
        Self {
            arch,
            catalog,
            fail_fast,
            block_addr: 0,
            stmt_idx: 0,
            ins_addr: None,
            tmps: Default::default(),
            errors: vec![],
            diagnostics: vec![],
        }
    }

    /// Evaluate every statement of `block`, in order, against `state`.
    ///
    /// Unless constructed with `fail_fast`, evaluation errors are recorded and the offending
    /// expression continues as an unbound result.
    pub fn process(
        &mut self,
        state: &mut AbstractState,
        block: &Block,
    ) -> Result<BlockOutcome, RecoveryError> {
        self.block_addr = block.addr();
        self.stmt_idx = 0;
        self.ins_addr = None;
        self.tmps = Default::default();
        state.block_addr = block.addr();
        match block {
            Block::Lifted(b) => self.process_lifted(state, b)?,
            Block::Structured(b) => self.process_structured(state, b)?,
        }
        if self.errors.is_empty() {
            Ok(BlockOutcome::Complete)
        } else {
            Ok(BlockOutcome::Degraded {
                errors: std::mem::take(&mut self.errors),
            })
        }
    }

    /// Diagnostics gathered so far
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub(crate) fn codeloc(&self) -> CodeLocation {
        CodeLocation::new(self.block_addr, self.stmt_idx, self.ins_addr)
    }

    /// Either propagate `error` (strict mode) or record it and continue with an unbound result
    pub(crate) fn degrade(&mut self, error: RecoveryError) -> Result<RichR, RecoveryError> {
        if self.fail_fast {
            return Err(error);
        }
        warn!("Continuing with an unbound result"; "error" => %error);
        self.diagnostics.push(Diagnostic::DegradedEvaluation {
            error: error.clone(),
        });
        self.errors.push(error);
        Ok(RichR::unknown())
    }

    pub(crate) fn word_bits(&self) -> usize {
        self.arch.bits
    }

    /// Resolve a register variable at the current statement, or mint one
    fn register_variable(
        &mut self,
        offset: usize,
        size: usize,
        sort: AccessSort,
        atom: Option<Atom>,
    ) -> (Variable, bool) {
        let loc = self.codeloc();
        let existing = match atom {
            Some(atom) => self
                .catalog
                .find_variables_by_atom(&loc, atom, VariableKind::Register),
            None => self
                .catalog
                .find_variables_by_stmt(&loc, VariableKind::Register, sort),
        };
        match existing
            .into_iter()
            .find(|(v, _)| v.offset == offset as i64)
        {
            Some((v, _)) => (v, false),
            None => (
                self.catalog
                    .new_variable(VariableKind::Register, offset as i64, size, None),
                true,
            ),
        }
    }

    /// Write `richr` into the register at `offset`.
    pub fn assign_to_register(
        &mut self,
        state: &mut AbstractState,
        offset: usize,
        richr: RichR,
        size: usize,
        src: Option<Atom>,
        dst: Option<Atom>,
    ) {
        let loc = self.codeloc();
        state.add_type_constraints(richr.type_constraints.iter().cloned());

        if offset == self.arch.sp_offset {
            if let Value::Stack(SpOffset {
                offset: StackOffset::Concrete(n),
                ..
            }) = richr.data
            {
                state.processor_state.sp_adjusted = true;
                state.processor_state.sp_adjustment = n;
                debug!("Adjusting stack pointer";
                       "loc" => ?loc,
                       OptionalKV("ins_addr", self.ins_addr.map(|a| format!("{:#x}", a))),
                       "offset" => signed_hex(n));
            }
            return;
        }
        if offset == self.arch.bp_offset {
            state.processor_state.set_bp(richr.data);
            return;
        }

        // Address of a local ("lea")
        let mut referenced = None;
        if let Some(stack_offset) = richr.data.as_stack_offset() {
            if let (Some(off), _) = stack_offset.split() {
                referenced = Some(self.reference_stack_variable(state, off, src));
            }
        }

        let (variable, fresh) = self.register_variable(offset, size, AccessSort::Write, dst);
        if fresh {
            self.catalog
                .set_variable(VariableKind::Register, offset as i64, variable);
        }
        state
            .register_region
            .set_variable(offset as i64, variable);
        self.catalog.write_to(&variable, None, loc, dst);

        if richr.typevar.is_none() && referenced.is_none() {
            return;
        }
        let dst_tv = TypeTerm::from(self.catalog.type_variable(variable.ident, loc));
        state.typevars.add(variable.ident, loc, dst_tv.base());
        if let Some(tv) = richr.typevar {
            state.add_type_constraint(TypeConstraint::Subtype(tv, dst_tv.clone()));
        }
        if let Some(var_tv) = referenced {
            if CONFIG.link_address_taken_locals {
                state.add_type_constraint(TypeConstraint::Subtype(
                    dst_tv.clone().derive(Label::Load),
                    var_tv.clone(),
                ));
                state.add_type_constraint(TypeConstraint::Subtype(
                    var_tv,
                    dst_tv.derive(Label::Store),
                ));
            }
        }
    }

    /// Take the address of the stack slot at `off`, returning the referenced variable's type.
    fn reference_stack_variable(
        &mut self,
        state: &mut AbstractState,
        off: i64,
        src: Option<Atom>,
    ) -> TypeTerm {
        let loc = self.codeloc();
        let existing = match src {
            Some(atom) => self
                .catalog
                .find_variables_by_atom(&loc, atom, VariableKind::Stack),
            None => self.catalog.find_variables_by_stmt(
                &loc,
                VariableKind::Stack,
                AccessSort::Reference,
            ),
        };
        let variable = match existing.first() {
            Some((v, _)) => *v,
            None => match state.stack_region.get_variables_by_offset(off).first() {
                Some(v) => *v,
                None => {
                    // The size of an address-taken local is not known yet
                    let v = self
                        .catalog
                        .new_variable(VariableKind::Stack, off, 1, None);
                    self.catalog.add_variable(VariableKind::Stack, off, v);
                    debug!("Identified a new stack variable";
                           "variable" => ?v, "loc" => ?loc);
                    v
                }
            },
        };
        if !state
            .stack_region
            .get_variables_by_offset(off)
            .contains(&variable)
        {
            state.stack_region.add_variable(off, variable);
        }
        let tv = self.catalog.type_variable(variable.ident, loc);
        state.typevars.add(variable.ident, loc, tv);

        let base = state.stack_region.get_base_addr(off).unwrap_or(off);
        for var in state.stack_region.get_variables_by_offset(base) {
            self.catalog
                .reference_at(&var, offset_into_variable(off - base, None), loc, src);
        }
        TypeTerm::from(tv)
    }

    /// Store `data` at `addr`. Only stores into the current stack frame are modeled.
    pub fn store(
        &mut self,
        state: &mut AbstractState,
        addr: &RichR,
        data: RichR,
        size: usize,
        stmt: Option<Atom>,
    ) {
        let loc = self.codeloc();
        state.add_type_constraints(addr.type_constraints.iter().cloned());
        state.add_type_constraints(data.type_constraints.iter().cloned());

        let stack_offset = match addr.data.as_stack_offset() {
            Some(o) => o,
            None => {
                trace!("Ignoring store through a non-stack address"; "loc" => ?loc, "addr" => ?addr.data);
                return;
            }
        };
        let (off, residual) = match stack_offset.split() {
            (Some(off), residual) => (off, residual),
            (None, _) => {
                debug!("Store to a stack address without a concrete offset";
                       "loc" => ?loc, "offset" => ?stack_offset);
                return;
            }
        };

        let variable = if residual.is_some() {
            // An indexed write only lands in whatever already covers the concrete part
            match state.stack_region.get_variables_by_offset(off).first() {
                Some(v) => *v,
                None => {
                    debug!("Indexed store outside any known stack variable";
                           "loc" => ?loc, "offset" => ?stack_offset);
                    return;
                }
            }
        } else {
            let existing = match stmt {
                Some(atom) => self
                    .catalog
                    .find_variables_by_atom(&loc, atom, VariableKind::Stack),
                None => self.catalog.find_variables_by_stmt(
                    &loc,
                    VariableKind::Stack,
                    AccessSort::Write,
                ),
            };
            let variable = match existing.first() {
                Some((v, _)) => *v,
                None => {
                    let same_slot = state
                        .stack_region
                        .iter()
                        .find(|(k, v)| *k == off && v.size == size)
                        .map(|(_, v)| *v);
                    match same_slot {
                        Some(v) => v,
                        None => {
                            let v = self
                                .catalog
                                .new_variable(VariableKind::Stack, off, size, None);
                            self.catalog.set_variable(VariableKind::Stack, off, v);
                            debug!("Identified a new stack variable";
                                   "variable" => ?v, "loc" => ?loc);
                            v
                        }
                    }
                }
            };
            state.stack_region.set_variable(off, variable);
            variable
        };

        let base = state.stack_region.get_base_addr(off).unwrap_or(off);
        self.catalog.write_to(
            &variable,
            offset_into_variable(off - base, residual),
            loc,
            stmt,
        );

        if let Some(data_tv) = data.typevar {
            let tv = self.catalog.type_variable(variable.ident, loc);
            state.typevars.add(variable.ident, loc, tv);
            state.add_type_constraint(TypeConstraint::Subtype(
                TypeTerm::from(tv).stored_field(size * 8, 0),
                data_tv,
            ));
        }
    }

    /// Load `size` bytes from `addr`.
    pub fn load(
        &mut self,
        state: &mut AbstractState,
        addr: RichR,
        size: usize,
        expr: Option<Atom>,
    ) -> RichR {
        let loc = self.codeloc();
        let mut result = RichR::unknown();
        result.type_constraints = addr.type_constraints;

        let stack_offset = match addr.data.as_stack_offset() {
            Some(o) => o,
            None => {
                // A dereference of a pointer
                let typevar = match addr.typevar {
                    Some(tv) => tv,
                    None => return result,
                };
                let (base, offset) = if CONFIG.derive_pointer_offsets_from_addn {
                    typevar.strip_addn()
                } else {
                    (typevar, 0)
                };
                let loaded = base.loaded_field(size * 8, offset);
                state.add_type_constraint(TypeConstraint::Exists(loaded.clone()));
                if CONFIG.type_loaded_values {
                    result.typevar = Some(loaded);
                }
                return result;
            }
        };

        let (concrete, residual) = match stack_offset.split() {
            (Some(c), residual) => (c, residual),
            (None, _) => {
                debug!("Load from a stack address without a concrete offset";
                       "loc" => ?loc, "offset" => ?stack_offset);
                return result;
            }
        };

        let mut candidates = state.stack_region.get_variables_by_offset(concrete);
        if candidates.is_empty() {
            let existing = match expr {
                Some(atom) => self
                    .catalog
                    .find_variables_by_atom(&loc, atom, VariableKind::Stack),
                None => self.catalog.find_variables_by_stmt(
                    &loc,
                    VariableKind::Stack,
                    AccessSort::Read,
                ),
            };
            let variable = match existing.into_iter().find(|(v, _)| v.covers(v.offset, concrete)) {
                Some((v, _)) => v,
                None => {
                    let v = self
                        .catalog
                        .new_variable(VariableKind::Stack, concrete, size, None);
                    self.catalog.add_variable(VariableKind::Stack, concrete, v);
                    debug!("Identified a new stack variable"; "variable" => ?v, "loc" => ?loc);
                    v
                }
            };
            state.stack_region.add_variable(variable.offset, variable);
            candidates = vec![variable];
        }
        let variable = candidates[0];
        let base = state
            .stack_region
            .get_base_addr(concrete)
            .unwrap_or(variable.offset);
        if candidates.len() > 1 {
            warn!("Reading memory with overlapping variables, ignoring all but the first";
                  "loc" => ?loc,
                  "variables" => ?candidates);
            self.diagnostics.push(Diagnostic::OverlappingVariables {
                loc,
                offset: concrete,
                candidates: candidates.iter().map(|v| v.ident).collect(),
            });
        }

        self.catalog.read_from(
            &variable,
            offset_into_variable(concrete - base, residual),
            loc,
            expr,
        );

        let tv = self.catalog.type_variable(variable.ident, loc);
        state.typevars.add(variable.ident, loc, tv);
        let loaded = TypeTerm::from(tv).loaded_field(size * 8, 0);
        state.add_type_constraint(TypeConstraint::Exists(loaded.clone()));

        result.variable = Some(variable);
        if CONFIG.type_loaded_values {
            result.typevar = Some(loaded);
        }
        result
    }

    /// Read `size` bytes from the register at `offset`.
    pub fn read_from_register(
        &mut self,
        state: &mut AbstractState,
        offset: usize,
        size: usize,
        expr: Option<Atom>,
    ) -> RichR {
        if offset == self.arch.sp_offset {
            return RichR::new(Value::Stack(SpOffset::new(
                self.arch.bits,
                state.processor_state.sp_adjustment,
            )));
        }
        if offset == self.arch.bp_offset {
            return RichR::new(state.processor_state.bp.clone());
        }

        let loc = self.codeloc();
        let mut vars = state.register_region.get_variables_by_offset(offset as i64);
        if vars.is_empty() {
            let (variable, fresh) = self.register_variable(offset, size, AccessSort::Read, expr);
            if fresh {
                self.catalog
                    .add_variable(VariableKind::Register, offset as i64, variable);
            }
            state
                .register_region
                .add_variable(offset as i64, variable);
            vars = vec![variable];
        }
        for var in vars.iter() {
            self.catalog.read_from(var, None, loc, expr);
        }
        // Only the first variable is returned
        let variable = vars[0];
        let tv = match state.typevars.current(variable.ident) {
            Some(tv) => tv,
            None => {
                let tv = self.catalog.type_variable(variable.ident, loc);
                state.typevars.add(variable.ident, loc, tv);
                tv
            }
        };
        RichR::new(Value::Symbol(Symbol::Register { offset, size }))
            .with_variable(variable)
            .with_typevar(Some(TypeTerm::from(tv)))
    }

    /// Combine two operands. Pointer arithmetic by a constant is recorded as `+N` on the type,
    /// and comparisons may relate the operand types.
    pub(crate) fn arith(&mut self, op: ArithOp, lhs: RichR, rhs: RichR, bits: usize) -> RichR {
        let data = match op {
            ArithOp::Add => lhs.data.add(&rhs.data, bits),
            ArithOp::Sub => lhs.data.sub(&rhs.data, bits),
            ArithOp::And => lhs.data.and(&rhs.data, bits),
            ArithOp::Mul => lhs.data.fold_ints(&rhs.data, bits, |a, b| Some(a.wrapping_mul(b))),
            ArithOp::Or => lhs.data.fold_ints(&rhs.data, bits, |a, b| Some(a | b)),
            ArithOp::Xor => lhs.data.fold_ints(&rhs.data, bits, |a, b| Some(a ^ b)),
            ArithOp::Shl => lhs
                .data
                .fold_ints(&rhs.data, bits, |a, b| a.checked_shl(b as u32)),
            ArithOp::Shr => lhs
                .data
                .fold_ints(&rhs.data, bits, |a, b| a.checked_shr(b as u32)),
            ArithOp::Sar => lhs.data.fold_ints(&rhs.data, bits, |a, b| {
                to_signed(a, bits)
                    .checked_shr(b as u32)
                    .map(|r| r as u64)
            }),
            ArithOp::Compare => Value::Unknown,
        };

        let typevar = match (op, &lhs.typevar, &rhs.typevar, &lhs.data, &rhs.data) {
            (ArithOp::Add, Some(tv), _, _, Value::Int(n))
            | (ArithOp::Add, _, Some(tv), Value::Int(n), _) => {
                Some(tv.clone().derive(Label::AddN(to_signed(*n, bits))))
            }
            (ArithOp::Sub, Some(tv), _, _, Value::Int(n)) => Some(
                tv.clone()
                    .derive(Label::AddN(to_signed(*n, bits).wrapping_neg())),
            ),
            _ => None,
        };

        let mut type_constraints = lhs.type_constraints;
        type_constraints.extend(rhs.type_constraints);
        if op == ArithOp::Compare && CONFIG.relate_operand_types_on_comparison {
            if let (Some(l), Some(r)) = (lhs.typevar, rhs.typevar) {
                type_constraints.push(TypeConstraint::Subtype(l, r));
            }
        }

        RichR {
            data,
            variable: None,
            typevar,
            type_constraints,
        }
    }
}

/// Where an access lands inside its variable: `residual + delta`, or `None` at the start.
fn offset_into_variable(delta: i64, residual: Option<OffsetExpr>) -> Option<OffsetExpr> {
    match residual {
        None if delta == 0 => None,
        None => Some(OffsetExpr::Int(delta)),
        Some(r) if delta == 0 => Some(r),
        Some(r) => Some(OffsetExpr::add(r, OffsetExpr::Int(delta))),
    }
}
