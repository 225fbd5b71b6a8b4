use crate::arch::Arch;
use crate::block::{Block, CodeLocation};
use crate::catalog::{AccessSort, VariableAccess, VariableCatalog};
use crate::cfg::{CallSite, CallingConvention, FunctionGraph};
use crate::containers::unordered::UnorderedMap;
use crate::engine::{BlockOutcome, VariableRecoveryEngine};
use crate::error::{Diagnostic, RecoveryError};
use crate::il::{Instruction, LiftedBlock, Op, Varnode};
use crate::recovery::{RecoveryOptions, VariableRecoveryFast};
use crate::state::AbstractState;
use crate::structured_il::{BinOp, StructuredBuilder};
use crate::typevars::{Label, TypeConstraint, TypeTerm};
use crate::value::{OffsetExpr, Symbol};
use crate::variable::{Variable, VariableKind, VariableRole};

// amd64 register-file offsets
const RAX: usize = 16;
const RCX: usize = 24;
const RDX: usize = 32;
const RSP: usize = 48;
const RBP: usize = 56;

fn reg(offset: usize) -> Varnode {
    Varnode::Register { offset, size: 8 }
}

fn tmp(idx: usize) -> Varnode {
    Varnode::Temporary { idx, size: 8 }
}

fn c(value: u64, size: usize) -> Varnode {
    Varnode::Constant { value, size }
}

const NONE: Varnode = Varnode::Unused;

/// A lifted block whose `i`-th instruction sits at machine address `addr + i`
fn lifted_block(addr: u64, size: usize, ops: Vec<(Op, Varnode, Varnode, Varnode)>) -> Block {
    LiftedBlock {
        addr,
        size,
        instructions: ops
            .into_iter()
            .enumerate()
            .map(|(i, (op, out, i0, i1))| Instruction::new(addr + i as u64, op, out, [i0, i1]))
            .collect(),
    }
    .into()
}

fn loc(block: u64, stmt_idx: usize) -> CodeLocation {
    CodeLocation::new(block, stmt_idx, Some(block + stmt_idx as u64))
}

/// `push rbp; mov rbp, rsp`
fn prologue() -> Vec<(Op, Varnode, Varnode, Varnode)> {
    vec![
        (Op::IntSub, reg(RSP), reg(RSP), c(8, 8)),
        (Op::Store, NONE, reg(RSP), reg(RBP)),
        (Op::Copy, reg(RBP), reg(RSP), NONE),
    ]
}

/// Builds a function out of blocks and edges; the first block is the entry.
struct FunctionBuilder {
    graph: FunctionGraph,
    blocks: UnorderedMap<u64, Block>,
}

impl FunctionBuilder {
    fn new(func_addr: u64) -> Self {
        Self {
            graph: FunctionGraph::new(func_addr),
            blocks: Default::default(),
        }
    }

    fn block(mut self, block: Block) -> Self {
        self.graph.add_node(block.addr(), block.size());
        self.blocks.insert(block.addr(), block);
        self
    }

    fn edge(mut self, from: u64, to: u64) -> Self {
        self.graph.add_edge(from, to);
        self
    }

    fn call_site(mut self, block: u64, sp_delta: Option<Option<i64>>) -> Self {
        self.graph.add_call_site(
            block,
            CallSite {
                callee: Some(0x9000),
                convention: sp_delta.map(|sp_delta| CallingConvention { sp_delta }),
            },
        );
        self
    }

    fn analyze(
        mut self,
        arch: &Arch,
        options: RecoveryOptions,
    ) -> Result<VariableRecoveryFast, RecoveryError> {
        self.graph.compute_dominance_frontiers();
        VariableRecoveryFast::analyze(arch, &self.graph, &self.blocks, options)
    }
}

/// Run the engine over `block` from the function-entry state
fn process_from_entry(arch: &Arch, block: &Block) -> (AbstractState, VariableCatalog, Vec<Diagnostic>) {
    let mut catalog = VariableCatalog::new(block.addr());
    let mut state = AbstractState::initial(arch, block.addr(), &mut catalog);
    let mut engine = VariableRecoveryEngine::new(arch, &mut catalog, false);
    let outcome = engine.process(&mut state, block).unwrap();
    assert_eq!(outcome, BlockOutcome::Complete);
    let diagnostics = engine.take_diagnostics();
    (state, catalog, diagnostics)
}

fn stack_vars_at(state: &AbstractState, offset: i64) -> Vec<Variable> {
    state.stack_region.get_variables_by_offset(offset)
}

#[test]
fn initial_state_has_return_address_slot() {
    let arch = Arch::amd64();
    let mut catalog = VariableCatalog::new(0x1000);
    let state = AbstractState::initial(&arch, 0x1000, &mut catalog);
    let vars: Vec<(i64, Variable)> = state.stack_region.iter().map(|(k, v)| (k, *v)).collect();
    assert_eq!(vars.len(), 1);
    let (offset, ret_addr) = vars[0];
    assert_eq!(offset, 8);
    assert_eq!(ret_addr.offset, 8);
    assert_eq!(ret_addr.size, 8);
    assert_eq!(ret_addr.role, Some(VariableRole::ReturnAddress));
    assert_eq!(state.processor_state.sp_adjustment, 8);

    let arch = Arch::aarch64();
    let mut catalog = VariableCatalog::new(0x1000);
    let state = AbstractState::initial(&arch, 0x1000, &mut catalog);
    assert!(state.stack_region.is_empty());
    assert_eq!(state.processor_state.sp_adjustment, 0);
}

#[test]
fn write_then_narrower_read_resolve_to_one_variable() {
    let arch = Arch::amd64();
    let mut ops = prologue();
    ops.extend(vec![
        (Op::IntSub, tmp(0), reg(RBP), c(0x10, 8)),
        (Op::Store, NONE, tmp(0), c(0x2a, 8)),
        (Op::IntSub, tmp(1), reg(RBP), c(0x10, 8)),
        (Op::Load, Varnode::Temporary { idx: 2, size: 4 }, tmp(1), NONE),
    ]);
    let block = lifted_block(0x1000, 0x10, ops);
    let (state, catalog, _) = process_from_entry(&arch, &block);

    let vars = stack_vars_at(&state, -0x10);
    assert_eq!(vars.len(), 1);
    let local = vars[0];
    assert_eq!(local.offset, -0x10);
    assert!(local.size >= 4);

    let accesses: Vec<&VariableAccess> = catalog.accesses_of(local.ident);
    assert!(accesses
        .iter()
        .any(|a| a.sort == AccessSort::Write && a.location == loc(0x1000, 4)));
    let read = accesses
        .iter()
        .find(|a| a.sort == AccessSort::Read)
        .unwrap();
    assert_eq!(read.location, loc(0x1000, 6));
    assert_eq!(read.offset, None);

    // The saved frame base got its own slot
    assert_eq!(stack_vars_at(&state, 0).len(), 1);
}

#[test]
fn symbolic_load_address_splits_into_base_and_residual() {
    let arch = Arch::amd64();
    let mut ops = prologue();
    ops.extend(vec![
        (Op::IntSub, tmp(0), reg(RBP), c(0xe0, 8)),
        (Op::IntAdd, tmp(1), tmp(0), reg(RAX)),
        (Op::Load, tmp(2), tmp(1), NONE),
    ]);
    let block = lifted_block(0x1000, 0x10, ops);
    let (state, catalog, _) = process_from_entry(&arch, &block);

    let vars = stack_vars_at(&state, -0xe0);
    assert_eq!(vars.len(), 1);
    assert_eq!(vars[0].offset, -0xe0);
    let read = catalog
        .accesses_of(vars[0].ident)
        .into_iter()
        .find(|a| a.sort == AccessSort::Read)
        .unwrap();
    assert_eq!(read.location, loc(0x1000, 5));
    assert_eq!(
        read.offset,
        Some(OffsetExpr::Symbol(Symbol::Register {
            offset: RAX,
            size: 8
        }))
    );
}

#[test]
fn symbolic_load_inside_a_larger_variable_is_offset_from_its_base() {
    let arch = Arch::amd64();
    let mut b = StructuredBuilder::new();
    b.at(0x2000);
    let buf = b.stack_base_offset(-0xf0, 64);
    let zero = b.constant(0, 64);
    b.store(buf, zero, 0x20);
    let base = b.stack_base_offset(-0xe0, 64);
    let rax = b.reg(RAX, 64);
    let addr = b.binop(BinOp::Add, base, rax);
    let load = b.load(addr, 8);
    let rcx = b.reg(RCX, 64);
    b.assign(rcx, load);
    let block: Block = b.finish(0x2000, 0x10).into();

    let (state, catalog, diagnostics) = process_from_entry(&arch, &block);
    assert!(diagnostics.is_empty());

    let vars = stack_vars_at(&state, -0xe0);
    assert_eq!(vars.len(), 1);
    let buf = vars[0];
    assert_eq!((buf.offset, buf.size), (-0xf0, 0x20));
    let read = catalog
        .accesses_of(buf.ident)
        .into_iter()
        .find(|a| a.sort == AccessSort::Read)
        .unwrap();
    assert_eq!(read.location, CodeLocation::new(0x2000, 1, Some(0x2000)));
    assert_eq!(
        read.offset,
        Some(OffsetExpr::add(
            OffsetExpr::Symbol(Symbol::Register {
                offset: RAX,
                size: 8
            }),
            OffsetExpr::Int(0x10)
        ))
    );
}

#[test]
fn join_takes_larger_stack_adjustment_and_reports() {
    let arch = Arch::x86();
    let mut catalog = VariableCatalog::new(0x10);
    let left = AbstractState::new(&arch, 0x20);
    let mut right = left.clone();
    right.processor_state.sp_adjustment = 8;
    assert_eq!(left.processor_state.sp_adjustment, 4);

    let (merged, diagnostics) = left.merge(&right, 0x40, true, &mut catalog);
    assert_eq!(merged.processor_state.sp_adjustment, 8);
    assert!(matches!(
        diagnostics.as_slice(),
        [Diagnostic::InconsistentMerge { block: 0x40, .. }]
    ));
}

#[test]
fn join_of_diverging_stack_adjustments_through_the_driver() {
    let arch = Arch::x86();
    let esp = Varnode::Register {
        offset: arch.sp_offset,
        size: 4,
    };
    let r = FunctionBuilder::new(0x10)
        .block(lifted_block(0x10, 4, vec![(Op::Nop, NONE, NONE, NONE)]))
        .block(lifted_block(
            0x20,
            4,
            vec![(Op::IntAdd, esp, esp, c(4, 4))],
        ))
        .block(lifted_block(0x30, 4, vec![(Op::Nop, NONE, NONE, NONE)]))
        .block(lifted_block(0x40, 4, vec![(Op::Nop, NONE, NONE, NONE)]))
        .edge(0x10, 0x20)
        .edge(0x10, 0x30)
        .edge(0x20, 0x40)
        .edge(0x30, 0x40)
        .analyze(&arch, RecoveryOptions::default())
        .unwrap();

    assert_eq!(r.output_states[&0x20].processor_state.sp_adjustment, 8);
    assert_eq!(r.output_states[&0x30].processor_state.sp_adjustment, 4);
    assert_eq!(r.input_states[&0x40].processor_state.sp_adjustment, 8);
    assert!(r
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::InconsistentMerge { block: 0x40, .. })));
}

fn call_block() -> Block {
    lifted_block(
        0x10,
        8,
        vec![(Op::Call, NONE, Varnode::Address { addr: 0x9000 }, NONE)],
    )
}

#[test]
fn call_site_stack_delta_is_applied() {
    let arch = Arch::amd64();
    let r = FunctionBuilder::new(0x10)
        .block(call_block())
        .call_site(0x10, Some(Some(4)))
        .analyze(&arch, RecoveryOptions::default())
        .unwrap();
    let ps = &r.output_states[&0x10].processor_state;
    assert_eq!(ps.sp_adjustment, 8 + 4);
    assert!(ps.sp_adjusted);
    assert!(r.diagnostics.is_empty());
}

#[test]
fn unknown_calling_convention_falls_back_to_a_guess() {
    let arch = Arch::amd64();
    let r = FunctionBuilder::new(0x10)
        .block(call_block())
        .call_site(0x10, None)
        .analyze(&arch, RecoveryOptions::default())
        .unwrap();
    let ps = &r.output_states[&0x10].processor_state;
    assert_eq!(ps.sp_adjustment, 8 + 8);
    assert!(ps.sp_adjusted);
    assert_eq!(
        r.diagnostics,
        vec![Diagnostic::UnknownCallingConvention {
            call_site: 0x10,
            callee: Some(0x9000)
        }]
    );

    // No guess where the return address is not pushed
    let arch = Arch::aarch64();
    let r = FunctionBuilder::new(0x10)
        .block(call_block())
        .call_site(0x10, Some(None))
        .analyze(&arch, RecoveryOptions::default())
        .unwrap();
    let ps = &r.output_states[&0x10].processor_state;
    assert_eq!(ps.sp_adjustment, 0);
    assert!(!ps.sp_adjusted);
    assert!(r.diagnostics.is_empty());
}

#[test]
fn stack_tracking_can_be_disabled() {
    let arch = Arch::amd64();
    let r = FunctionBuilder::new(0x10)
        .block(call_block())
        .call_site(0x10, Some(Some(4)))
        .analyze(
            &arch,
            RecoveryOptions {
                track_sp: false,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(r.output_states[&0x10].processor_state.sp_adjustment, 8);
}

#[test]
fn reprocessing_a_block_is_idempotent() {
    let arch = Arch::amd64();
    let mut ops = prologue();
    ops.extend(vec![
        (Op::IntSub, tmp(0), reg(RBP), c(0x10, 8)),
        (Op::Store, NONE, tmp(0), reg(RAX)),
        (Op::IntSub, tmp(1), reg(RBP), c(0x18, 8)),
        (Op::Load, reg(RCX), tmp(1), NONE),
        (Op::IntSub, reg(RDX), reg(RSP), c(0x20, 8)),
        (Op::IntLess, Varnode::Temporary { idx: 3, size: 1 }, reg(RAX), reg(RCX)),
    ]);
    let block = lifted_block(0x1000, 0x20, ops);

    let mut catalog = VariableCatalog::new(0x1000);
    let input = AbstractState::initial(&arch, 0x1000, &mut catalog);

    let mut first = input.clone();
    VariableRecoveryEngine::new(&arch, &mut catalog, false)
        .process(&mut first, &block)
        .unwrap();
    let variables = catalog.variables().count();
    let accesses = catalog.accesses().count();
    let type_variables = catalog.type_variable_count();

    let mut second = input.clone();
    VariableRecoveryEngine::new(&arch, &mut catalog, false)
        .process(&mut second, &block)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.type_constraints, second.type_constraints);
    assert_eq!(first.typevars, second.typevars);
    assert_eq!(first.processor_state, second.processor_state);
    assert_eq!(catalog.variables().count(), variables);
    assert_eq!(catalog.accesses().count(), accesses);
    assert_eq!(catalog.type_variable_count(), type_variables);
}

fn overlapping_loads() -> Block {
    let mut b = StructuredBuilder::new();
    b.at(0x10);
    for (offset, size, dst) in [(-0xc, 4, RAX), (-0x10, 8, RCX), (-0xc, 4, RDX)] {
        let addr = b.stack_base_offset(offset, 64);
        let load = b.load(addr, size);
        let dst = b.reg(dst, 64);
        b.assign(dst, load);
    }
    b.finish(0x10, 0x10).into()
}

#[test]
fn overlapping_variables_resolve_deterministically() {
    let arch = Arch::amd64();
    let block = overlapping_loads();

    let (state, catalog, diagnostics) = process_from_entry(&arch, &block);
    let narrow = stack_vars_at(&state, -0xc)[0];
    let wide = stack_vars_at(&state, -0x10)[0];
    assert_eq!((narrow.offset, narrow.size), (-0xc, 4));
    assert_eq!((wide.offset, wide.size), (-0x10, 8));
    assert_eq!(
        diagnostics,
        vec![Diagnostic::OverlappingVariables {
            loc: CodeLocation::new(0x10, 2, Some(0x10)),
            offset: -0xc,
            candidates: vec![narrow.ident, wide.ident],
        }]
    );
    // The earliest-minted candidate is the one read
    assert!(catalog.accesses_of(narrow.ident).iter().any(|a| {
        a.sort == AccessSort::Read && a.location == CodeLocation::new(0x10, 2, Some(0x10))
    }));
    assert!(catalog
        .accesses_of(wide.ident)
        .iter()
        .all(|a| a.location.stmt_idx != 2));

    // Same choice on every run
    for _ in 0..3 {
        let (again, _, diags) = process_from_entry(&arch, &block);
        assert_eq!(again, state);
        assert_eq!(diags, diagnostics);
    }
}

#[test]
fn stores_replace_overlapping_variables() {
    let arch = Arch::amd64();
    let mut b = StructuredBuilder::new();
    b.at(0x10);
    let addr = b.stack_base_offset(-0x10, 64);
    let data = b.constant(1, 64);
    b.store(addr, data, 8);
    let addr = b.stack_base_offset(-0xc, 64);
    let data = b.constant(2, 32);
    b.store(addr, data, 4);
    let block: Block = b.finish(0x10, 0x10).into();

    let (state, _, _) = process_from_entry(&arch, &block);
    for offset in [-0x10, -0xc, -0x9] {
        assert!(stack_vars_at(&state, offset).len() <= 1);
    }
    assert!(stack_vars_at(&state, -0x10).is_empty());
    assert_eq!(stack_vars_at(&state, -0xc)[0].size, 4);
}

/// 0x10 -> 0x20 (self loop) -> 0x30; the loop stores `size` bytes at rsp-0x18 each time around
fn loop_function(entry_store: Option<usize>, loop_store: usize) -> FunctionBuilder {
    let store = |size: usize| {
        vec![
            (Op::IntSub, tmp(0), reg(RSP), c(0x18, 8)),
            (Op::Store, NONE, tmp(0), c(1, size)),
        ]
    };
    let entry_ops = match entry_store {
        Some(size) => store(size),
        None => vec![(Op::Nop, NONE, NONE, NONE)],
    };
    FunctionBuilder::new(0x10)
        .block(lifted_block(0x10, 8, entry_ops))
        .block(lifted_block(0x20, 8, store(loop_store)))
        .block(lifted_block(0x30, 8, vec![(Op::Nop, NONE, NONE, NONE)]))
        .edge(0x10, 0x20)
        .edge(0x20, 0x20)
        .edge(0x20, 0x30)
}

#[test]
fn loop_reaches_a_fixed_point_within_the_cap() {
    let arch = Arch::amd64();
    let r = loop_function(None, 8)
        .analyze(
            &arch,
            RecoveryOptions {
                max_iterations: 10,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(r.node_iterations[&0x20], 2);
    assert!(!r
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::IterationCapReached { .. })));
    assert_eq!(r.input_states[&0x30], r.output_states[&0x20]);
}

#[test]
fn iteration_cap_is_honoured() {
    let arch = Arch::amd64();
    let r = loop_function(None, 8)
        .analyze(&arch, RecoveryOptions::default())
        .unwrap();
    assert_eq!(r.node_iterations[&0x20], 1);
    assert!(r.diagnostics.contains(&Diagnostic::IterationCapReached {
        block: 0x20,
        iterations: 1
    }));
    // Still a complete result
    assert!(r.output_states.contains_key(&0x30));
}

#[test]
fn loop_carried_phi_is_reused_until_convergence() {
    let arch = Arch::amd64();
    let r = loop_function(Some(8), 4)
        .analyze(
            &arch,
            RecoveryOptions {
                max_iterations: 10,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(r.node_iterations[&0x20], 2);

    let before = stack_vars_at(&r.output_states[&0x10], -0x10)[0];
    let in_loop = stack_vars_at(&r.output_states[&0x20], -0x10)[0];
    let phi = stack_vars_at(&r.input_states[&0x20], -0x10);
    assert_eq!(phi.len(), 1);
    let phi = phi[0];
    assert!(r.catalog.is_phi(phi.ident));
    assert_ne!(phi.ident, before.ident);
    assert_ne!(phi.ident, in_loop.ident);
    assert_eq!(
        r.catalog
            .phi_sources(phi.ident)
            .unwrap()
            .iter()
            .copied()
            .collect::<Vec<_>>(),
        vec![before.ident, in_loop.ident]
    );
}

#[test]
fn diverging_definitions_meet_in_a_phi() {
    let arch = Arch::amd64();
    let store = |value: u64| {
        vec![
            (Op::IntSub, tmp(0), reg(RSP), c(0x18, 8)),
            (Op::Store, NONE, tmp(0), c(value, 8)),
        ]
    };
    let r = FunctionBuilder::new(0x10)
        .block(lifted_block(0x10, 4, vec![(Op::Nop, NONE, NONE, NONE)]))
        .block(lifted_block(0x20, 4, store(1)))
        .block(lifted_block(0x30, 4, store(2)))
        .block(lifted_block(0x40, 4, vec![(Op::Nop, NONE, NONE, NONE)]))
        .edge(0x10, 0x20)
        .edge(0x10, 0x30)
        .edge(0x20, 0x40)
        .edge(0x30, 0x40)
        .analyze(&arch, RecoveryOptions::default())
        .unwrap();

    let left = stack_vars_at(&r.output_states[&0x20], -0x10)[0];
    let right = stack_vars_at(&r.output_states[&0x30], -0x10)[0];
    assert_ne!(left.ident, right.ident);

    let merged = &r.input_states[&0x40];
    let at_slot = stack_vars_at(merged, -0x10);
    assert_eq!(at_slot.len(), 1);
    let phi = at_slot[0];
    assert_ne!(phi.ident, left.ident);
    assert_ne!(phi.ident, right.ident);
    assert!(r.catalog.is_phi(phi.ident));
    assert!(!merged
        .stack_region
        .variables()
        .iter()
        .any(|v| v.ident == left.ident || v.ident == right.ident));
    // Identical definitions are left alone
    assert_eq!(
        stack_vars_at(merged, 8)[0].role,
        Some(VariableRole::ReturnAddress)
    );
}

#[test]
fn empty_function_is_rejected() {
    let arch = Arch::amd64();
    let graph = FunctionGraph::new(0x10);
    let blocks: UnorderedMap<u64, Block> = Default::default();
    assert_eq!(
        VariableRecoveryFast::analyze(&arch, &graph, &blocks, RecoveryOptions::default())
            .unwrap_err(),
        RecoveryError::EmptyFunction { func_addr: 0x10 }
    );
}

fn unsupported_assignment() -> Block {
    let mut b = StructuredBuilder::new();
    let dst = b.reg(RAX, 64);
    let src = b.unsupported("rdrand");
    b.at(0x10).assign(dst, src).ret();
    b.finish(0x10, 4).into()
}

#[test]
fn unsupported_expression_degrades_by_default() {
    let arch = Arch::amd64();
    let r = FunctionBuilder::new(0x10)
        .block(unsupported_assignment())
        .analyze(&arch, RecoveryOptions::default())
        .unwrap();
    let error = RecoveryError::UnsupportedExpression {
        loc: CodeLocation::new(0x10, 0, Some(0x10)),
        expr: "rdrand".into(),
    };
    assert_eq!(
        r.outcomes[&0x10],
        BlockOutcome::Degraded {
            errors: vec![error.clone()]
        }
    );
    assert!(r
        .diagnostics
        .contains(&Diagnostic::DegradedEvaluation { error }));
    // The assignment still happened, with an unbound value
    assert_eq!(
        r.output_states[&0x10]
            .register_region
            .get_variables_by_offset(RAX as i64)
            .len(),
        1
    );
}

#[test]
fn unsupported_expression_aborts_in_strict_mode() {
    let arch = Arch::amd64();
    let err = FunctionBuilder::new(0x10)
        .block(unsupported_assignment())
        .analyze(
            &arch,
            RecoveryOptions {
                fail_fast: true,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, RecoveryError::UnsupportedExpression { .. }));
}

#[test]
fn malformed_lifted_instructions_degrade() {
    let arch = Arch::amd64();
    let block = lifted_block(
        0x10,
        8,
        vec![
            (Op::IntAdd, reg(RAX), reg(RAX), c(1, 4)),
            (Op::Copy, reg(RCX), tmp(9), NONE),
        ],
    );
    let r = FunctionBuilder::new(0x10)
        .block(block)
        .analyze(&arch, RecoveryOptions::default())
        .unwrap();
    match &r.outcomes[&0x10] {
        BlockOutcome::Degraded { errors } => {
            assert!(matches!(
                errors.as_slice(),
                [
                    RecoveryError::MalformedInstruction { addr: 0x10, .. },
                    RecoveryError::UndefinedTemporary { idx: 9, .. }
                ]
            ));
        }
        o => panic!("Expected a degraded outcome, got {:?}", o),
    }
}

#[test]
fn taking_the_address_of_a_local_links_its_type() {
    let arch = Arch::amd64();
    let block = lifted_block(
        0x10,
        8,
        vec![
            (Op::IntSub, reg(RAX), reg(RSP), c(0x18, 8)),
            (Op::IntLess, Varnode::Temporary { idx: 0, size: 1 }, reg(RCX), reg(RDX)),
        ],
    );
    let (state, catalog, _) = process_from_entry(&arch, &block);

    let local = stack_vars_at(&state, -0x10)[0];
    assert!(catalog
        .accesses_of(local.ident)
        .iter()
        .any(|a| a.sort == AccessSort::Reference && a.location == loc(0x10, 0)));
    assert!(state.type_constraints.iter().any(|c| matches!(
        c,
        TypeConstraint::Subtype(TypeTerm::Derived(_, Label::Load), TypeTerm::Var(_))
    )));
    assert!(state.type_constraints.iter().any(|c| matches!(
        c,
        TypeConstraint::Subtype(TypeTerm::Var(_), TypeTerm::Derived(_, Label::Store))
    )));
    // Comparison of rcx and rdx
    assert!(state.type_constraints.iter().any(|c| matches!(
        c,
        TypeConstraint::Subtype(TypeTerm::Var(_), TypeTerm::Var(_))
    )));
}

#[test]
fn names_and_live_variables_are_published() {
    let arch = Arch::amd64();
    let mut ops = prologue();
    ops.extend(vec![
        (Op::IntSub, tmp(0), reg(RBP), c(0x10, 8)),
        (Op::Store, NONE, tmp(0), c(0, 8)),
        (Op::Copy, reg(RCX), reg(RAX), NONE),
    ]);
    let r = FunctionBuilder::new(0x1000)
        .block(lifted_block(0x1000, 0x10, ops))
        .analyze(&arch, RecoveryOptions::default())
        .unwrap();

    let out = &r.output_states[&0x1000];
    let name_at = |offset: i64| r.name_of(&stack_vars_at(out, offset)[0]);
    assert_eq!(name_at(-0x10), "var_0");
    assert_eq!(name_at(0), "var_1");
    assert_eq!(name_at(8), "ret_addr");
    let reg_name = |offset: usize| {
        r.name_of(&out.register_region.get_variables_by_offset(offset as i64)[0])
    };
    assert_eq!(reg_name(RAX), "rax_0");
    assert_eq!(reg_name(RCX), "rcx_0");

    let live = r.catalog.live_variables(0x1000).unwrap();
    assert_eq!(live.stack, out.stack_region);
    assert_eq!(live.register, out.register_region);
    assert_eq!(
        r.catalog.variables_of_kind(VariableKind::Stack).len(),
        3
    );

    let summary = r.summary();
    assert!(summary.contains("ret_addr"));
    assert!(summary.contains("write var_0"));
    let dot = r.generate_dot();
    assert!(dot.starts_with("digraph VariableRecovery"));
    assert!(dot.contains("b1000"));
}

const LISTING: &str = "
arch amd64
function 0x1000

block 0x1000 0x10
  0x1000 INT_SUB  rsp   rsp   $8
  0x1001 STORE    _     rsp   rbp
  0x1002 COPY     rbp   rsp
  0x1003 INT_SUB  t0:8  rbp   $0x10
  0x1004 STORE    _     t0:8  $0x2a:8
  0x1005 CALL     _     @0x9000
block 0x1010 0x8
  0x1010 INT_SUB  t1:8  rbp   $0x10
  0x1011 LOAD     t2:4  t1:8
  0x1012 RETURN   _     t2:4

edge 0x1000 0x1010
call 0x1000 callee 0x9000 sp_delta 8
";

#[test]
fn text_listing_matches_hand_built_blocks() {
    let listing = crate::text_lifter::lift_from(LISTING).unwrap();
    let from_listing = VariableRecoveryFast::analyze(
        &listing.arch,
        &listing.graph,
        &listing.blocks,
        RecoveryOptions::default(),
    )
    .unwrap();

    let mut first = prologue();
    first.extend(vec![
        (Op::IntSub, tmp(0), reg(RBP), c(0x10, 8)),
        (Op::Store, NONE, tmp(0), c(0x2a, 8)),
        (Op::Call, NONE, Varnode::Address { addr: 0x9000 }, NONE),
    ]);
    let second = vec![
        (Op::IntSub, tmp(1), reg(RBP), c(0x10, 8)),
        (Op::Load, Varnode::Temporary { idx: 2, size: 4 }, tmp(1), NONE),
        (Op::Return, NONE, Varnode::Temporary { idx: 2, size: 4 }, NONE),
    ];
    let by_hand = FunctionBuilder::new(0x1000)
        .block(lifted_block(0x1000, 0x10, first))
        .block(lifted_block(0x1010, 0x8, second))
        .edge(0x1000, 0x1010)
        .call_site(0x1000, Some(Some(8)))
        .analyze(&Arch::amd64(), RecoveryOptions::default())
        .unwrap();

    assert_eq!(from_listing.summary(), by_hand.summary());
    assert_eq!(from_listing.output_states, by_hand.output_states);

    // The read in the second block lands in the local written by the first
    let local = stack_vars_at(&by_hand.output_states[&0x1000], -0x10)[0];
    assert!(by_hand
        .catalog
        .accesses_of(local.ident)
        .iter()
        .any(|a| a.sort == AccessSort::Read && a.location == loc(0x1010, 1)));
}

#[test]
fn pointer_loads_take_field_offsets_from_arithmetic() {
    let arch = Arch::amd64();
    let block = lifted_block(
        0x10,
        8,
        vec![
            (Op::IntAdd, tmp(0), reg(RAX), c(8, 8)),
            (Op::Load, Varnode::Temporary { idx: 1, size: 4 }, tmp(0), NONE),
        ],
    );
    let (state, _, _) = process_from_entry(&arch, &block);
    let rax = state.register_region.get_variables_by_offset(RAX as i64)[0];
    let tv = state.typevars.current(rax.ident).unwrap();
    assert!(state
        .type_constraints
        .contains(&TypeConstraint::Exists(TypeTerm::from(tv).loaded_field(32, 8))));
    // Nothing on the stack
    assert_eq!(state.stack_region.len(), 1);
}

#[test]
fn aligning_the_stack_pointer_keeps_it_on_the_stack() {
    let arch = Arch::amd64();
    let block = lifted_block(
        0x10,
        8,
        vec![
            (Op::IntAnd, reg(RSP), reg(RSP), c(0xffff_ffff_ffff_fff0, 8)),
            (Op::IntSub, tmp(0), reg(RSP), c(0x18, 8)),
            (Op::Store, NONE, tmp(0), c(1, 8)),
        ],
    );
    let (state, _, _) = process_from_entry(&arch, &block);
    assert_eq!(state.processor_state.sp_adjustment, 8);
    assert_eq!(stack_vars_at(&state, -0x10).len(), 1);
}

#[test]
fn indexed_store_writes_into_the_covering_variable() {
    let arch = Arch::amd64();
    let mut b = StructuredBuilder::new();
    b.at(0x10);
    let addr = b.stack_base_offset(-0x40, 64);
    let data = b.constant(0, 64);
    b.store(addr, data, 8);
    let base = b.stack_base_offset(-0x40, 64);
    let rax = b.reg(RAX, 64);
    let addr = b.binop(BinOp::Add, base, rax);
    let data = b.constant(1, 32);
    b.store(addr, data, 4);
    // Nothing is known at -0x80, so this one is dropped
    let base = b.stack_base_offset(-0x80, 64);
    let rcx = b.reg(RCX, 64);
    let addr = b.binop(BinOp::Add, base, rcx);
    let data = b.constant(2, 32);
    b.store(addr, data, 4);
    let block: Block = b.finish(0x10, 0x10).into();

    let (state, catalog, _) = process_from_entry(&arch, &block);
    let vars = stack_vars_at(&state, -0x40);
    assert_eq!(vars.len(), 1);
    let local = vars[0];
    assert_eq!((local.offset, local.size), (-0x40, 8));
    assert!(stack_vars_at(&state, -0x80).is_empty());
    // ret_addr and the local
    assert_eq!(catalog.variables_of_kind(VariableKind::Stack).len(), 2);

    let indexed = catalog
        .accesses_of(local.ident)
        .into_iter()
        .find(|a| a.location.stmt_idx == 1)
        .unwrap();
    assert_eq!(indexed.sort, AccessSort::Write);
    assert_eq!(
        indexed.offset,
        Some(OffsetExpr::Symbol(Symbol::Register {
            offset: RAX,
            size: 8
        }))
    );
}
