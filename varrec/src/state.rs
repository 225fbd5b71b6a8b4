//! The abstract state threaded through a function: two location stores, the processor state and
//! the accumulated type information.

use crate::arch::Arch;
use crate::catalog::VariableCatalog;
use crate::error::Diagnostic;
use crate::location_store::{LocationStore, Replacements};
use crate::log::*;
use crate::processor_state::ProcessorState;
use crate::typevars::{ConstraintSet, TypeConstraint, TypeVariableStore};
use crate::variable::{Variable, VariableKind, VariableRole};
use std::collections::BTreeSet;

#[derive(Clone, Debug)]
pub struct AbstractState {
    /// The block this state is an input to (or output of)
    pub block_addr: u64,
    pub stack_region: LocationStore,
    pub register_region: LocationStore,
    pub processor_state: ProcessorState,
    pub typevars: TypeVariableStore,
    pub type_constraints: ConstraintSet,
}

/// Convergence only looks at the two location stores. Processor state and type data are
/// deliberately left out.
impl PartialEq for AbstractState {
    fn eq(&self, other: &Self) -> bool {
        self.stack_region == other.stack_region && self.register_region == other.register_region
    }
}

impl AbstractState {
    pub fn new(arch: &Arch, block_addr: u64) -> Self {
        Self {
            block_addr,
            stack_region: LocationStore::new(),
            register_region: LocationStore::new(),
            processor_state: ProcessorState::new(arch),
            typevars: TypeVariableStore::new(),
            type_constraints: ConstraintSet::new(),
        }
    }

    /// The state on entry to the function starting at `entry`. On architectures where a call
    /// pushes the return address, its slot is pre-registered.
    pub fn initial(arch: &Arch, entry: u64, catalog: &mut VariableCatalog) -> Self {
        let mut state = Self::new(arch, entry);
        if arch.call_pushes_ret {
            let offset = arch.bytes() as i64;
            let ret_addr = catalog.new_variable(
                VariableKind::Stack,
                offset,
                arch.bytes(),
                Some(VariableRole::ReturnAddress),
            );
            catalog.add_variable(VariableKind::Stack, offset, ret_addr);
            state.stack_region.add_variable(offset, ret_addr);
        }
        state
    }

    pub fn region(&self, kind: VariableKind) -> &LocationStore {
        match kind {
            VariableKind::Stack => &self.stack_region,
            VariableKind::Register => &self.register_region,
        }
    }

    pub fn add_type_constraint(&mut self, constraint: TypeConstraint) {
        self.type_constraints.insert(constraint);
    }

    pub fn add_type_constraints(&mut self, constraints: impl IntoIterator<Item = TypeConstraint>) {
        self.type_constraints.extend(constraints);
    }

    /// Join `self` with `other` on entry to `node`.
    ///
    /// With `synthesize_phi` set, every offset holding different variables on the two sides gets
    /// a phi variable from `catalog` that replaces all of them. Otherwise the stores are simply
    /// unioned.
    pub fn merge(
        &self,
        other: &AbstractState,
        node: u64,
        synthesize_phi: bool,
        catalog: &mut VariableCatalog,
    ) -> (AbstractState, Vec<Diagnostic>) {
        let mut replacements = Replacements::new();
        for kind in [VariableKind::Stack, VariableKind::Register] {
            for (offset, left, right) in self.region(kind).zip_slots(other.region(kind)) {
                let (left, right) = match (left, right) {
                    (Some(l), Some(r)) if l != r => (l, r),
                    _ => continue,
                };
                let sources: BTreeSet<Variable> = left.union(right).copied().collect();
                if !synthesize_phi {
                    debug!("Keeping distinct variables at join";
                           "node" => format_args!("{:#x}", node),
                           "offset" => offset,
                           "variables" => ?sources);
                    continue;
                }
                let phi = catalog.make_phi_variable(node, kind, offset, &sources);
                for v in sources {
                    if v.ident != phi.ident {
                        replacements.insert(v.ident, phi);
                    }
                }
            }
        }

        let mut diagnostics = vec![];
        let (processor_state, diag) = self.processor_state.merge(&other.processor_state, node);
        diagnostics.extend(diag);

        let mut type_constraints = self.type_constraints.clone();
        type_constraints.extend(other.type_constraints.iter().cloned());

        let merged = AbstractState {
            block_addr: node,
            stack_region: self
                .stack_region
                .clone()
                .replace(&replacements)
                .merge(&other.stack_region, &replacements),
            register_region: self
                .register_region
                .clone()
                .replace(&replacements)
                .merge(&other.register_region, &replacements),
            processor_state,
            typevars: self.typevars.clone().merge(&other.typevars),
            type_constraints,
        };
        (merged, diagnostics)
    }
}
