//! The per-function variable catalog.
//!
//! This is the only place variable identities are minted. It also keeps the complete history of
//! reads, writes and references, interns type variables, caches phi variables per join point,
//! and holds the final names and per-block live-variable snapshots.

use crate::arch::Arch;
use crate::block::{Atom, CodeLocation};
use crate::containers::unordered::UnorderedMap;
use crate::containers::InsertionOrderedSet;
use crate::location_store::LocationStore;
use crate::log::*;
use crate::typevars::TypeVariable;
use crate::value::OffsetExpr;
use crate::variable::{Variable, VariableIdent, VariableKind, VariableRole};
use std::collections::BTreeSet;

/// What an access did to a variable
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum AccessSort {
    Write,
    Read,
    /// The variable's address was taken
    Reference,
}

/// A single access to a variable at a program point.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct VariableAccess {
    pub variable: VariableIdent,
    pub sort: AccessSort,
    pub location: CodeLocation,
    pub atom: Option<Atom>,
    /// Where inside the variable the access lands; `None` is its start
    pub offset: Option<OffsetExpr>,
}

/// Variables live on exit from a block
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct LiveVariables {
    pub stack: LocationStore,
    pub register: LocationStore,
}

#[derive(Debug)]
pub struct VariableCatalog {
    func_addr: u64,
    next_stack_idx: usize,
    next_register_idx: usize,
    variables: UnorderedMap<VariableIdent, Variable>,
    stack_region: LocationStore,
    register_region: LocationStore,
    accesses: InsertionOrderedSet<VariableAccess>,
    type_variables: InsertionOrderedSet<(VariableIdent, CodeLocation)>,
    phis: UnorderedMap<(u64, VariableKind, i64), VariableIdent>,
    phi_sources: UnorderedMap<VariableIdent, BTreeSet<VariableIdent>>,
    names: UnorderedMap<VariableIdent, String>,
    live_variables: UnorderedMap<u64, LiveVariables>,
}

impl VariableCatalog {
    pub fn new(func_addr: u64) -> Self {
        Self {
            func_addr,
            next_stack_idx: 0,
            next_register_idx: 0,
            variables: Default::default(),
            stack_region: Default::default(),
            register_region: Default::default(),
            accesses: InsertionOrderedSet::new(),
            type_variables: InsertionOrderedSet::new(),
            phis: Default::default(),
            phi_sources: Default::default(),
            names: Default::default(),
            live_variables: Default::default(),
        }
    }

    pub fn func_addr(&self) -> u64 {
        self.func_addr
    }

    pub fn next_variable_ident(&mut self, kind: VariableKind) -> VariableIdent {
        let counter = match kind {
            VariableKind::Stack => &mut self.next_stack_idx,
            VariableKind::Register => &mut self.next_register_idx,
        };
        let idx = *counter;
        *counter += 1;
        VariableIdent { kind, idx }
    }

    /// Mint a fresh variable of `kind` at `offset`. The variable is not registered anywhere yet.
    pub fn new_variable(
        &mut self,
        kind: VariableKind,
        offset: i64,
        size: usize,
        role: Option<VariableRole>,
    ) -> Variable {
        Variable {
            ident: self.next_variable_ident(kind),
            offset,
            size,
            region: self.func_addr,
            role,
        }
    }

    fn region_mut(&mut self, kind: VariableKind) -> &mut LocationStore {
        match kind {
            VariableKind::Stack => &mut self.stack_region,
            VariableKind::Register => &mut self.register_region,
        }
    }

    /// Register `var` at `offset`, keeping overlapping variables
    pub fn add_variable(&mut self, kind: VariableKind, offset: i64, var: Variable) {
        self.variables.insert(var.ident, var);
        self.region_mut(kind).add_variable(offset, var);
    }

    /// Register `var` at `offset`, replacing overlapping variables in the catalog's view of the
    /// region. Replaced variables remain known by identity.
    pub fn set_variable(&mut self, kind: VariableKind, offset: i64, var: Variable) {
        self.variables.insert(var.ident, var);
        self.region_mut(kind).set_variable(offset, var);
    }

    fn record(
        &mut self,
        var: &Variable,
        sort: AccessSort,
        offset: Option<OffsetExpr>,
        location: CodeLocation,
        atom: Option<Atom>,
    ) {
        self.variables.entry(var.ident).or_insert(*var);
        self.accesses.insert(VariableAccess {
            variable: var.ident,
            sort,
            location,
            atom,
            offset,
        });
    }

    pub fn read_from(
        &mut self,
        var: &Variable,
        offset: Option<OffsetExpr>,
        location: CodeLocation,
        atom: Option<Atom>,
    ) {
        self.record(var, AccessSort::Read, offset, location, atom)
    }

    pub fn write_to(
        &mut self,
        var: &Variable,
        offset: Option<OffsetExpr>,
        location: CodeLocation,
        atom: Option<Atom>,
    ) {
        self.record(var, AccessSort::Write, offset, location, atom)
    }

    pub fn reference_at(
        &mut self,
        var: &Variable,
        offset: Option<OffsetExpr>,
        location: CodeLocation,
        atom: Option<Atom>,
    ) {
        self.record(var, AccessSort::Reference, offset, location, atom)
    }

    /// Variables of `kind` accessed with `sort` at the statement `location`, in the order the
    /// accesses were first recorded.
    pub fn find_variables_by_stmt(
        &self,
        location: &CodeLocation,
        kind: VariableKind,
        sort: AccessSort,
    ) -> Vec<(Variable, Option<OffsetExpr>)> {
        self.accesses
            .iter()
            .filter(|a| {
                a.location.block_addr == location.block_addr
                    && a.location.stmt_idx == location.stmt_idx
                    && a.variable.kind == kind
                    && a.sort == sort
            })
            .filter_map(|a| {
                self.variables
                    .get(&a.variable)
                    .map(|v| (*v, a.offset.clone()))
            })
            .collect()
    }

    /// Variables of `kind` accessed by `atom` inside the statement `location`
    pub fn find_variables_by_atom(
        &self,
        location: &CodeLocation,
        atom: Atom,
        kind: VariableKind,
    ) -> Vec<(Variable, Option<OffsetExpr>)> {
        self.accesses
            .iter()
            .filter(|a| {
                a.location.block_addr == location.block_addr
                    && a.location.stmt_idx == location.stmt_idx
                    && a.atom == Some(atom)
                    && a.variable.kind == kind
            })
            .filter_map(|a| {
                self.variables
                    .get(&a.variable)
                    .map(|v| (*v, a.offset.clone()))
            })
            .collect()
    }

    /// The type variable for `var` at `location`. Repeated requests return the same handle.
    pub fn type_variable(&mut self, var: VariableIdent, location: CodeLocation) -> TypeVariable {
        TypeVariable(self.type_variables.insert((var, location)))
    }

    pub fn type_variable_count(&self) -> usize {
        self.type_variables.len()
    }

    /// The phi variable reconciling `sources` at `offset` of the `kind` region, on entry to
    /// `block`. The same phi is returned for every request at the same place; its source set
    /// grows across requests while its size stays that of the widest initial source.
    pub fn make_phi_variable(
        &mut self,
        block: u64,
        kind: VariableKind,
        offset: i64,
        sources: &BTreeSet<Variable>,
    ) -> Variable {
        let size = sources.iter().map(|v| v.size).max().unwrap_or(1);
        let existing = self
            .phis
            .get(&(block, kind, offset))
            .and_then(|ident| self.variables.get(ident))
            .copied();
        let phi = match existing {
            Some(phi) => phi,
            None => {
                let role = sources.iter().find_map(|v| v.role);
                let phi = self.new_variable(kind, offset, size, role);
                self.phis.insert((block, kind, offset), phi.ident);
                self.add_variable(kind, offset, phi);
                debug!("Created phi variable";
                       "block" => format_args!("{:#x}", block),
                       "phi" => ?phi,
                       "sources" => ?sources);
                phi
            }
        };
        let entry = self.phi_sources.entry(phi.ident).or_default();
        entry.extend(sources.iter().map(|v| v.ident).filter(|s| *s != phi.ident));
        phi
    }

    pub fn is_phi(&self, var: VariableIdent) -> bool {
        self.phi_sources.contains_key(&var)
    }

    pub fn phi_sources(&self, phi: VariableIdent) -> Option<&BTreeSet<VariableIdent>> {
        self.phi_sources.get(&phi)
    }

    pub fn get_variable(&self, ident: VariableIdent) -> Option<&Variable> {
        self.variables.get(&ident)
    }

    /// All variables ever minted, in identity order
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        let mut vars: Vec<&Variable> = self.variables.values().collect();
        vars.sort();
        vars.into_iter()
    }

    pub fn variables_of_kind(&self, kind: VariableKind) -> Vec<Variable> {
        self.variables().filter(|v| v.kind() == kind).copied().collect()
    }

    pub fn accesses(&self) -> impl Iterator<Item = &VariableAccess> {
        self.accesses.iter()
    }

    pub fn accesses_of(&self, var: VariableIdent) -> Vec<&VariableAccess> {
        self.accesses.iter().filter(|a| a.variable == var).collect()
    }

    /// Assign display names: `ret_addr` for the return-address slot, `arg_N` for stack slots
    /// above it, `var_N` for other stack slots, and `<register>_N` for registers.
    pub fn assign_variable_names(&mut self, arch: &Arch) {
        let args_start = if arch.call_pushes_ret {
            2 * arch.bytes() as i64
        } else {
            0
        };
        let mut names: UnorderedMap<VariableIdent, String> = Default::default();
        let mut var_idx = 0;
        let mut arg_idx = 0;
        let mut stack_vars = self.variables_of_kind(VariableKind::Stack);
        stack_vars.sort_by_key(|v| (v.offset, v.ident));
        for v in stack_vars {
            let name = if v.role == Some(VariableRole::ReturnAddress) {
                "ret_addr".to_owned()
            } else if v.offset >= args_start {
                arg_idx += 1;
                format!("arg_{}", arg_idx - 1)
            } else {
                var_idx += 1;
                format!("var_{}", var_idx - 1)
            };
            names.insert(v.ident, name);
        }
        let mut reg_idx: UnorderedMap<&'static str, usize> = Default::default();
        for v in self.variables_of_kind(VariableKind::Register) {
            let reg_name = arch
                .register_name(v.offset as usize)
                .unwrap_or("reg");
            let idx = reg_idx.entry(reg_name).or_insert(0);
            names.insert(v.ident, format!("{}_{}", reg_name, idx));
            *idx += 1;
        }
        self.names = names;
    }

    pub fn name_of(&self, var: VariableIdent) -> Option<&str> {
        self.names.get(&var).map(|s| s.as_str())
    }

    /// Publish the variables live on exit from `block`
    pub fn set_live_variables(&mut self, block: u64, stack: LocationStore, register: LocationStore) {
        self.live_variables
            .insert(block, LiveVariables { stack, register });
    }

    pub fn live_variables(&self, block: u64) -> Option<&LiveVariables> {
        self.live_variables.get(&block)
    }
}
