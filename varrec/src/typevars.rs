//! Type variables, derived type terms, and the constraints relating them.
//!
//! Nothing here decides a type. Constraints are only accumulated, for a later solver.

use crate::block::CodeLocation;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::variable::VariableIdent;

/// An opaque handle for "the type of this value at this point". Minted (interned) by the
/// [`VariableCatalog`](crate::catalog::VariableCatalog).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeVariable(pub usize);

impl std::fmt::Debug for TypeVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "tv_{}", self.0)
    }
}
impl std::fmt::Display for TypeVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A capability through which a type term is derived from another.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Label {
    Load,
    Store,
    /// Pointer arithmetic by a constant number of bytes
    AddN(i64),
    /// A field of `bits` bits at byte `offset`
    HasField { bits: usize, offset: i64 },
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Label::Load => write!(f, "load"),
            Label::Store => write!(f, "store"),
            Label::AddN(n) => write!(f, "+{}", n),
            Label::HasField { bits, offset } => write!(f, "σ{}@{}", bits, offset),
        }
    }
}

/// A type variable, possibly derived through a chain of labels.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeTerm {
    Var(TypeVariable),
    Derived(Box<TypeTerm>, Label),
}

impl std::fmt::Debug for TypeTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TypeTerm::Var(tv) => write!(f, "{}", tv),
            TypeTerm::Derived(base, label) => write!(f, "{:?}.{}", base, label),
        }
    }
}
impl std::fmt::Display for TypeTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TypeVariable> for TypeTerm {
    fn from(tv: TypeVariable) -> Self {
        TypeTerm::Var(tv)
    }
}

impl TypeTerm {
    pub fn derive(self, label: Label) -> Self {
        TypeTerm::Derived(Box::new(self), label)
    }

    /// `self.load.σ{bits}@{offset}`
    pub fn loaded_field(self, bits: usize, offset: i64) -> Self {
        self.derive(Label::Load)
            .derive(Label::HasField { bits, offset })
    }

    /// `self.store.σ{bits}@{offset}`
    pub fn stored_field(self, bits: usize, offset: i64) -> Self {
        self.derive(Label::Store)
            .derive(Label::HasField { bits, offset })
    }

    /// The type variable at the root of the derivation chain
    pub fn base(&self) -> TypeVariable {
        match self {
            TypeTerm::Var(tv) => *tv,
            TypeTerm::Derived(b, _) => b.base(),
        }
    }

    /// If the outermost label is pointer arithmetic, peel it off, returning the underlying term
    /// and the byte offset.
    pub fn strip_addn(&self) -> (TypeTerm, i64) {
        match self {
            TypeTerm::Derived(b, Label::AddN(n)) => ((**b).clone(), *n),
            t => (t.clone(), 0),
        }
    }
}

/// A fact for the downstream solver.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeConstraint {
    /// `lhs <: rhs`
    Subtype(TypeTerm, TypeTerm),
    /// The derived term exists (e.g. the address was dereferenced with this width)
    Exists(TypeTerm),
}

impl std::fmt::Debug for TypeConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TypeConstraint::Subtype(a, b) => write!(f, "{:?} <: {:?}", a, b),
            TypeConstraint::Exists(t) => write!(f, "∃{:?}", t),
        }
    }
}
impl std::fmt::Display for TypeConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Grows monotonically; union only
pub type ConstraintSet = UnorderedSet<TypeConstraint>;

/// Which type variable a variable was given at each program point.
///
/// A variable carries at most one "current" type variable: the one it received at its first
/// assignment. Later reads reuse it.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct TypeVariableStore {
    assignments: UnorderedMap<(VariableIdent, CodeLocation), TypeVariable>,
    current: UnorderedMap<VariableIdent, TypeVariable>,
}

impl TypeVariableStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, var: VariableIdent, loc: CodeLocation, tv: TypeVariable) {
        self.assignments.insert((var, loc), tv);
        self.current.entry(var).or_insert(tv);
    }

    /// The type variable assigned to `var` at exactly `loc`
    pub fn get(&self, var: VariableIdent, loc: &CodeLocation) -> Option<TypeVariable> {
        self.assignments.get(&(var, *loc)).copied()
    }

    /// The type variable `var` currently carries
    pub fn current(&self, var: VariableIdent) -> Option<TypeVariable> {
        self.current.get(&var).copied()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Union of both stores. Where both sides assign something, `self` wins.
    pub fn merge(mut self, other: &TypeVariableStore) -> Self {
        for (k, tv) in other.assignments.iter() {
            self.assignments.entry(*k).or_insert(*tv);
        }
        for (k, tv) in other.current.iter() {
            self.current.entry(*k).or_insert(*tv);
        }
        self
    }
}
