//! Recovered variables: identity-bearing stack slots and registers.

/// The storage space a variable lives in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum VariableKind {
    Stack,
    Register,
}

/// The identity of a variable. Sequential per kind, minted by the
/// [`VariableCatalog`](crate::catalog::VariableCatalog) of the enclosing function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableIdent {
    pub kind: VariableKind,
    pub idx: usize,
}

impl std::fmt::Debug for VariableIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.kind {
            VariableKind::Stack => write!(f, "is_{}", self.idx),
            VariableKind::Register => write!(f, "ir_{}", self.idx),
        }
    }
}
impl std::fmt::Display for VariableIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A special purpose a variable is known to serve.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum VariableRole {
    /// The return address pushed by the caller's `call`
    ReturnAddress,
}

/// A recovered variable.
///
/// Ordering (and hence iteration order inside a
/// [`LocationStore`](crate::location_store::LocationStore)) is by identity first, so the earliest
/// minted variable comes first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable {
    pub ident: VariableIdent,
    /// Offset relative to the frame base (stack), or into the register file (register)
    pub offset: i64,
    /// Size in bytes
    pub size: usize,
    /// Address of the function the variable belongs to
    pub region: u64,
    pub role: Option<VariableRole>,
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.ident.kind {
            VariableKind::Stack => write!(
                f,
                "{:?}{{stack {}, sz={}}}",
                self.ident,
                crate::value::signed_hex(self.offset),
                self.size
            )?,
            VariableKind::Register => write!(
                f,
                "{:?}{{reg {}, sz={}}}",
                self.ident, self.offset, self.size
            )?,
        }
        if let Some(role) = self.role {
            write!(f, "[{:?}]", role)?;
        }
        Ok(())
    }
}

impl Variable {
    pub fn kind(&self) -> VariableKind {
        self.ident.kind
    }

    /// Whether `offset` lies within the variable's span when it is registered at `base`
    pub fn covers(&self, base: i64, offset: i64) -> bool {
        base <= offset && offset < base.saturating_add(self.size as i64)
    }
}
