//! Abstract values computed by the engine, including symbolic stack offsets.

/// Sign-interpret the low `bits` bits of `n`
pub fn to_signed(n: u64, bits: usize) -> i64 {
    if bits >= 64 {
        n as i64
    } else {
        let shift = 64 - bits;
        ((n << shift) as i64) >> shift
    }
}

/// Truncate `n` to its low `bits` bits
pub fn mask(n: u64, bits: usize) -> u64 {
    if bits >= 64 {
        n
    } else {
        n & ((1u64 << bits) - 1)
    }
}

/// `-0x20` / `+0x8`, rather than the two's complement `{:+#x}` gives for negative numbers
pub fn signed_hex(n: i64) -> String {
    if n < 0 {
        format!("-{:#x}", n.unsigned_abs())
    } else {
        format!("+{:#x}", n)
    }
}

/// An unknown value whose origin is still known.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Symbol {
    /// Whatever the register at `offset` held when it was read
    Register { offset: usize, size: usize },
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Symbol::Register { offset, size } => write!(f, "reg{}:{}", offset, size),
        }
    }
}

/// A non-constant offset expression.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OffsetExpr {
    Int(i64),
    Symbol(Symbol),
    Add(Box<OffsetExpr>, Box<OffsetExpr>),
    Sub(Box<OffsetExpr>, Box<OffsetExpr>),
}

impl std::fmt::Debug for OffsetExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            OffsetExpr::Int(n) => write!(f, "{:#x}", n),
            OffsetExpr::Symbol(s) => write!(f, "{}", s),
            OffsetExpr::Add(a, b) => write!(f, "({:?} + {:?})", a, b),
            OffsetExpr::Sub(a, b) => write!(f, "({:?} - {:?})", a, b),
        }
    }
}

impl OffsetExpr {
    pub fn add(a: OffsetExpr, b: OffsetExpr) -> Self {
        OffsetExpr::Add(Box::new(a), Box::new(b))
    }

    pub fn sub(a: OffsetExpr, b: OffsetExpr) -> Self {
        OffsetExpr::Sub(Box::new(a), Box::new(b))
    }

    /// Add a constant, keeping any constant in the canonical `Add(Int(c), rest)` position.
    fn add_int(self, n: i64) -> Self {
        match self {
            OffsetExpr::Int(c) => OffsetExpr::Int(c.wrapping_add(n)),
            OffsetExpr::Add(a, b) => match *a {
                OffsetExpr::Int(c) => OffsetExpr::add(OffsetExpr::Int(c.wrapping_add(n)), *b),
                a => OffsetExpr::add(OffsetExpr::Int(n), OffsetExpr::add(a, *b)),
            },
            e => OffsetExpr::add(OffsetExpr::Int(n), e),
        }
    }
}

/// An offset relative to the stack frame base.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StackOffset {
    Concrete(i64),
    Dynamic(OffsetExpr),
}

impl std::fmt::Debug for StackOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StackOffset::Concrete(n) => write!(f, "{}", signed_hex(*n)),
            StackOffset::Dynamic(e) => write!(f, "{:?}", e),
        }
    }
}

impl StackOffset {
    /// Split into the concrete base offset and the residual symbolic part. For `SP-0xe0+var`,
    /// this is `(Some(-0xe0), Some(var))`. When no constant part can be isolated, the concrete
    /// part is `None` and the whole expression is the residual.
    pub fn split(&self) -> (Option<i64>, Option<OffsetExpr>) {
        match self {
            StackOffset::Concrete(n) => (Some(*n), None),
            StackOffset::Dynamic(e) => match e {
                OffsetExpr::Int(n) => (Some(*n), None),
                OffsetExpr::Add(a, b) => match (&**a, &**b) {
                    (OffsetExpr::Int(c), d) | (d, OffsetExpr::Int(c)) => {
                        (Some(*c), Some(d.clone()))
                    }
                    _ => (None, Some(e.clone())),
                },
                OffsetExpr::Sub(a, b) => match &**b {
                    OffsetExpr::Int(c) => (Some(c.wrapping_neg()), Some((**a).clone())),
                    _ => (None, Some(e.clone())),
                },
                OffsetExpr::Symbol(_) => (None, Some(e.clone())),
            },
        }
    }

    pub fn concrete(&self) -> Option<i64> {
        match self {
            StackOffset::Concrete(n) => Some(*n),
            StackOffset::Dynamic(_) => None,
        }
    }

    fn into_expr(self) -> OffsetExpr {
        match self {
            StackOffset::Concrete(n) => OffsetExpr::Int(n),
            StackOffset::Dynamic(e) => e,
        }
    }

    fn add_int(self, n: i64) -> Self {
        match self {
            StackOffset::Concrete(c) => StackOffset::Concrete(c.wrapping_add(n)),
            StackOffset::Dynamic(e) => StackOffset::Dynamic(e.add_int(n)),
        }
    }
}

/// A pointer into the current stack frame.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpOffset {
    pub bits: usize,
    pub offset: StackOffset,
}

impl std::fmt::Debug for SpOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SP{:?}", self.offset)
    }
}

impl SpOffset {
    pub fn new(bits: usize, offset: i64) -> Self {
        Self {
            bits,
            offset: StackOffset::Concrete(offset),
        }
    }
}

/// The abstract value of an expression.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// A concrete integer, truncated to its width
    Int(u64),
    /// An offset into the stack frame
    Stack(SpOffset),
    /// An unknown value of known origin
    Symbol(Symbol),
    Unknown,
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{:#x}", n),
            Value::Stack(s) => write!(f, "{:?}", s),
            Value::Symbol(s) => write!(f, "{}", s),
            Value::Unknown => write!(f, "?"),
        }
    }
}

impl Value {
    pub fn as_stack_offset(&self) -> Option<&StackOffset> {
        match self {
            Value::Stack(SpOffset { offset, .. }) => Some(offset),
            _ => None,
        }
    }

    /// Wrapping addition over `bits`-wide values
    pub fn add(&self, other: &Value, bits: usize) -> Value {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Value::Int(mask(a.wrapping_add(*b), bits)),
            (Value::Stack(sp), Value::Int(n)) | (Value::Int(n), Value::Stack(sp)) => {
                Value::Stack(SpOffset {
                    bits: sp.bits,
                    offset: sp.offset.clone().add_int(to_signed(*n, bits)),
                })
            }
            (Value::Stack(sp), Value::Symbol(s)) | (Value::Symbol(s), Value::Stack(sp)) => {
                Value::Stack(SpOffset {
                    bits: sp.bits,
                    offset: StackOffset::Dynamic(OffsetExpr::add(
                        sp.offset.clone().into_expr(),
                        OffsetExpr::Symbol(*s),
                    )),
                })
            }
            _ => Value::Unknown,
        }
    }

    /// Wrapping subtraction over `bits`-wide values
    pub fn sub(&self, other: &Value, bits: usize) -> Value {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Value::Int(mask(a.wrapping_sub(*b), bits)),
            (Value::Stack(sp), Value::Int(n)) => Value::Stack(SpOffset {
                bits: sp.bits,
                offset: sp.offset.clone().add_int(to_signed(*n, bits).wrapping_neg()),
            }),
            (Value::Stack(sp), Value::Symbol(s)) => Value::Stack(SpOffset {
                bits: sp.bits,
                offset: StackOffset::Dynamic(OffsetExpr::sub(
                    sp.offset.clone().into_expr(),
                    OffsetExpr::Symbol(*s),
                )),
            }),
            (Value::Stack(a), Value::Stack(b)) => match (a.offset.concrete(), b.offset.concrete())
            {
                (Some(a), Some(b)) => Value::Int(mask(a.wrapping_sub(b) as u64, bits)),
                _ => Value::Unknown,
            },
            _ => Value::Unknown,
        }
    }

    /// Bitwise AND. Masking a stack pointer (frame alignment) keeps it a stack pointer.
    pub fn and(&self, other: &Value, bits: usize) -> Value {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Value::Int(mask(a & b, bits)),
            (Value::Stack(sp), Value::Int(_)) | (Value::Int(_), Value::Stack(sp)) => {
                Value::Stack(sp.clone())
            }
            _ => Value::Unknown,
        }
    }

    /// Any other binary integer operation that only folds on constants
    pub fn fold_ints(
        &self,
        other: &Value,
        bits: usize,
        f: impl FnOnce(u64, u64) -> Option<u64>,
    ) -> Value {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => match f(*a, *b) {
                Some(r) => Value::Int(mask(r, bits)),
                None => Value::Unknown,
            },
            _ => Value::Unknown,
        }
    }

    /// Resize a value to `bits`, keeping stack pointers intact
    pub fn resize(&self, from_bits: usize, to_bits: usize, signed: bool) -> Value {
        match self {
            Value::Int(n) => {
                let n = mask(*n, from_bits);
                if signed && to_bits > from_bits {
                    Value::Int(mask(to_signed(n, from_bits) as u64, to_bits))
                } else {
                    Value::Int(mask(n, to_bits))
                }
            }
            Value::Stack(_) | Value::Symbol(_) => self.clone(),
            Value::Unknown => Value::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rax() -> Symbol {
        Symbol::Register {
            offset: 16,
            size: 8,
        }
    }

    #[test]
    fn negative_offsets_print_with_a_sign() {
        assert_eq!(signed_hex(-0x20), "-0x20");
        assert_eq!(signed_hex(8), "+0x8");
        assert_eq!(format!("{:?}", StackOffset::Concrete(-0x20)), "-0x20");
    }

    #[test]
    fn stack_pointer_arithmetic() {
        let sp = Value::Stack(SpOffset::new(64, 8));
        let pushed = sp.sub(&Value::Int(8), 64);
        assert_eq!(pushed, Value::Stack(SpOffset::new(64, 0)));
        // Adding a negative constant, as a compiler emits for `sub rsp, 0x20`
        let down = pushed.add(&Value::Int(0xffff_ffff_ffff_ffe0), 64);
        assert_eq!(down, Value::Stack(SpOffset::new(64, -0x20)));
        // Frame alignment keeps the offset
        assert_eq!(down.and(&Value::Int(!0xf), 64), down);
    }

    #[test]
    fn dynamic_offsets_split_into_concrete_and_residual() {
        let bp = Value::Stack(SpOffset::new(64, 0));
        let addr = bp
            .sub(&Value::Int(0xe0), 64)
            .add(&Value::Symbol(rax()), 64);
        let offset = addr.as_stack_offset().unwrap();
        assert_eq!(
            offset.split(),
            (Some(-0xe0), Some(OffsetExpr::Symbol(rax())))
        );

        // Further constants fold into the concrete part
        let addr = addr.add(&Value::Int(8), 64);
        assert_eq!(
            addr.as_stack_offset().unwrap().split(),
            (Some(-0xd8), Some(OffsetExpr::Symbol(rax())))
        );

        let neg = Value::Stack(SpOffset::new(64, 0)).sub(&Value::Symbol(rax()), 64);
        assert_eq!(neg.as_stack_offset().unwrap().split().0, None);
    }

    #[test]
    fn integer_helpers() {
        assert_eq!(to_signed(0xff, 8), -1);
        assert_eq!(to_signed(0x7f, 8), 127);
        assert_eq!(mask(0x1ff, 8), 0xff);
        assert_eq!(
            Value::Int(0xff).resize(8, 32, true),
            Value::Int(0xffff_ffff)
        );
        assert_eq!(Value::Int(0xff).resize(8, 32, false), Value::Int(0xff));
    }
}
