//! Read-only architecture facts consulted by the recovery engine.

/// A named slice of the register file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterInfo {
    pub name: &'static str,
    /// Offset into the register file
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
}

const fn reg(name: &'static str, offset: usize, size: usize) -> RegisterInfo {
    RegisterInfo { name, offset, size }
}

/// Description of an architecture. Register offsets follow the lifter's register-file layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arch {
    pub name: &'static str,
    /// Width of a machine word, in bits
    pub bits: usize,
    /// Offset of the stack pointer in the register file
    pub sp_offset: usize,
    /// Offset of the frame-base register in the register file
    pub bp_offset: usize,
    /// Whether a call pushes the return address onto the stack (x86-style) rather than keeping
    /// it in a link register.
    pub call_pushes_ret: bool,
    registers: &'static [RegisterInfo],
}

static AMD64_REGISTERS: &[RegisterInfo] = &[
    reg("rax", 16, 8),
    reg("rcx", 24, 8),
    reg("rdx", 32, 8),
    reg("rbx", 40, 8),
    reg("rsp", 48, 8),
    reg("rbp", 56, 8),
    reg("rsi", 64, 8),
    reg("rdi", 72, 8),
    reg("r8", 80, 8),
    reg("r9", 88, 8),
    reg("r10", 96, 8),
    reg("r11", 104, 8),
    reg("r12", 112, 8),
    reg("r13", 120, 8),
    reg("r14", 128, 8),
    reg("r15", 136, 8),
    reg("rip", 184, 8),
    reg("eax", 16, 4),
    reg("ecx", 24, 4),
    reg("edx", 32, 4),
    reg("ebx", 40, 4),
    reg("esi", 64, 4),
    reg("edi", 72, 4),
];

static X86_REGISTERS: &[RegisterInfo] = &[
    reg("eax", 8, 4),
    reg("ecx", 12, 4),
    reg("edx", 16, 4),
    reg("ebx", 20, 4),
    reg("esp", 24, 4),
    reg("ebp", 28, 4),
    reg("esi", 32, 4),
    reg("edi", 36, 4),
    reg("eip", 68, 4),
];

static AARCH64_REGISTERS: &[RegisterInfo] = &[
    reg("x0", 16, 8),
    reg("x1", 24, 8),
    reg("x2", 32, 8),
    reg("x3", 40, 8),
    reg("x4", 48, 8),
    reg("x5", 56, 8),
    reg("x6", 64, 8),
    reg("x7", 72, 8),
    reg("x8", 80, 8),
    reg("x19", 168, 8),
    reg("x20", 176, 8),
    reg("x29", 248, 8),
    reg("x30", 256, 8),
    reg("sp", 264, 8),
    reg("pc", 272, 8),
];

impl Arch {
    pub fn amd64() -> Self {
        Self {
            name: "AMD64",
            bits: 64,
            sp_offset: 48,
            bp_offset: 56,
            call_pushes_ret: true,
            registers: AMD64_REGISTERS,
        }
    }

    pub fn x86() -> Self {
        Self {
            name: "X86",
            bits: 32,
            sp_offset: 24,
            bp_offset: 28,
            call_pushes_ret: true,
            registers: X86_REGISTERS,
        }
    }

    pub fn aarch64() -> Self {
        Self {
            name: "AARCH64",
            bits: 64,
            sp_offset: 264,
            bp_offset: 248,
            call_pushes_ret: false,
            registers: AARCH64_REGISTERS,
        }
    }

    /// Look up an architecture by (case-insensitive) name
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" | "x64" => Some(Self::amd64()),
            "x86" | "i386" => Some(Self::x86()),
            "aarch64" | "arm64" => Some(Self::aarch64()),
            _ => None,
        }
    }

    /// Size of a machine word, in bytes
    pub fn bytes(&self) -> usize {
        self.bits / 8
    }

    pub fn register_by_name(&self, name: &str) -> Option<RegisterInfo> {
        self.registers.iter().find(|r| r.name == name).copied()
    }

    /// The name of the widest register starting at `offset`
    pub fn register_name(&self, offset: usize) -> Option<&'static str> {
        self.registers
            .iter()
            .filter(|r| r.offset == offset)
            .max_by_key(|r| r.size)
            .map(|r| r.name)
    }

    /// Interpret `n` as a two's complement integer of the architecture's width
    pub fn to_signed(&self, n: u64) -> i64 {
        crate::value::to_signed(n, self.bits)
    }
}
