//! x86-64 register definitions.

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// Hardware encoding (3-bit register number in ModR/M).
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register requires a REX extension bit (R8-R15).
    pub fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }

    pub fn from_index(i: u8) -> Gpr {
        const ALL: [Gpr; 16] = [
            Gpr::Rax,
            Gpr::Rcx,
            Gpr::Rdx,
            Gpr::Rbx,
            Gpr::Rsp,
            Gpr::Rbp,
            Gpr::Rsi,
            Gpr::Rdi,
            Gpr::R8,
            Gpr::R9,
            Gpr::R10,
            Gpr::R11,
            Gpr::R12,
            Gpr::R13,
            Gpr::R14,
            Gpr::R15,
        ];
        ALL[i as usize]
    }
}

/// An SSE register, xmm0 through xmm15.
///
/// xmm0-xmm14 are allocatable to block-local values; xmm15 is reserved as
/// the spill-reload scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

/// The reserved scratch register.
pub const XMM_SCRATCH: Xmm = Xmm(15);

/// Highest register index handed to block-local values.
pub const LAST_ALLOCATABLE_XMM: u8 = 14;

impl Xmm {
    /// Hardware encoding (3-bit register number in ModR/M).
    pub fn encoding(self) -> u8 {
        self.0 & 0x7
    }

    /// Whether this register requires a VEX/REX extension bit (xmm8-xmm15).
    pub fn needs_rex(self) -> bool {
        self.0 >= 8
    }
}
