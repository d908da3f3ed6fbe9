//! x86-64 machine code encoding.
//!
//! Scalar double-precision arithmetic uses the VEX forms; everything else
//! is classic REX-prefixed encoding. Helpers append directly to an
//! [`Area`]; jump and call emitters return the offset of their rel32
//! displacement so the caller can register a reference for later patching.

use crate::image::Area;
use crate::reg::{Gpr, Xmm};

/// VEX `pp` field values (implied legacy prefix).
const PP_66: u8 = 0b01;
const PP_F3: u8 = 0b10;
const PP_F2: u8 = 0b11;

/// Condition codes for `jcc rel32` (`0F 80+cc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// ZF set.
    Z = 0x4,
    /// ZF clear.
    Nz = 0x5,
    /// CF clear and ZF clear: unsigned above.
    A = 0x7,
    /// SF set.
    S = 0x8,
    /// SF clear.
    Ns = 0x9,
}

impl Cond {
    pub fn encoding(self) -> u8 {
        self as u8
    }
}

/// ModR/M byte with mod=11 (register-direct).
fn modrm(reg: u8, rm: u8) -> u8 {
    0b11_000_000 | (reg << 3) | rm
}

/// ModR/M (and SIB/displacement) for `[base+disp]` addressing.
/// Special-cases RSP/R12 (SIB byte) and RBP/R13 (always a displacement).
fn modrm_mem(reg: u8, base: Gpr, disp: i32, buf: &mut Area) {
    let needs_sib = base == Gpr::Rsp || base == Gpr::R12;
    if disp == 0 && base.encoding() != 5 {
        buf.push((reg << 3) | base.encoding());
        if needs_sib {
            buf.push(0x24);
        }
    } else if (-128..=127).contains(&disp) {
        buf.push(0x40 | (reg << 3) | base.encoding());
        if needs_sib {
            buf.push(0x24);
        }
        buf.push(disp as u8);
    } else {
        buf.push(0x80 | (reg << 3) | base.encoding());
        if needs_sib {
            buf.push(0x24);
        }
        buf.write(&disp.to_le_bytes());
    }
}

/// REX prefix for a reg/rm pair. Returns None when no prefix is needed.
fn rex(w: bool, reg_ext: bool, rm_ext: bool) -> Option<u8> {
    let bits = (u8::from(w) << 3) | (u8::from(reg_ext) << 2) | u8::from(rm_ext);
    if bits != 0 { Some(0x40 | bits) } else { None }
}

/// Emit a VEX prefix. The two-byte C5 form is legal only when X, B, and W
/// are all default; otherwise the three-byte C4 form (map 0F) is emitted.
fn vex(buf: &mut Area, r_ext: bool, b_ext: bool, w: bool, vvvv: u8, pp: u8) {
    if !b_ext && !w {
        // C5: [R̄ v̄v̄v̄v̄ L pp]
        buf.push(0xC5);
        buf.push((u8::from(!r_ext) << 7) | ((!vvvv & 0xF) << 3) | pp);
    } else {
        // C4: [R̄ X̄ B̄ mmmmm] [W v̄v̄v̄v̄ L pp], map 0F.
        buf.push(0xC4);
        buf.push((u8::from(!r_ext) << 7) | 0x40 | (u8::from(!b_ext) << 5) | 0x01);
        buf.push((u8::from(w) << 7) | ((!vvvv & 0xF) << 3) | pp);
    }
}

/// Three-operand VEX scalar op: `op dst, vvvv, rm`.
fn vex_rvm(buf: &mut Area, pp: u8, opcode: u8, dst: Xmm, vvvv: u8, rm: Xmm) {
    vex(buf, dst.needs_rex(), rm.needs_rex(), false, vvvv, pp);
    buf.push(opcode);
    buf.push(modrm(dst.encoding(), rm.encoding()));
}

pub fn vaddsd(buf: &mut Area, dst: Xmm, lhs: Xmm, rhs: Xmm) {
    vex_rvm(buf, PP_F2, 0x58, dst, lhs.0, rhs);
}

pub fn vsubsd(buf: &mut Area, dst: Xmm, lhs: Xmm, rhs: Xmm) {
    vex_rvm(buf, PP_F2, 0x5C, dst, lhs.0, rhs);
}

pub fn vmulsd(buf: &mut Area, dst: Xmm, lhs: Xmm, rhs: Xmm) {
    vex_rvm(buf, PP_F2, 0x59, dst, lhs.0, rhs);
}

pub fn vdivsd(buf: &mut Area, dst: Xmm, lhs: Xmm, rhs: Xmm) {
    vex_rvm(buf, PP_F2, 0x5E, dst, lhs.0, rhs);
}

pub fn vandpd(buf: &mut Area, dst: Xmm, lhs: Xmm, rhs: Xmm) {
    vex_rvm(buf, PP_66, 0x54, dst, lhs.0, rhs);
}

pub fn vorpd(buf: &mut Area, dst: Xmm, lhs: Xmm, rhs: Xmm) {
    vex_rvm(buf, PP_66, 0x56, dst, lhs.0, rhs);
}

/// `vcmpsd dst, lhs, rhs, pred`: result is an all-ones/all-zeros mask in
/// the low 64 bits of `dst`.
pub fn vcmpsd(buf: &mut Area, dst: Xmm, lhs: Xmm, rhs: Xmm, pred: u8) {
    vex_rvm(buf, PP_F2, 0xC2, dst, lhs.0, rhs);
    buf.push(pred);
}

/// `vmovq dst, src` between xmm registers (VEX.F3.0F 7E).
pub fn vmovq_xmm_xmm(buf: &mut Area, dst: Xmm, src: Xmm) {
    vex_rvm(buf, PP_F3, 0x7E, dst, 0, src);
}

/// `vmovq xmm, r64` (VEX.66.0F.W1 6E).
pub fn vmovq_xmm_gpr(buf: &mut Area, dst: Xmm, src: Gpr) {
    vex(buf, dst.needs_rex(), src.needs_rex(), true, 0, PP_66);
    buf.push(0x6E);
    buf.push(modrm(dst.encoding(), src.encoding()));
}

/// `vmovq r64, xmm` (VEX.66.0F.W1 7E).
pub fn vmovq_gpr_xmm(buf: &mut Area, dst: Gpr, src: Xmm) {
    vex(buf, src.needs_rex(), dst.needs_rex(), true, 0, PP_66);
    buf.push(0x7E);
    buf.push(modrm(src.encoding(), dst.encoding()));
}

/// Legacy-SSE `sqrtsd dst, src` (F2 0F 51).
pub fn sqrtsd(buf: &mut Area, dst: Xmm, src: Xmm) {
    buf.push(0xF2);
    if let Some(r) = rex(false, dst.needs_rex(), src.needs_rex()) {
        buf.push(r);
    }
    buf.push(0x0F);
    buf.push(0x51);
    buf.push(modrm(dst.encoding(), src.encoding()));
}

/// `cvttsd2si r64, xmm`: truncating double to signed quadword.
pub fn cvttsd2si(buf: &mut Area, dst: Gpr, src: Xmm) {
    buf.push(0xF2);
    buf.push(0x48 | (u8::from(dst.needs_rex()) << 2) | u8::from(src.needs_rex()));
    buf.push(0x0F);
    buf.push(0x2C);
    buf.push(modrm(dst.encoding(), src.encoding()));
}

/// `cvtsi2sd xmm, r64`.
pub fn cvtsi2sd(buf: &mut Area, dst: Xmm, src: Gpr) {
    buf.push(0xF2);
    buf.push(0x48 | (u8::from(dst.needs_rex()) << 2) | u8::from(src.needs_rex()));
    buf.push(0x0F);
    buf.push(0x2A);
    buf.push(modrm(dst.encoding(), src.encoding()));
}

// ── classic integer encodings ──

fn alu_rr(buf: &mut Area, opcode: u8, dst: Gpr, src: Gpr) {
    if let Some(r) = rex(true, src.needs_rex(), dst.needs_rex()) {
        buf.push(r);
    }
    buf.push(opcode);
    buf.push(modrm(src.encoding(), dst.encoding()));
}

/// `mov dst, src` (64-bit).
pub fn mov_rr(buf: &mut Area, dst: Gpr, src: Gpr) {
    alu_rr(buf, 0x89, dst, src);
}

pub fn add_rr(buf: &mut Area, dst: Gpr, src: Gpr) {
    alu_rr(buf, 0x01, dst, src);
}

pub fn sub_rr(buf: &mut Area, dst: Gpr, src: Gpr) {
    alu_rr(buf, 0x29, dst, src);
}

pub fn xor_rr(buf: &mut Area, dst: Gpr, src: Gpr) {
    alu_rr(buf, 0x31, dst, src);
}

/// `test dst, src` (64-bit); `test rax, rax` materializes branch conditions.
pub fn test_rr(buf: &mut Area, dst: Gpr, src: Gpr) {
    alu_rr(buf, 0x85, dst, src);
}

/// `imul dst, src` (64-bit).
pub fn imul_rr(buf: &mut Area, dst: Gpr, src: Gpr) {
    if let Some(r) = rex(true, dst.needs_rex(), src.needs_rex()) {
        buf.push(r);
    }
    buf.push(0x0F);
    buf.push(0xAF);
    buf.push(modrm(dst.encoding(), src.encoding()));
}

/// Group-1 immediate ops (`81 /n imm32`, 64-bit).
fn alu_ri(buf: &mut Area, ext: u8, dst: Gpr, imm: i32) {
    buf.push(0x48 | u8::from(dst.needs_rex()));
    buf.push(0x81);
    buf.push(modrm(ext, dst.encoding()));
    buf.write(&imm.to_le_bytes());
}

pub fn add_ri(buf: &mut Area, dst: Gpr, imm: i32) {
    alu_ri(buf, 0, dst, imm);
}

pub fn sub_ri(buf: &mut Area, dst: Gpr, imm: i32) {
    alu_ri(buf, 5, dst, imm);
}

pub fn cmp_ri(buf: &mut Area, dst: Gpr, imm: i32) {
    alu_ri(buf, 7, dst, imm);
}

/// `div src`: unsigned divide of rdx:rax, quotient in rax, remainder in rdx.
pub fn div_r(buf: &mut Area, src: Gpr) {
    buf.push(0x48 | u8::from(src.needs_rex()));
    buf.push(0xF7);
    buf.push(modrm(6, src.encoding()));
}

pub fn inc_r(buf: &mut Area, dst: Gpr) {
    buf.push(0x48 | u8::from(dst.needs_rex()));
    buf.push(0xFF);
    buf.push(modrm(0, dst.encoding()));
}

pub fn dec_r(buf: &mut Area, dst: Gpr) {
    buf.push(0x48 | u8::from(dst.needs_rex()));
    buf.push(0xFF);
    buf.push(modrm(1, dst.encoding()));
}

/// `mov dst, [base+disp]` (64-bit load).
pub fn mov_r_mem(buf: &mut Area, dst: Gpr, base: Gpr, disp: i32) {
    if let Some(r) = rex(true, dst.needs_rex(), base.needs_rex()) {
        buf.push(r);
    }
    buf.push(0x8B);
    modrm_mem(dst.encoding(), base, disp, buf);
}

/// `mov [base+disp], src` (64-bit store).
pub fn mov_mem_r(buf: &mut Area, base: Gpr, disp: i32, src: Gpr) {
    if let Some(r) = rex(true, src.needs_rex(), base.needs_rex()) {
        buf.push(r);
    }
    buf.push(0x89);
    modrm_mem(src.encoding(), base, disp, buf);
}

/// `movzx dst, byte [base+disp]`.
pub fn movzx_r_byte(buf: &mut Area, dst: Gpr, base: Gpr, disp: i32) {
    buf.push(0x48 | (u8::from(dst.needs_rex()) << 2) | u8::from(base.needs_rex()));
    buf.push(0x0F);
    buf.push(0xB6);
    modrm_mem(dst.encoding(), base, disp, buf);
}

/// `mov byte [base+disp], src`: stores the low byte of `src`.
pub fn mov_mem_byte(buf: &mut Area, base: Gpr, disp: i32, src: Gpr) {
    // REX is required for the sil/dil/spl/bpl byte registers.
    let bits = (u8::from(src.needs_rex()) << 2) | u8::from(base.needs_rex());
    if bits != 0 || matches!(src, Gpr::Rsp | Gpr::Rbp | Gpr::Rsi | Gpr::Rdi) {
        buf.push(0x40 | bits);
    }
    buf.push(0x88);
    modrm_mem(src.encoding(), base, disp, buf);
}

/// `lea dst, [base+disp]` (64-bit).
pub fn lea(buf: &mut Area, dst: Gpr, base: Gpr, disp: i32) {
    buf.push(0x48 | (u8::from(dst.needs_rex()) << 2) | u8::from(base.needs_rex()));
    buf.push(0x8D);
    modrm_mem(dst.encoding(), base, disp, buf);
}

/// `mov r64, imm64` (movabs). The imm64 operand starts two bytes after the
/// instruction start; the flashing patch sites are recorded from that fact.
pub fn movabs(buf: &mut Area, dst: Gpr, imm: u64) {
    buf.push(0x48 | u8::from(dst.needs_rex()));
    buf.push(0xB8 + dst.encoding());
    buf.write(&imm.to_le_bytes());
}

/// `mov r32, imm32`: zero-extends into the full register.
pub fn mov_ri32(buf: &mut Area, dst: Gpr, imm: u32) {
    if dst.needs_rex() {
        buf.push(0x41);
    }
    buf.push(0xB8 + dst.encoding());
    buf.write(&imm.to_le_bytes());
}

pub fn push_r(buf: &mut Area, reg: Gpr) {
    if reg.needs_rex() {
        buf.push(0x41);
    }
    buf.push(0x50 + reg.encoding());
}

pub fn pop_r(buf: &mut Area, reg: Gpr) {
    if reg.needs_rex() {
        buf.push(0x41);
    }
    buf.push(0x58 + reg.encoding());
}

/// `jmp rel32` with a zero placeholder. Returns the displacement offset.
pub fn jmp(buf: &mut Area) -> usize {
    buf.push(0xE9);
    let at = buf.len();
    buf.write(&[0; 4]);
    at
}

/// `jcc rel32` with a zero placeholder. Returns the displacement offset.
pub fn jcc(buf: &mut Area, cc: Cond) -> usize {
    buf.push(0x0F);
    buf.push(0x80 + cc.encoding());
    let at = buf.len();
    buf.write(&[0; 4]);
    at
}

/// `call rel32` with a zero placeholder. Returns the displacement offset.
pub fn call(buf: &mut Area) -> usize {
    buf.push(0xE8);
    let at = buf.len();
    buf.write(&[0; 4]);
    at
}

pub fn ret(buf: &mut Area) {
    buf.push(0xC3);
}

pub fn syscall(buf: &mut Area) {
    buf.push(0x0F);
    buf.push(0x05);
}

/// `xor edi, edi`: the exit status zero of the `main` epilogue.
pub fn xor_edi_edi(buf: &mut Area) {
    buf.push(0x31);
    buf.push(0xFF);
}

/// Byte length of a `jmp rel32`.
pub const JMP_LEN: i64 = 5;
/// Byte length of a `jcc rel32`.
pub const JCC_LEN: i64 = 6;
/// Byte length of a `call rel32`.
pub const CALL_LEN: i64 = 5;
