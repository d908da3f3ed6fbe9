//! Runtime stub appender.
//!
//! Emitted after the last user function so the stubs take the highest text
//! offsets. Each stub registers its entry in the call table; `libOffset`
//! and `libSize` bracket the whole range. Stub-internal loops go through a
//! local reference table with synthetic labels, resolved per stub.
//!
//! Value-returning stubs leave the result bit pattern in rax as well as
//! xmm0, matching the generated code's return convention.

use crate::encode::{self, Cond, JCC_LEN, JMP_LEN};
use crate::error::BackendError;
use crate::image::{Area, Flashing, X86Image};
use crate::refs::{RefTable, ResolvePolicy};
use crate::reg::{Gpr, Xmm};

/// Byte size of the static buffers `printDouble` and `scanDouble` use.
const BUF_SIZE: usize = 32;

/// Offset inside the output buffer where fraction digits begin; integer
/// digits grow right-to-left below it.
const INT_END: i32 = 20;

pub fn append(
    image: &mut X86Image,
    calls: &mut RefTable,
    flashing: &mut Flashing,
) -> Result<(), BackendError> {
    flashing.lib_offset = image.text.len();

    // Placeholders: return 0.0. A caller may interpose real bodies.
    for name in ["sin", "cos", "tan", "pow"] {
        calls.add_label(name, image.text.len());
        encode::xor_rr(&mut image.text, Gpr::Rax, Gpr::Rax);
        encode::ret(&mut image.text);
    }

    calls.add_label("sqrt", image.text.len());
    encode::sqrtsd(&mut image.text, Xmm(0), Xmm(0));
    encode::vmovq_gpr_xmm(&mut image.text, Gpr::Rax, Xmm(0));
    encode::ret(&mut image.text);

    calls.add_label("printString", image.text.len());
    emit_print_string(&mut image.text)?;

    // Static buffers live in the read-write data area, addressed off r15.
    let out_buf = image.data.len() as i32;
    image.data.write(&[0u8; BUF_SIZE]);
    let in_buf = image.data.len() as i32;
    image.data.write(&[0u8; BUF_SIZE]);

    calls.add_label("printDouble", image.text.len());
    emit_print_double(&mut image.text, out_buf)?;

    calls.add_label("scanDouble", image.text.len());
    emit_scan_double(&mut image.text, in_buf)?;

    flashing.lib_size = image.text.len() - flashing.lib_offset;
    Ok(())
}

/// Labels local to a single stub body.
struct StubLabels {
    refs: RefTable,
}

impl StubLabels {
    fn new() -> Self {
        Self {
            refs: RefTable::new(),
        }
    }

    fn here(&mut self, text: &Area, name: &str) {
        self.refs.add_label(name, text.len());
    }

    fn jmp(&mut self, text: &mut Area, name: &str) {
        let pos = text.len();
        let patch = encode::jmp(text);
        self.refs.add_reference(pos, patch, -JMP_LEN, name);
    }

    fn jcc(&mut self, text: &mut Area, cc: Cond, name: &str) {
        let pos = text.len();
        let patch = encode::jcc(text, cc);
        self.refs.add_reference(pos, patch, -JCC_LEN, name);
    }

    fn finish(self, text: &mut Area) -> Result<(), BackendError> {
        self.refs.resolve(text, ResolvePolicy::Strict)
    }
}

/// `printString`: NUL-terminated string pointer in xmm0, written to stdout
/// with `write(1, ptr, strlen(ptr))`.
fn emit_print_string(text: &mut Area) -> Result<(), BackendError> {
    let mut l = StubLabels::new();

    encode::vmovq_gpr_xmm(text, Gpr::Rsi, Xmm(0));
    encode::xor_rr(text, Gpr::Rdx, Gpr::Rdx);
    encode::mov_rr(text, Gpr::Rcx, Gpr::Rsi);
    l.here(text, "strlen");
    encode::movzx_r_byte(text, Gpr::Rax, Gpr::Rcx, 0);
    encode::test_rr(text, Gpr::Rax, Gpr::Rax);
    l.jcc(text, Cond::Z, "write");
    encode::inc_r(text, Gpr::Rcx);
    encode::inc_r(text, Gpr::Rdx);
    l.jmp(text, "strlen");
    l.here(text, "write");
    encode::mov_ri32(text, Gpr::Rax, 1);
    encode::mov_ri32(text, Gpr::Rdi, 1);
    encode::syscall(text);
    encode::ret(text);

    l.finish(text)
}

/// `printDouble`: render the double in xmm0 as decimal ASCII into the
/// static buffer at `[r15+buf]` and write it to stdout. Integer digits
/// always; a dot and six fraction digits only when the fraction is nonzero.
fn emit_print_double(text: &mut Area, buf: i32) -> Result<(), BackendError> {
    let mut l = StubLabels::new();

    encode::lea(text, Gpr::Rdi, Gpr::R15, buf);

    // Split off the sign: r8 = 1 for negative, xmm0 = |x|.
    encode::vmovq_gpr_xmm(text, Gpr::Rax, Xmm(0));
    encode::xor_rr(text, Gpr::R8, Gpr::R8);
    encode::test_rr(text, Gpr::Rax, Gpr::Rax);
    l.jcc(text, Cond::Ns, "abs");
    encode::inc_r(text, Gpr::R8);
    encode::movabs(text, Gpr::R14, 0x8000_0000_0000_0000);
    encode::xor_rr(text, Gpr::Rax, Gpr::R14);
    l.here(text, "abs");
    encode::vmovq_xmm_gpr(text, Xmm(0), Gpr::Rax);

    // rax = integer part, xmm2 = fraction.
    encode::cvttsd2si(text, Gpr::Rax, Xmm(0));
    encode::cvtsi2sd(text, Xmm(1), Gpr::Rax);
    encode::vsubsd(text, Xmm(2), Xmm(0), Xmm(1));

    // Integer digits, right to left, ending just below the fraction region.
    encode::lea(text, Gpr::Rsi, Gpr::Rdi, INT_END);
    encode::mov_ri32(text, Gpr::Rcx, 10);
    l.here(text, "int_digit");
    encode::xor_rr(text, Gpr::Rdx, Gpr::Rdx);
    encode::div_r(text, Gpr::Rcx);
    encode::add_ri(text, Gpr::Rdx, 0x30);
    encode::dec_r(text, Gpr::Rsi);
    encode::mov_mem_byte(text, Gpr::Rsi, 0, Gpr::Rdx);
    encode::test_rr(text, Gpr::Rax, Gpr::Rax);
    l.jcc(text, Cond::Nz, "int_digit");

    encode::test_rr(text, Gpr::R8, Gpr::R8);
    l.jcc(text, Cond::Z, "no_sign");
    encode::mov_ri32(text, Gpr::Rdx, u32::from(b'-'));
    encode::dec_r(text, Gpr::Rsi);
    encode::mov_mem_byte(text, Gpr::Rsi, 0, Gpr::Rdx);
    l.here(text, "no_sign");

    // Fraction digits, only when the fraction is nonzero.
    encode::lea(text, Gpr::Rcx, Gpr::Rdi, INT_END);
    encode::vmovq_gpr_xmm(text, Gpr::Rax, Xmm(2));
    encode::test_rr(text, Gpr::Rax, Gpr::Rax);
    l.jcc(text, Cond::Z, "flush");
    encode::mov_ri32(text, Gpr::Rdx, u32::from(b'.'));
    encode::mov_mem_byte(text, Gpr::Rcx, 0, Gpr::Rdx);
    encode::inc_r(text, Gpr::Rcx);
    encode::movabs(text, Gpr::R14, 10.0f64.to_bits());
    encode::vmovq_xmm_gpr(text, Xmm(3), Gpr::R14);
    encode::mov_ri32(text, Gpr::R9, 6);
    l.here(text, "frac_digit");
    encode::vmulsd(text, Xmm(2), Xmm(2), Xmm(3));
    encode::cvttsd2si(text, Gpr::Rax, Xmm(2));
    encode::cvtsi2sd(text, Xmm(1), Gpr::Rax);
    encode::vsubsd(text, Xmm(2), Xmm(2), Xmm(1));
    encode::add_ri(text, Gpr::Rax, 0x30);
    encode::mov_mem_byte(text, Gpr::Rcx, 0, Gpr::Rax);
    encode::inc_r(text, Gpr::Rcx);
    encode::dec_r(text, Gpr::R9);
    l.jcc(text, Cond::Nz, "frac_digit");

    // write(1, rsi, rcx - rsi)
    l.here(text, "flush");
    encode::mov_rr(text, Gpr::Rdx, Gpr::Rcx);
    encode::sub_rr(text, Gpr::Rdx, Gpr::Rsi);
    encode::mov_ri32(text, Gpr::Rax, 1);
    encode::mov_ri32(text, Gpr::Rdi, 1);
    encode::syscall(text);
    encode::ret(text);

    l.finish(text)
}

/// `scanDouble`: read one line from stdin into the static buffer at
/// `[r15+buf]`, parse an optional minus sign, integer digits, and fraction
/// digits, and return the value in xmm0 (and its bit pattern in rax).
fn emit_scan_double(text: &mut Area, buf: i32) -> Result<(), BackendError> {
    let mut l = StubLabels::new();

    // read(0, buf, BUF_SIZE - 1)
    encode::lea(text, Gpr::Rsi, Gpr::R15, buf);
    encode::xor_rr(text, Gpr::Rax, Gpr::Rax);
    encode::xor_rr(text, Gpr::Rdi, Gpr::Rdi);
    encode::mov_ri32(text, Gpr::Rdx, (BUF_SIZE - 1) as u32);
    encode::syscall(text);

    // r8 = sign flag.
    encode::xor_rr(text, Gpr::R8, Gpr::R8);
    encode::movzx_r_byte(text, Gpr::Rax, Gpr::Rsi, 0);
    encode::cmp_ri(text, Gpr::Rax, i32::from(b'-'));
    l.jcc(text, Cond::Nz, "int_part");
    encode::inc_r(text, Gpr::R8);
    encode::inc_r(text, Gpr::Rsi);
    l.here(text, "int_part");

    // Integer digits into rax.
    encode::xor_rr(text, Gpr::Rax, Gpr::Rax);
    encode::mov_ri32(text, Gpr::R10, 10);
    l.here(text, "int_loop");
    encode::movzx_r_byte(text, Gpr::Rdx, Gpr::Rsi, 0);
    encode::sub_ri(text, Gpr::Rdx, 0x30);
    encode::cmp_ri(text, Gpr::Rdx, 9);
    l.jcc(text, Cond::A, "int_done");
    encode::imul_rr(text, Gpr::Rax, Gpr::R10);
    encode::add_rr(text, Gpr::Rax, Gpr::Rdx);
    encode::inc_r(text, Gpr::Rsi);
    l.jmp(text, "int_loop");
    l.here(text, "int_done");
    encode::cvtsi2sd(text, Xmm(0), Gpr::Rax);

    // Fraction: digits into rax, scale into r9.
    encode::movzx_r_byte(text, Gpr::Rdx, Gpr::Rsi, 0);
    encode::cmp_ri(text, Gpr::Rdx, i32::from(b'.'));
    l.jcc(text, Cond::Nz, "sign");
    encode::inc_r(text, Gpr::Rsi);
    encode::xor_rr(text, Gpr::Rax, Gpr::Rax);
    encode::mov_ri32(text, Gpr::R9, 1);
    l.here(text, "frac_loop");
    encode::movzx_r_byte(text, Gpr::Rdx, Gpr::Rsi, 0);
    encode::sub_ri(text, Gpr::Rdx, 0x30);
    encode::cmp_ri(text, Gpr::Rdx, 9);
    l.jcc(text, Cond::A, "frac_done");
    encode::imul_rr(text, Gpr::Rax, Gpr::R10);
    encode::add_rr(text, Gpr::Rax, Gpr::Rdx);
    encode::imul_rr(text, Gpr::R9, Gpr::R10);
    encode::inc_r(text, Gpr::Rsi);
    l.jmp(text, "frac_loop");
    l.here(text, "frac_done");
    encode::cvtsi2sd(text, Xmm(1), Gpr::Rax);
    encode::cvtsi2sd(text, Xmm(2), Gpr::R9);
    encode::vdivsd(text, Xmm(1), Xmm(1), Xmm(2));
    encode::vaddsd(text, Xmm(0), Xmm(0), Xmm(1));

    l.here(text, "sign");
    encode::test_rr(text, Gpr::R8, Gpr::R8);
    l.jcc(text, Cond::Z, "done");
    encode::vmovq_gpr_xmm(text, Gpr::Rax, Xmm(0));
    encode::movabs(text, Gpr::R14, 0x8000_0000_0000_0000);
    encode::xor_rr(text, Gpr::Rax, Gpr::R14);
    encode::vmovq_xmm_gpr(text, Xmm(0), Gpr::Rax);
    l.here(text, "done");
    encode::vmovq_gpr_xmm(text, Gpr::Rax, Xmm(0));
    encode::ret(text);

    l.finish(text)
}
