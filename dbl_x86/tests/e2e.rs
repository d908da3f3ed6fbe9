//! End-to-end tests: AST text → IR → lowering → ELF → execute.

use std::fs;
use std::path::Path;

use dbl_front::ast::parse_ast;
use dbl_front::astgen;
use dbl_x86::elf::{write_executable, ENTRY0, HEADERS_SIZE};
use dbl_x86::image::X86Image;
use dbl_x86::{compile_module, ResolvePolicy};

fn compile_src(src: &str) -> X86Image {
    let ast = parse_ast(src).expect("parse");
    let module = astgen::build_module(&ast).expect("lower");
    compile_module(&module, ResolvePolicy::Strict).expect("compile")
}

fn write_elf(image: &mut X86Image, dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    write_executable(image, &path).expect("write elf");
    path
}

const HELLO: &str = "{FUNC {\"main\" {NIL} {VOID}} {OUT {ST {'hi\n'} {NIL}} {NIL}}}";

const ARITHMETIC: &str = "{FUNC {\"main\" {NIL} {VOID}} \
    {OUT {ST {ADD {2} {MUL {3} {4}}} {NIL}} {ST {ENDL} {NIL}}}}";

const LOOP_SUM: &str = "{FUNC {\"main\" {NIL} {VOID}} \
    {ST {VAR {\"i\"} {0}} \
    {ST {VAR {\"s\"} {0}} \
    {ST {WHILE {IS_BT {\"i\"} {10}} \
        {ST {EQ {\"s\"} {ADD {\"s\"} {\"i\"}}} {EQ {\"i\"} {ADD {\"i\"} {1}}}}} \
    {OUT {ST {\"s\"} {NIL}} {ST {ENDL} {NIL}}}}}}}";

const FACTORIAL: &str = "{ST \
    {FUNC {\"fact\" {PARAM {TYPE {\"n\"} {NIL}} {NIL}} {TYPE}} \
        {ST {IF {IS_BT {\"n\"} {2}} {RET {1}}} \
        {RET {MUL {\"n\"} {CALL {\"fact\" {PARAM {SUB {\"n\"} {1}} {NIL}} {NIL}} {NIL}}}}}} \
    {FUNC {\"main\" {NIL} {VOID}} \
        {OUT {ST {CALL {\"fact\" {PARAM {5} {NIL}} {NIL}} {NIL}} {NIL}} {ST {ENDL} {NIL}}}}}";

/// Deeply nested sum 1+2+…+18 forces more live names than registers.
fn spill_src() -> String {
    let mut expr = "{1}".to_string();
    for i in 2..=18 {
        expr = format!("{{ADD {expr} {{{i}}}}}");
    }
    format!(
        "{{FUNC {{\"main\" {{NIL}} {{VOID}}}} {{OUT {{ST {expr} {{NIL}}}} {{ST {{ENDL}} {{NIL}}}}}}}}"
    )
}

#[test]
fn elf_header_fields() {
    let mut image = compile_src(HELLO);
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_elf(&mut image, dir.path(), "hello");
    let bytes = fs::read(&path).expect("read elf");

    assert_eq!(&bytes[..4], b"\x7fELF");
    assert_eq!(bytes[4], 2, "ELFCLASS64");
    assert_eq!(bytes[5], 1, "little endian");
    assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), 2, "ET_EXEC");
    assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), 0x3E, "x86-64");

    let entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
    let main_offset = image.flashing.main_offset.unwrap() as u64;
    assert_eq!(entry, ENTRY0 + HEADERS_SIZE as u64 + main_offset);

    assert_eq!(u16::from_le_bytes([bytes[56], bytes[57]]), 3, "e_phnum");
    assert_eq!(u16::from_le_bytes([bytes[60], bytes[61]]), 0, "e_shnum");

    // Three PT_LOAD segments in text, rodata, data order.
    for i in 0..3 {
        let ph = 64 + 56 * i;
        assert_eq!(
            u32::from_le_bytes(bytes[ph..ph + 4].try_into().unwrap()),
            1,
            "PT_LOAD"
        );
    }
    let flags =
        |i: usize| u32::from_le_bytes(bytes[64 + 56 * i + 4..64 + 56 * i + 8].try_into().unwrap());
    assert_eq!(flags(0), 5, "text R|X");
    assert_eq!(flags(1), 4, "rodata R");
    assert_eq!(flags(2), 6, "data R|W");
}

#[test]
fn patched_addresses_match_segment_vaddrs() {
    let mut image = compile_src(HELLO);
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_elf(&mut image, dir.path(), "hello");
    let bytes = fs::read(&path).expect("read elf");

    let vaddr = |i: usize| {
        u64::from_le_bytes(bytes[64 + 56 * i + 16..64 + 56 * i + 24].try_into().unwrap())
    };
    let text_at = |off: usize| {
        let at = HEADERS_SIZE + off;
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    };
    assert_eq!(text_at(image.flashing.rodata_patch_site), vaddr(1));
    assert_eq!(text_at(image.flashing.data_patch_site), vaddr(2));

    // Segment congruence: the loader maps pages, so vaddr and offset must
    // agree modulo the page size.
    for i in 1..3 {
        let off = u64::from_le_bytes(bytes[64 + 56 * i + 8..64 + 56 * i + 16].try_into().unwrap());
        assert_eq!(vaddr(i) % 0x1000, off % 0x1000);
    }
}

#[test]
fn spill_code_stores_and_reloads_through_rbp() {
    let image = compile_src(&spill_src());
    let text = image.text.as_slice();
    let has = |needle: &[u8]| text.windows(needle.len()).any(|w| w == needle);
    // mov [rbp+disp8], r14 and mov r14, [rbp+disp8].
    assert!(has(&[0x4C, 0x89, 0x75]), "expected a spill store");
    assert!(has(&[0x4C, 0x8B, 0x75]), "expected a spill reload");
}

#[test]
fn aot_and_jit_lowering_produce_identical_images() {
    let ast = parse_ast(FACTORIAL).expect("parse");
    let module = astgen::build_module(&ast).expect("lower");
    let aot = compile_module(&module, ResolvePolicy::Strict).expect("compile");
    let jit = compile_module(&module, ResolvePolicy::ZeroMissing).expect("compile");
    assert_eq!(aot.text.as_slice(), jit.text.as_slice());
    assert_eq!(aot.rodata.as_slice(), jit.rodata.as_slice());
    assert_eq!(aot.data.as_slice(), jit.data.as_slice());
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod run {
    use super::*;
    use dbl_x86::jit::JitImage;
    use std::process::Command;

    fn run_elf(src: &str) -> String {
        let mut image = compile_src(src);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_elf(&mut image, dir.path(), "prog");
        let out = Command::new(&path).output().expect("run");
        assert!(
            out.status.success(),
            "exit {:?}, stderr: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    #[test]
    fn hello_world() {
        assert_eq!(run_elf(HELLO), "hi\n");
    }

    #[test]
    fn arithmetic_without_folding() {
        assert_eq!(run_elf(ARITHMETIC), "14\n");
    }

    #[test]
    fn loop_sum() {
        assert_eq!(run_elf(LOOP_SUM), "45\n");
    }

    #[test]
    fn recursive_factorial() {
        assert_eq!(run_elf(FACTORIAL), "120\n");
    }

    #[test]
    fn spilled_sum() {
        assert_eq!(run_elf(&spill_src()), "171\n");
    }

    /// A hand-built image whose entry is a single `ret` exercises the whole
    /// map-patch-protect-call path without terminating the test process.
    #[test]
    fn jit_runs_a_trivial_image() {
        let mut image = X86Image::new();
        image.text.write(&[0xC3]);
        image.text.write(&[0; 23]);
        image.rodata.write(b"ro\0");
        image.data.write(&[0; 8]);
        image.flashing.main_offset = Some(0);
        image.flashing.rodata_patch_site = 8;
        image.flashing.data_patch_site = 16;

        let jit = JitImage::load(&image).expect("load");
        jit.run();
    }
}
