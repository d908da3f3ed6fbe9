//! Tests for the encoder, the tables, the variable analyzer, and lowering.

use dbl_ir::builder::Builder;
use dbl_ir::function::Function;
use dbl_ir::instruction::FcmpPred;
use dbl_ir::module::Module;
use dbl_ir::value::Value;

use crate::encode::{self, Cond};
use crate::error::BackendError;
use crate::image::Area;
use crate::lower::{compile_module, ResolvePolicy};
use crate::refs::RefTable;
use crate::reg::{Gpr, Xmm};
use crate::vars::{self, Loc};

// ── encoder ──

fn bytes_of(emit: impl FnOnce(&mut Area)) -> Vec<u8> {
    let mut area = Area::new();
    emit(&mut area);
    area.as_slice().to_vec()
}

#[test]
fn encode_vex_arithmetic() {
    // vaddsd xmm1, xmm2, xmm3: two-byte VEX form.
    assert_eq!(
        bytes_of(|a| encode::vaddsd(a, Xmm(1), Xmm(2), Xmm(3))),
        [0xC5, 0xEB, 0x58, 0xCB]
    );
    // vsubsd xmm2, xmm0, xmm1.
    assert_eq!(
        bytes_of(|a| encode::vsubsd(a, Xmm(2), Xmm(0), Xmm(1))),
        [0xC5, 0xFB, 0x5C, 0xD1]
    );
    // vandpd xmm0, xmm1, xmm2: 66 prefix family.
    assert_eq!(
        bytes_of(|a| encode::vandpd(a, Xmm(0), Xmm(1), Xmm(2))),
        [0xC5, 0xF1, 0x54, 0xC2]
    );
    // An xmm8+ rm operand forces the three-byte form.
    assert_eq!(
        bytes_of(|a| encode::vaddsd(a, Xmm(1), Xmm(2), Xmm(9))),
        [0xC4, 0xC1, 0x6B, 0x58, 0xC9]
    );
}

#[test]
fn encode_vcmpsd_carries_predicate() {
    assert_eq!(
        bytes_of(|a| encode::vcmpsd(a, Xmm(0), Xmm(1), Xmm(2), 1)),
        [0xC5, 0xF3, 0xC2, 0xC2, 0x01]
    );
}

#[test]
fn encode_vmovq_forms() {
    // xmm↔xmm uses the F3 map and the two-byte prefix when possible.
    assert_eq!(
        bytes_of(|a| encode::vmovq_xmm_xmm(a, Xmm(0), Xmm(1))),
        [0xC5, 0xFA, 0x7E, 0xC1]
    );
    // gpr moves carry W=1, so they always use the three-byte prefix.
    assert_eq!(
        bytes_of(|a| encode::vmovq_xmm_gpr(a, Xmm(0), Gpr::Rax)),
        [0xC4, 0xE1, 0xF9, 0x6E, 0xC0]
    );
    assert_eq!(
        bytes_of(|a| encode::vmovq_gpr_xmm(a, Gpr::Rax, Xmm(0))),
        [0xC4, 0xE1, 0xF9, 0x7E, 0xC0]
    );
    assert_eq!(
        bytes_of(|a| encode::vmovq_xmm_gpr(a, Xmm(3), Gpr::R14)),
        [0xC4, 0xC1, 0xF9, 0x6E, 0xDE]
    );
}

#[test]
fn encode_stack_and_moves() {
    assert_eq!(bytes_of(|a| encode::push_r(a, Gpr::Rbp)), [0x55]);
    assert_eq!(bytes_of(|a| encode::push_r(a, Gpr::R14)), [0x41, 0x56]);
    assert_eq!(
        bytes_of(|a| encode::mov_rr(a, Gpr::Rbp, Gpr::Rsp)),
        [0x48, 0x89, 0xE5]
    );
    assert_eq!(
        bytes_of(|a| encode::mov_r_mem(a, Gpr::R14, Gpr::Rbp, -8)),
        [0x4C, 0x8B, 0x75, 0xF8]
    );
    assert_eq!(
        bytes_of(|a| encode::mov_mem_r(a, Gpr::Rbp, -8, Gpr::R14)),
        [0x4C, 0x89, 0x75, 0xF8]
    );
    assert_eq!(
        bytes_of(|a| encode::sub_ri(a, Gpr::Rsp, 16)),
        [0x48, 0x81, 0xEC, 0x10, 0x00, 0x00, 0x00]
    );
    assert_eq!(
        bytes_of(|a| encode::add_ri(a, Gpr::Rsp, 16)),
        [0x48, 0x81, 0xC4, 0x10, 0x00, 0x00, 0x00]
    );
    // movabs r15: the imm64 begins two bytes in.
    assert_eq!(
        bytes_of(|a| encode::movabs(a, Gpr::R15, 0x1122334455667788)),
        [0x49, 0xBF, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    );
}

#[test]
fn encode_control_flow() {
    assert_eq!(
        bytes_of(|a| {
            encode::jmp(a);
        }),
        [0xE9, 0, 0, 0, 0]
    );
    assert_eq!(
        bytes_of(|a| {
            encode::jcc(a, Cond::Z);
        }),
        [0x0F, 0x84, 0, 0, 0, 0]
    );
    assert_eq!(
        bytes_of(|a| {
            encode::call(a);
        }),
        [0xE8, 0, 0, 0, 0]
    );
    assert_eq!(
        bytes_of(|a| encode::test_rr(a, Gpr::Rax, Gpr::Rax)),
        [0x48, 0x85, 0xC0]
    );
    let mut exit = Vec::new();
    exit.extend(bytes_of(|a| encode::xor_edi_edi(a)));
    exit.extend(bytes_of(|a| encode::mov_ri32(a, Gpr::Rax, 0x3C)));
    exit.extend(bytes_of(|a| encode::syscall(a)));
    assert_eq!(exit, [0x31, 0xFF, 0xB8, 0x3C, 0, 0, 0, 0x0F, 0x05]);
}

// ── reference tables ──

#[test]
fn resolve_writes_relative_displacement() {
    let mut text = Area::new();
    text.write(&[0u8; 120]);

    let mut table = RefTable::new();
    table.add_label("target", 100);
    // jmp at 10: rel32 at 11, delta −5 ⇒ 100 − 10 − 5 = 85.
    table.add_reference(10, 11, -5, "target");
    table.resolve(&mut text, ResolvePolicy::Strict).expect("resolve");
    assert_eq!(text.read_i32(11), 85);

    // Re-resolving is a no-op: the patch is already correct.
    table.resolve(&mut text, ResolvePolicy::Strict).expect("resolve");
    assert_eq!(text.read_i32(11), 85);
}

#[test]
fn resolve_backward_reference_is_negative() {
    let mut text = Area::new();
    text.write(&[0u8; 64]);

    let mut table = RefTable::new();
    table.add_label("loop", 8);
    table.add_reference(40, 41, -5, "loop");
    table.resolve(&mut text, ResolvePolicy::Strict).expect("resolve");
    assert_eq!(text.read_i32(41), 8 - 40 - 5);
}

#[test]
fn resolve_policies_for_missing_labels() {
    let mut text = Area::new();
    text.write(&[0u8; 16]);

    let mut table = RefTable::new();
    table.add_reference(0, 1, -5, "nowhere");
    assert!(matches!(
        table.resolve(&mut text, ResolvePolicy::Strict),
        Err(BackendError::UnresolvedSymbol(_))
    ));
    table
        .resolve(&mut text, ResolvePolicy::ZeroMissing)
        .expect("lenient resolve");
    assert_eq!(text.read_i32(1), 0);
}

// ── variable analyzer ──

/// One block computing a chain of `count` temporaries.
fn chain_function(count: usize) -> Function {
    let mut func = Function::new("f", vec![], true);
    let mut b = Builder::new(&mut func);
    let entry = b.create_block("entry0");
    b.switch_to_block(entry);
    let mut acc = b.fadd("0", Value::Const(1.0), Value::Const(2.0));
    for i in 1..count {
        acc = b.fadd(i.to_string(), acc, Value::Const(1.0));
    }
    b.ret(Some(acc));
    func
}

#[test]
fn fifteen_names_fit_in_registers() {
    let frame = vars::analyze(&chain_function(15));
    let table = &frame.tables[0];
    assert_eq!(table.entries.len(), 15);
    assert!(table
        .entries
        .iter()
        .all(|e| matches!(e.loc, Loc::Xmm(x) if x.0 <= 14)));
    assert_eq!(frame.frame_size, 0);
}

#[test]
fn sixteenth_name_spills() {
    let frame = vars::analyze(&chain_function(16));
    let table = &frame.tables[0];
    let spills: Vec<_> = table
        .entries
        .iter()
        .filter(|e| matches!(e.loc, Loc::Mem(_)))
        .collect();
    assert_eq!(spills.len(), 1);
    assert_eq!(spills[0].loc, Loc::Mem(-8));
    // xmm15 stays reserved.
    assert!(table
        .entries
        .iter()
        .all(|e| !matches!(e.loc, Loc::Xmm(x) if x.0 == 15)));
    assert_eq!(frame.frame_size, 16);
}

#[test]
fn tables_hold_exactly_the_block_names() {
    // Globals and constants stay out of the tables.
    let mut func = Function::new("f", vec!["p".into()], true);
    let mut b = Builder::new(&mut func);
    let entry = b.create_block("entry0");
    b.switch_to_block(entry);
    let t = b.fadd(
        "0",
        Value::GlobalDouble("g".into()),
        Value::Const(3.0),
    );
    let u = b.fadd("1", t, Value::Temp("p".into()));
    b.ret(Some(u));
    let frame = vars::analyze(&func);

    let mut names: Vec<_> = frame.tables[0]
        .entries
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, ["0", "1", "p"]);
}

#[test]
fn cross_block_names_get_home_slots() {
    let mut func = Function::new("f", vec![], true);
    let mut b = Builder::new(&mut func);
    let entry = b.create_block("entry0");
    let next = b.create_block("next1");
    b.switch_to_block(entry);
    let t = b.fadd("0", Value::Const(1.0), Value::Const(2.0));
    b.br(next);
    b.switch_to_block(next);
    b.ret(Some(t));
    let frame = vars::analyze(&func);

    assert_eq!(frame.multi.len(), 1);
    assert_eq!(frame.multi[0].name, "0");
    assert_eq!(frame.multi[0].home, -8);
    assert_eq!(frame.frame_size, 16);

    // Entry defines the value, so it is written back; next only reloads.
    assert_eq!(frame.writebacks(0), vec![(-8, Xmm(0))]);
    assert_eq!(frame.writebacks(1), vec![]);
    assert_eq!(frame.reloads(1), vec![(Xmm(0), -8)]);
}

// ── lowering ──

/// `func main():void { ret }` plus one helper the module never calls.
fn tiny_module() -> Module {
    let mut module = Module::new("m");
    let mut main = Function::new("main", vec![], false);
    {
        let mut b = Builder::new(&mut main);
        let entry = b.create_block("entry0");
        b.switch_to_block(entry);
        b.ret(None);
    }
    module.add_function(main);
    module
}

#[test]
fn compile_records_flashing_layout() {
    let image = compile_module(&tiny_module(), ResolvePolicy::Strict).expect("compile");
    let f = &image.flashing;

    let main_offset = f.main_offset.expect("main offset");
    assert_eq!(main_offset, 0);
    // The two movabs imm64 operands sit right at the top of main.
    assert_eq!(f.data_patch_site, 2);
    assert_eq!(f.rodata_patch_site, 12);
    assert!(main_offset < f.lib_offset);
    assert_eq!(f.lib_offset + f.lib_size, image.text.len());
    // The stub buffers landed in the data area.
    assert!(image.data.len() >= 64);
}

#[test]
fn declarations_emit_nothing() {
    let mut module = tiny_module();
    module.add_function(Function::new("sin", vec!["value".into()], true));
    let with_decl = compile_module(&module, ResolvePolicy::Strict).expect("compile");
    let without = compile_module(&tiny_module(), ResolvePolicy::Strict).expect("compile");
    assert_eq!(with_decl.text.as_slice(), without.text.as_slice());
}

#[test]
fn compile_is_deterministic() {
    let mut module = Module::new("m");
    module.add_double("g", 1.5);
    let mut main = Function::new("main", vec![], false);
    {
        let mut b = Builder::new(&mut main);
        let entry = b.create_block("entry0");
        b.switch_to_block(entry);
        let t = b.fadd("0", Value::GlobalDouble("g".into()), Value::Const(2.0));
        let c = b.fcmp(FcmpPred::Ogt, "1", t, Value::Const(0.0));
        b.call("printDouble", vec![c], None);
        b.ret(None);
    }
    module.add_function(main);

    let a = compile_module(&module, ResolvePolicy::Strict).expect("compile");
    let b = compile_module(&module, ResolvePolicy::Strict).expect("compile");
    assert_eq!(a.text.as_slice(), b.text.as_slice());
    assert_eq!(a.rodata.as_slice(), b.rodata.as_slice());
    assert_eq!(a.data.as_slice(), b.data.as_slice());
}

#[test]
fn seven_argument_call_is_rejected() {
    let mut module = Module::new("m");
    let mut callee = Function::new("wide", (0..7).map(|i| format!("p{i}")).collect(), true);
    {
        let mut b = Builder::new(&mut callee);
        let entry = b.create_block("entry0");
        b.switch_to_block(entry);
        b.ret(Some(Value::Const(0.0)));
    }
    module.add_function(callee);

    let mut main = Function::new("main", vec![], false);
    {
        let mut b = Builder::new(&mut main);
        let entry = b.create_block("entry0");
        b.switch_to_block(entry);
        b.call(
            "wide",
            (0..7).map(|i| Value::Const(f64::from(i))).collect(),
            Some("0".into()),
        );
        b.ret(None);
    }
    module.add_function(main);

    assert!(matches!(
        compile_module(&module, ResolvePolicy::Strict),
        Err(BackendError::NotImplemented(_))
    ));
}

#[test]
fn six_argument_call_succeeds() {
    let mut module = Module::new("m");
    let mut callee = Function::new("wide", (0..6).map(|i| format!("p{i}")).collect(), true);
    {
        let mut b = Builder::new(&mut callee);
        let entry = b.create_block("entry0");
        b.switch_to_block(entry);
        b.ret(Some(Value::Temp("p5".into())));
    }
    module.add_function(callee);

    let mut main = Function::new("main", vec![], false);
    {
        let mut b = Builder::new(&mut main);
        let entry = b.create_block("entry0");
        b.switch_to_block(entry);
        b.call(
            "wide",
            (0..6).map(|i| Value::Const(f64::from(i))).collect(),
            Some("0".into()),
        );
        b.ret(None);
    }
    module.add_function(main);

    compile_module(&module, ResolvePolicy::Strict).expect("compile");
}

#[test]
fn unknown_callee_is_strict_error_but_lenient_zero() {
    let mut module = tiny_module();
    let main = &mut module.functions[0];
    main.blocks[0].insts.insert(
        0,
        dbl_ir::instruction::Inst::Call {
            callee: "missing".into(),
            args: vec![],
            result: None,
        },
    );
    assert!(matches!(
        compile_module(&module, ResolvePolicy::Strict),
        Err(BackendError::UnresolvedSymbol(_))
    ));
    compile_module(&module, ResolvePolicy::ZeroMissing).expect("lenient compile");
}

#[test]
fn missing_main_has_no_entry() {
    let mut module = Module::new("m");
    let mut f = Function::new("helper", vec![], false);
    {
        let mut b = Builder::new(&mut f);
        let entry = b.create_block("entry0");
        b.switch_to_block(entry);
        b.ret(None);
    }
    module.add_function(f);
    let image = compile_module(&module, ResolvePolicy::Strict).expect("compile");
    assert!(image.flashing.main_offset.is_none());

    let mut image = image;
    let err = crate::elf::write_executable(&mut image, std::path::Path::new("/dev/null"));
    assert!(matches!(err, Err(BackendError::MissingEntry)));
}
