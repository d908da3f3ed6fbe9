//! Tests for the IR data model and builder.

use crate::builder::Builder;
use crate::function::Function;
use crate::instruction::{FcmpPred, Inst};
use crate::module::{Module, NameGenerator};
use crate::value::Value;

#[test]
fn name_generator_counts() {
    let mut names = NameGenerator::new();
    assert_eq!(names.value(), "0");
    assert_eq!(names.value(), "1");
    assert_eq!(names.block("then"), "then0");
    assert_eq!(names.block("merge"), "merge1");
}

#[test]
fn builder_appends_to_current_block() {
    let mut func = Function::new("f", vec!["x".into()], true);
    let mut b = Builder::new(&mut func);

    let entry = b.create_block("entry0");
    b.switch_to_block(entry);
    let sum = b.fadd("0", Value::Temp("x".into()), Value::Const(1.0));
    b.ret(Some(sum));

    assert_eq!(func.blocks.len(), 1);
    assert_eq!(func.blocks[0].insts.len(), 2);
    assert!(func.blocks[0].is_terminated());
}

#[test]
fn builder_branches_use_block_names() {
    let mut func = Function::new("f", vec![], false);
    let mut b = Builder::new(&mut func);

    let entry = b.create_block("entry0");
    let then = b.create_block("then1");
    let merge = b.create_block("merge2");

    b.switch_to_block(entry);
    let cond = b.fcmp(
        FcmpPred::Olt,
        "0",
        Value::Const(1.0),
        Value::Const(2.0),
    );
    b.cond_br(cond, then, merge);

    b.switch_to_block(then);
    b.br(merge);

    b.switch_to_block(merge);
    b.ret(None);

    match &func.blocks[0].insts[1] {
        Inst::CondBr {
            then_block,
            else_block,
            ..
        } => {
            assert_eq!(then_block, "then1");
            assert_eq!(else_block, "merge2");
        }
        other => panic!("expected condbr, got {other:?}"),
    }
}

#[test]
fn defs_and_operands() {
    let store = Inst::Store {
        src: Value::Const(3.0),
        dst: Value::Temp("x".into()),
    };
    assert_eq!(store.def(), Some("x"));

    let mut ops = Vec::new();
    store.operands(&mut ops);
    assert_eq!(ops.len(), 2);

    let call = Inst::Call {
        callee: "printDouble".into(),
        args: vec![Value::Temp("x".into())],
        result: None,
    };
    assert_eq!(call.def(), None);
    ops.clear();
    call.operands(&mut ops);
    assert_eq!(ops, vec![&Value::Temp("x".into())]);
}

#[test]
fn declarations_have_no_blocks() {
    let func = Function::new("sin", vec!["value".into()], true);
    assert!(func.is_declaration());
}

#[test]
fn module_strings_are_nul_terminated() {
    let mut module = Module::new("m");
    module.add_string("GlobalStr0", "hi\n");
    assert_eq!(module.strings[0].bytes, b"hi\n\0");
}
