//! Tests for the AST reader, the AST lowering, and the bytecode reader.

use dbl_ir::instruction::Inst;
use dbl_ir::value::Value;

use crate::ast::{parse_ast, NodeKind, Stmt};
use crate::astgen;
use crate::bytecode::{self, Cmd};
use crate::error::FrontError;

// ── AST reader ──

#[test]
fn parses_keywords_case_insensitively() {
    let ast = parse_ast("{ st {ret} {Var} }").expect("parse");
    let root = ast.root.expect("root");
    assert_eq!(root.kind, NodeKind::Stmt(Stmt::St));
    assert_eq!(root.left.as_ref().unwrap().kind, NodeKind::Stmt(Stmt::Ret));
    assert_eq!(root.right.as_ref().unwrap().kind, NodeKind::Stmt(Stmt::Var));
}

#[test]
fn parses_names_strings_numbers() {
    let ast = parse_ast("{ ST {\"counter\"} {'hello there'} }").expect("parse");
    let root = ast.root.unwrap();
    assert_eq!(
        root.left.unwrap().kind,
        NodeKind::Name("counter".to_string())
    );
    assert_eq!(
        root.right.unwrap().kind,
        NodeKind::Str("hello there".to_string())
    );

    let ast = parse_ast("{ 3.5 }").expect("parse");
    assert_eq!(ast.root.unwrap().kind, NodeKind::Number(3.5));
}

#[test]
fn nil_reads_as_absent() {
    let ast = parse_ast("{ ST {NIL} {5} }").expect("parse");
    let root = ast.root.unwrap();
    // `{NIL}` fills the left child slot with nothing.
    assert!(root.left.is_none());
    assert_eq!(root.right.unwrap().kind, NodeKind::Number(5.0));
}

#[test]
fn quoted_token_that_parses_as_number_is_a_number() {
    let ast = parse_ast("{ \"12\" }").expect("parse");
    assert_eq!(ast.root.unwrap().kind, NodeKind::Number(12.0));
}

#[test]
fn live_comment_wraps_a_node() {
    let ast = parse_ast("$db note { RET } $").expect("parse");
    assert_eq!(ast.root.unwrap().kind, NodeKind::Stmt(Stmt::Ret));
}

#[test]
fn foreign_comment_block_is_skipped() {
    let ast = parse_ast("$xx anything at all $ ").expect("parse");
    assert!(ast.root.is_none());
}

#[test]
fn unclosed_node_is_corrupted() {
    assert!(matches!(
        parse_ast("{ ST {RET}"),
        Err(FrontError::Corrupted(_))
    ));
}

// ── AST lowering ──

const HELLO: &str = "{FUNC {\"main\" {NIL} {VOID}} {OUT {ST {'hi\n'} {NIL}} {NIL}}}";

#[test]
fn hello_world_lowers_to_print_calls() {
    let ast = parse_ast(HELLO).expect("parse");
    let module = astgen::build_module(&ast).expect("lower");

    let main = module.function("main").expect("main");
    assert!(!main.returns_value);
    assert_eq!(main.blocks.len(), 1);

    let insts = &main.blocks[0].insts;
    assert!(matches!(
        &insts[0],
        Inst::Call { callee, args, result: None }
            if callee == "printString" && matches!(&args[0], Value::GlobalString(_))
    ));
    assert!(matches!(insts.last(), Some(Inst::Ret { value: None })));

    // Library declarations are present but bodiless.
    let sqrt = module.function("sqrt").expect("sqrt");
    assert!(sqrt.is_declaration());
    assert!(sqrt.returns_value);
}

#[test]
fn while_lowers_body_first_with_back_edge() {
    // func main():void { var i = 0; while (i < 3) { i = i + 1 } }
    let src = "{FUNC {\"main\" {NIL} {VOID}} \
               {ST {VAR {\"i\"} {0}} \
               {WHILE {IS_BT {\"i\"} {3}} {EQ {\"i\"} {ADD {\"i\"} {1}}}}}}";
    let ast = parse_ast(src).expect("parse");
    let module = astgen::build_module(&ast).expect("lower");
    let main = module.function("main").expect("main");

    // entry, start, end
    assert_eq!(main.blocks.len(), 3);
    let entry = &main.blocks[0];
    let start = &main.blocks[1];
    let end = &main.blocks[2];
    assert!(start.name.starts_with("start"));
    assert!(end.name.starts_with("end"));

    assert!(matches!(
        entry.insts.last(),
        Some(Inst::Br { target }) if target == &start.name
    ));
    match start.insts.last() {
        Some(Inst::CondBr {
            then_block,
            else_block,
            ..
        }) => {
            assert_eq!(then_block, &start.name);
            assert_eq!(else_block, &end.name);
        }
        other => panic!("expected condbr, got {other:?}"),
    }
    assert!(matches!(end.insts.last(), Some(Inst::Ret { value: None })));
}

#[test]
fn if_else_lowers_to_four_blocks() {
    // func f():double { if (1 < 2) ret 1; else ret 2; }
    let src = "{FUNC {\"f\" {NIL} {TYPE}} \
               {IF {IS_BT {1} {2}} {ELSE {RET {1}} {RET {2}}}}}";
    let ast = parse_ast(src).expect("parse");
    let module = astgen::build_module(&ast).expect("lower");
    let f = module.function("f").expect("f");

    assert_eq!(f.blocks.len(), 4);
    assert!(f.blocks[1].name.starts_with("then"));
    assert!(f.blocks[2].name.starts_with("else"));
    assert!(f.blocks[3].name.starts_with("merge"));
    match f.blocks[0].insts.last() {
        Some(Inst::CondBr {
            then_block,
            else_block,
            ..
        }) => {
            assert_eq!(then_block, &f.blocks[1].name);
            assert_eq!(else_block, &f.blocks[2].name);
        }
        other => panic!("expected condbr, got {other:?}"),
    }
}

#[test]
fn out_endl_prints_the_shared_newline() {
    let src = "{FUNC {\"main\" {NIL} {VOID}} {OUT {ST {ENDL} {NIL}} {NIL}}}";
    let ast = parse_ast(src).expect("parse");
    let module = astgen::build_module(&ast).expect("lower");
    let main = module.function("main").expect("main");
    assert!(matches!(
        &main.blocks[0].insts[0],
        Inst::Call { callee, args, .. }
            if callee == "printString"
            && args[0] == Value::GlobalString("GlobalStr0".into())
    ));
    assert_eq!(module.strings[0].bytes, b"\n\0");
}

#[test]
fn mod_is_not_implemented() {
    let src = "{FUNC {\"main\" {NIL} {VOID}} \
               {ST {VAR {\"x\"} {NIL}} {EQ {\"x\"} {MOD {1} {2}}}}}";
    let ast = parse_ast(src).expect("parse");
    assert!(matches!(
        astgen::build_module(&ast),
        Err(FrontError::NotImplemented(_))
    ));
}

#[test]
fn top_level_var_becomes_a_global() {
    let src = "{ST {VAR {\"g\"} {2.5}} {FUNC {\"main\" {NIL} {VOID}} {RET}}}";
    let ast = parse_ast(src).expect("parse");
    let module = astgen::build_module(&ast).expect("lower");
    assert_eq!(module.doubles.len(), 1);
    assert_eq!(module.doubles[0].name, "g");
    assert_eq!(module.doubles[0].init, 2.5);
}

// ── bytecode ──

fn encode(cmds: &[(u8, Option<i32>, Option<u8>)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"DB\0");
    bytes.push(2); // version
    bytes.push(0); // videoMode
    bytes.extend_from_slice(&(cmds.len() as u32).to_le_bytes());
    for &(opcode, immed, reg) in cmds {
        let mut header = opcode;
        if immed.is_some() {
            header |= 0x80;
        }
        if reg.is_some() {
            header |= 0x40;
        }
        bytes.push(header);
        if let Some(v) = immed {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        if let Some(r) = reg {
            bytes.push(r);
        }
    }
    bytes
}

#[test]
fn bytecode_roundtrip() {
    let bytes = encode(&[(1, Some(1500), None), (2, None, Some(3)), (0, None, None)]);
    let cmds = bytecode::parse_bytecode(&bytes).expect("parse");
    assert_eq!(
        cmds,
        vec![
            Cmd {
                opcode: 1,
                mem: false,
                reg: false,
                immed: true,
                data: 1500,
                reg_index: 0
            },
            Cmd {
                opcode: 2,
                mem: false,
                reg: true,
                immed: false,
                data: 0,
                reg_index: 3
            },
            Cmd {
                opcode: 0,
                mem: false,
                reg: false,
                immed: false,
                data: 0,
                reg_index: 0
            },
        ]
    );
}

#[test]
fn bytecode_header_checks() {
    assert!(matches!(
        bytecode::parse_bytecode(b"DB"),
        Err(FrontError::Corrupted(_))
    ));
    assert!(matches!(
        bytecode::parse_bytecode(b"XX\0\x02\x00\x01\x00\x00\x00"),
        Err(FrontError::BadMagic)
    ));
    assert!(matches!(
        bytecode::parse_bytecode(b"DB\0\x03\x00\x01\x00\x00\x00"),
        Err(FrontError::Version {
            found: 3,
            expected: 2
        })
    ));
    // Count says two commands, stream holds one.
    let mut bytes = encode(&[(0, None, None)]);
    bytes[5] = 2;
    assert!(matches!(
        bytecode::parse_bytecode(&bytes),
        Err(FrontError::Corrupted(_))
    ));
}

#[test]
fn bytecode_lowers_fixed_point_push_out() {
    // push 1500; push 500; add; out; hlt → prints 2.0
    let bytes = encode(&[
        (1, Some(1500), None),
        (1, Some(500), None),
        (3, None, None),
        (7, None, None),
        (0, None, None),
    ]);
    let cmds = bytecode::parse_bytecode(&bytes).expect("parse");
    let module = bytecode::build_module(&cmds).expect("lower");
    let main = module.function("main").expect("main");
    assert!(!main.returns_value);

    let insts = &main.blocks[0].insts;
    // Six register allocas first.
    assert!(matches!(insts[5], Inst::Alloca { .. }));
    assert!(matches!(
        &insts[6],
        Inst::FAdd { lhs: Value::Const(a), rhs: Value::Const(b), .. }
            if *a == 1.5 && *b == 0.5
    ));
    assert!(matches!(insts.last(), Some(Inst::Ret { value: None })));
}

#[test]
fn bytecode_stack_underflow_is_corrupted() {
    let bytes = encode(&[(3, None, None)]);
    let cmds = bytecode::parse_bytecode(&bytes).expect("parse");
    assert!(matches!(
        bytecode::build_module(&cmds),
        Err(FrontError::Corrupted(_))
    ));
}
