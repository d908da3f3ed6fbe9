//! AST to SSA lowering.
//!
//! Walks the statement tree and drives the [`dbl_ir`] builder. Control
//! flow lowers to explicitly-terminated blocks: `if` to then/else/merge,
//! `while` to a body-first start block with a conditional back edge.
//! Every local lives as a named value with memory semantics; the back
//! end's variable analyzer decides where it actually resides.

use std::collections::HashMap;

use dbl_ir::builder::Builder;
use dbl_ir::function::Function;
use dbl_ir::instruction::FcmpPred;
use dbl_ir::module::{Module, NameGenerator};
use dbl_ir::value::Value;
use log::debug;

use crate::ast::{Ast, AstNode, NodeKind, Stmt};
use crate::error::FrontError;

/// Runtime functions every module can call. Declarations carry no body;
/// calls resolve by name against the runtime stubs.
const LIBRARY: [(&str, usize, bool); 8] = [
    ("sin", 1, true),
    ("cos", 1, true),
    ("tan", 1, true),
    ("sqrt", 1, true),
    ("pow", 2, true),
    ("printDouble", 1, false),
    ("scanDouble", 0, true),
    ("printString", 1, false),
];

/// Lower a parsed AST into an SSA module.
pub fn build_module(ast: &Ast) -> Result<Module, FrontError> {
    let mut gen = Gen {
        module: Module::new("ast"),
        globals: HashMap::new(),
        funcs: HashMap::new(),
        string_index: 0,
        endl: None,
    };
    for (name, argc, returns) in LIBRARY {
        let params = (0..argc).map(|i| format!("value{i}")).collect();
        gen.module
            .add_function(Function::new(name, params, returns));
        gen.funcs.insert(name.to_string(), returns);
    }
    // The shared newline string `endl` resolves to.
    let endl = gen.intern_string("\n");
    gen.endl = Some(endl);

    if let Some(root) = &ast.root {
        gen.top(root)?;
    }
    debug!(
        "built module: {} functions, {} doubles, {} strings",
        gen.module.functions.len(),
        gen.module.doubles.len(),
        gen.module.strings.len()
    );
    Ok(gen.module)
}

struct Gen {
    module: Module,
    /// Global double values by source name.
    globals: HashMap<String, Value>,
    /// Known functions and whether they return a value.
    funcs: HashMap<String, bool>,
    string_index: usize,
    endl: Option<Value>,
}

/// Per-function lowering state.
struct FuncCx<'m> {
    builder: Builder<'m>,
    locals: HashMap<String, Value>,
    names: NameGenerator,
}

impl Gen {
    fn intern_string(&mut self, text: &str) -> Value {
        let name = format!("GlobalStr{}", self.string_index);
        self.string_index += 1;
        self.module.add_string(&name, text);
        Value::GlobalString(name)
    }

    /// Top-level walk: globals and function definitions.
    fn top(&mut self, node: &AstNode) -> Result<(), FrontError> {
        match &node.kind {
            NodeKind::Stmt(Stmt::Var) => {
                let name = node
                    .left
                    .as_deref()
                    .and_then(AstNode::name)
                    .ok_or_else(|| corrupted("global variable without a name"))?;
                let init = match node.right.as_deref() {
                    None => 0.0,
                    Some(AstNode {
                        kind: NodeKind::Number(v),
                        ..
                    }) => *v,
                    Some(_) => {
                        return Err(corrupted("global initializer must be a constant"));
                    }
                };
                self.module.add_double(name, init);
                self.globals
                    .insert(name.to_string(), Value::GlobalDouble(name.to_string()));
                Ok(())
            }
            NodeKind::Stmt(Stmt::Func) => self.func(node),
            _ => {
                if let Some(left) = &node.left {
                    self.top(left)?;
                }
                if let Some(right) = &node.right {
                    self.top(right)?;
                }
                Ok(())
            }
        }
    }

    /// `FUNC` node: left is the name, whose left chains `PARAM` nodes and
    /// whose right is the return type (`VOID` or `TYPE`); right is the body.
    fn func(&mut self, node: &AstNode) -> Result<(), FrontError> {
        let head = node
            .left
            .as_deref()
            .ok_or_else(|| corrupted("function without a header"))?;
        let name = head
            .name()
            .ok_or_else(|| corrupted("function without a name"))?
            .to_string();

        let mut params = Vec::new();
        let mut param = head.left.as_deref();
        while let Some(p) = param {
            let pname = p
                .left
                .as_deref()
                .and_then(|ty| ty.left.as_deref())
                .and_then(AstNode::name)
                .ok_or_else(|| corrupted("parameter without a name"))?;
            params.push(pname.to_string());
            param = p.right.as_deref();
        }

        let returns = !matches!(
            head.right.as_deref().and_then(AstNode::stmt),
            Some(Stmt::Void)
        );

        let mut func = Function::new(&name, params.clone(), returns);
        self.funcs.insert(name.clone(), returns);

        let mut cx = FuncCx {
            builder: Builder::new(&mut func),
            locals: HashMap::new(),
            names: NameGenerator::new(),
        };
        let entry_name = cx.names.block("entry");
        let entry = cx.builder.create_block(entry_name);
        cx.builder.switch_to_block(entry);
        for p in &params {
            cx.locals.insert(p.clone(), Value::Temp(p.clone()));
        }

        if let Some(body) = node.right.as_deref() {
            self.stmt(&mut cx, body)?;
        }
        if !cx.builder.is_terminated() {
            cx.builder.ret(None);
        }

        drop(cx);
        self.module.add_function(func);
        Ok(())
    }

    /// Statement-position walk inside a function body.
    fn stmt(&mut self, cx: &mut FuncCx, node: &AstNode) -> Result<(), FrontError> {
        match node.stmt() {
            Some(Stmt::St) => {
                if let Some(left) = &node.left {
                    self.stmt(cx, left)?;
                }
                if let Some(right) = &node.right {
                    self.stmt(cx, right)?;
                }
                Ok(())
            }
            Some(Stmt::Var) => {
                let name = node
                    .left
                    .as_deref()
                    .and_then(AstNode::name)
                    .ok_or_else(|| corrupted("variable without a name"))?;
                let value = match node.right.as_deref() {
                    Some(init) => {
                        let init = self.expr(cx, init)?;
                        let slot = cx.names.value();
                        cx.builder.load(slot, init)
                    }
                    None => {
                        let slot = cx.names.value();
                        cx.builder.alloca(slot)
                    }
                };
                cx.locals.insert(name.to_string(), value);
                Ok(())
            }
            Some(Stmt::Eq) => {
                let target = node
                    .left
                    .as_deref()
                    .ok_or_else(|| corrupted("assignment without a target"))?;
                let dst = self.expr(cx, target)?;
                let src = self.rhs(cx, node)?;
                cx.builder.store(src, dst);
                Ok(())
            }
            Some(Stmt::If) => self.if_stmt(cx, node),
            Some(Stmt::While) => self.while_stmt(cx, node),
            Some(Stmt::Ret) => {
                let value = match node.left.as_deref() {
                    Some(v) => Some(self.expr(cx, v)?),
                    None => None,
                };
                cx.builder.ret(value);
                Ok(())
            }
            Some(Stmt::Out) => {
                let mut item = node.left.as_deref();
                while let Some(n) = item {
                    let arg = n
                        .left
                        .as_deref()
                        .ok_or_else(|| corrupted("out without an argument"))?;
                    let value = self.expr(cx, arg)?;
                    let callee = match value {
                        Value::GlobalString(_) => "printString",
                        _ => "printDouble",
                    };
                    cx.builder.call(callee, vec![value], None);
                    item = n.right.as_deref();
                }
                Ok(())
            }
            Some(Stmt::In) => {
                let mut item = node.left.as_deref();
                while let Some(n) = item {
                    let target = n
                        .left
                        .as_deref()
                        .ok_or_else(|| corrupted("in without a target"))?;
                    let dst = self.expr(cx, target)?;
                    let result = cx.names.value();
                    cx.builder.call("scanDouble", vec![], Some(result.clone()));
                    cx.builder.store(Value::Temp(result), dst);
                    item = n.right.as_deref();
                }
                Ok(())
            }
            _ => {
                // An expression in statement position (e.g. a bare call).
                self.expr(cx, node).map(|_| ())
            }
        }
    }

    fn if_stmt(&mut self, cx: &mut FuncCx, node: &AstNode) -> Result<(), FrontError> {
        let cond_node = node
            .left
            .as_deref()
            .ok_or_else(|| corrupted("if without a condition"))?;
        let cond = self.expr(cx, cond_node)?;

        let body = node
            .right
            .as_deref()
            .ok_or_else(|| corrupted("if without a body"))?;
        let has_else = body.stmt() == Some(Stmt::Else);

        let origin = cx.builder.current_block();

        let then_name = cx.names.block("then");
        let then_block = cx.builder.create_block(then_name);
        cx.builder.switch_to_block(then_block);
        let then_body = if has_else {
            body.left
                .as_deref()
                .ok_or_else(|| corrupted("else without a then branch"))?
        } else {
            body
        };
        self.stmt(cx, then_body)?;
        let then_end = cx.builder.current_block();

        let mut else_parts = None;
        if has_else {
            let else_name = cx.names.block("else");
            let else_block = cx.builder.create_block(else_name);
            cx.builder.switch_to_block(else_block);
            let else_body = body
                .right
                .as_deref()
                .ok_or_else(|| corrupted("else without an else branch"))?;
            self.stmt(cx, else_body)?;
            else_parts = Some((else_block, cx.builder.current_block()));
        }

        let merge_name = cx.names.block("merge");
        let merge = cx.builder.create_block(merge_name);

        cx.builder.switch_to_block(origin);
        let false_target = else_parts.map(|(b, _)| b).unwrap_or(merge);
        cx.builder.cond_br(cond, then_block, false_target);

        cx.builder.switch_to_block(then_end);
        if !cx.builder.is_terminated() {
            cx.builder.br(merge);
        }
        if let Some((_, else_end)) = else_parts {
            cx.builder.switch_to_block(else_end);
            if !cx.builder.is_terminated() {
                cx.builder.br(merge);
            }
        }

        cx.builder.switch_to_block(merge);
        Ok(())
    }

    /// `while` lowers body-first: the start block runs the body, evaluates
    /// the condition, and branches back to itself or on to the end block.
    fn while_stmt(&mut self, cx: &mut FuncCx, node: &AstNode) -> Result<(), FrontError> {
        let origin = cx.builder.current_block();

        let start_name = cx.names.block("start");
        let start = cx.builder.create_block(start_name);
        cx.builder.switch_to_block(start);
        if let Some(body) = node.right.as_deref() {
            self.stmt(cx, body)?;
        }
        let cond_node = node
            .left
            .as_deref()
            .ok_or_else(|| corrupted("while without a condition"))?;
        let cond = self.expr(cx, cond_node)?;

        let end_name = cx.names.block("end");
        let end = cx.builder.create_block(end_name);
        cx.builder.cond_br(cond, start, end);

        cx.builder.switch_to_block(origin);
        if !cx.builder.is_terminated() {
            cx.builder.br(start);
        }
        cx.builder.switch_to_block(end);
        Ok(())
    }

    /// Evaluate an expression node to a value.
    fn expr(&mut self, cx: &mut FuncCx, node: &AstNode) -> Result<Value, FrontError> {
        match &node.kind {
            NodeKind::Number(v) => Ok(Value::Const(*v)),
            NodeKind::Str(s) => Ok(self.intern_string(s)),
            NodeKind::Name(n) => {
                // Globals win over locals, matching symbol lookup order.
                if let Some(v) = self.globals.get(n) {
                    return Ok(v.clone());
                }
                cx.locals
                    .get(n)
                    .cloned()
                    .ok_or_else(|| corrupted(&format!("unknown name {n:?}")))
            }
            NodeKind::Stmt(stmt) => self.stmt_expr(cx, *stmt, node),
        }
    }

    fn stmt_expr(
        &mut self,
        cx: &mut FuncCx,
        stmt: Stmt,
        node: &AstNode,
    ) -> Result<Value, FrontError> {
        match stmt {
            Stmt::Add => {
                let (l, r) = self.operands(cx, node)?;
                let name = cx.names.value();
                Ok(cx.builder.fadd(name, l, r))
            }
            Stmt::Sub => {
                // Unary minus is a subtraction from zero.
                let l = self.expr(
                    cx,
                    node.left
                        .as_deref()
                        .ok_or_else(|| corrupted("sub without an operand"))?,
                )?;
                let name = cx.names.value();
                match node.right.as_deref() {
                    Some(rhs) => {
                        let r = self.expr(cx, rhs)?;
                        Ok(cx.builder.fsub(name, l, r))
                    }
                    None => Ok(cx.builder.fsub(name, Value::Const(0.0), l)),
                }
            }
            Stmt::Mul => {
                let (l, r) = self.operands(cx, node)?;
                let name = cx.names.value();
                Ok(cx.builder.fmul(name, l, r))
            }
            Stmt::Div => {
                let (l, r) = self.operands(cx, node)?;
                let name = cx.names.value();
                Ok(cx.builder.fdiv(name, l, r))
            }
            Stmt::And => {
                let (l, r) = self.operands(cx, node)?;
                let name = cx.names.value();
                Ok(cx.builder.and(name, l, r))
            }
            Stmt::Or => {
                let (l, r) = self.operands(cx, node)?;
                let name = cx.names.value();
                Ok(cx.builder.or(name, l, r))
            }
            Stmt::IsEe => self.cmp(cx, node, FcmpPred::Oeq),
            Stmt::IsNe => self.cmp(cx, node, FcmpPred::One),
            Stmt::IsBt => self.cmp(cx, node, FcmpPred::Olt),
            Stmt::IsGt => self.cmp(cx, node, FcmpPred::Ogt),
            Stmt::Sin => self.library_call(cx, node, "sin"),
            Stmt::Cos => self.library_call(cx, node, "cos"),
            Stmt::Tan => self.library_call(cx, node, "tan"),
            Stmt::Sqrt => self.library_call(cx, node, "sqrt"),
            Stmt::Pow => {
                let (base, power) = self.operands(cx, node)?;
                let name = cx.names.value();
                cx.builder.call("pow", vec![base, power], Some(name.clone()));
                Ok(Value::Temp(name))
            }
            Stmt::Endl => Ok(self
                .endl
                .clone()
                .unwrap_or_else(|| Value::GlobalString("GlobalStr0".into()))),
            Stmt::Call => {
                let head = node
                    .left
                    .as_deref()
                    .ok_or_else(|| corrupted("call without a callee"))?;
                let callee = head
                    .name()
                    .ok_or_else(|| corrupted("call without a callee name"))?;
                let returns = *self
                    .funcs
                    .get(callee)
                    .ok_or_else(|| corrupted(&format!("call to unknown function {callee:?}")))?;

                let mut args = Vec::new();
                let mut item = head.left.as_deref();
                while let Some(p) = item {
                    let arg = p
                        .left
                        .as_deref()
                        .ok_or_else(|| corrupted("call argument without a value"))?;
                    args.push(self.expr(cx, arg)?);
                    item = p.right.as_deref();
                }

                let callee = callee.to_string();
                if returns {
                    let name = cx.names.value();
                    cx.builder.call(callee, args, Some(name.clone()));
                    Ok(Value::Temp(name))
                } else {
                    cx.builder.call(callee, args, None);
                    // A void call in expression position yields zero.
                    Ok(Value::Const(0.0))
                }
            }
            Stmt::Mod => Err(FrontError::NotImplemented("mod".into())),
            other => Err(corrupted(&format!(
                "statement {other:?} is not an expression"
            ))),
        }
    }

    fn operands(&mut self, cx: &mut FuncCx, node: &AstNode) -> Result<(Value, Value), FrontError> {
        let l = self.expr(
            cx,
            node.left
                .as_deref()
                .ok_or_else(|| corrupted("missing left operand"))?,
        )?;
        let r = self.expr(
            cx,
            node.right
                .as_deref()
                .ok_or_else(|| corrupted("missing right operand"))?,
        )?;
        Ok((l, r))
    }

    fn rhs(&mut self, cx: &mut FuncCx, node: &AstNode) -> Result<Value, FrontError> {
        self.expr(
            cx,
            node.right
                .as_deref()
                .ok_or_else(|| corrupted("missing right operand"))?,
        )
    }

    fn cmp(
        &mut self,
        cx: &mut FuncCx,
        node: &AstNode,
        pred: FcmpPred,
    ) -> Result<Value, FrontError> {
        let (l, r) = self.operands(cx, node)?;
        let name = cx.names.value();
        Ok(cx.builder.fcmp(pred, name, l, r))
    }

    fn library_call(
        &mut self,
        cx: &mut FuncCx,
        node: &AstNode,
        callee: &str,
    ) -> Result<Value, FrontError> {
        let arg = self.expr(
            cx,
            node.left
                .as_deref()
                .ok_or_else(|| corrupted("missing operand"))?,
        )?;
        let name = cx.names.value();
        cx.builder.call(callee, vec![arg], Some(name.clone()));
        Ok(Value::Temp(name))
    }
}

fn corrupted(detail: &str) -> FrontError {
    FrontError::Corrupted(detail.to_string())
}
