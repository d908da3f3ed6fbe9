//! Textual dump of a module, for `--jit`-free debugging and logs.

use std::fmt;

use crate::function::Function;
use crate::instruction::{FcmpPred, Inst};
use crate::module::Module;
use crate::value::Value;

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Temp(n) => write!(f, "%{n}"),
            Value::GlobalDouble(n) => write!(f, "@{n}"),
            Value::GlobalString(n) => write!(f, "@{n}"),
            Value::Const(v) => write!(f, "{v}"),
        }
    }
}

impl fmt::Display for FcmpPred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FcmpPred::Oeq => "oeq",
            FcmpPred::One => "one",
            FcmpPred::Olt => "olt",
            FcmpPred::Ogt => "ogt",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::FAdd { result, lhs, rhs } => write!(f, "%{result} = fadd {lhs}, {rhs}"),
            Inst::FSub { result, lhs, rhs } => write!(f, "%{result} = fsub {lhs}, {rhs}"),
            Inst::FMul { result, lhs, rhs } => write!(f, "%{result} = fmul {lhs}, {rhs}"),
            Inst::FDiv { result, lhs, rhs } => write!(f, "%{result} = fdiv {lhs}, {rhs}"),
            Inst::And { result, lhs, rhs } => write!(f, "%{result} = and {lhs}, {rhs}"),
            Inst::Or { result, lhs, rhs } => write!(f, "%{result} = or {lhs}, {rhs}"),
            Inst::FCmp {
                pred,
                result,
                lhs,
                rhs,
            } => write!(f, "%{result} = fcmp {pred} {lhs}, {rhs}"),
            Inst::Load { result, src } => write!(f, "%{result} = load {src}"),
            Inst::Store { src, dst } => write!(f, "store {src}, {dst}"),
            Inst::Alloca { result } => write!(f, "%{result} = alloca"),
            Inst::Call {
                callee,
                args,
                result,
            } => {
                if let Some(r) = result {
                    write!(f, "%{r} = call @{callee}(")?;
                } else {
                    write!(f, "call @{callee}(")?;
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Inst::Br { target } => write!(f, "br {target}"),
            Inst::CondBr {
                cond,
                then_block,
                else_block,
            } => write!(f, "br {cond}, {then_block}, {else_block}"),
            Inst::Ret { value: Some(v) } => write!(f, "ret {v}"),
            Inst::Ret { value: None } => write!(f, "ret void"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ret = if self.returns_value { "double" } else { "void" };
        write!(f, "func @{}({}) {ret}", self.name, self.params.join(", "))?;
        if self.is_declaration() {
            return writeln!(f, " declare");
        }
        writeln!(f, " {{")?;
        for block in &self.blocks {
            writeln!(f, "{}:", block.name)?;
            for inst in &block.insts {
                writeln!(f, "  {inst}")?;
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;
        for g in &self.doubles {
            writeln!(f, "@{} = global double {}", g.name, g.init)?;
        }
        for s in &self.strings {
            writeln!(f, "@{} = global str {:?}", s.name, s.bytes)?;
        }
        for func in &self.functions {
            write!(f, "{func}")?;
        }
        Ok(())
    }
}
