//! Instruction definitions.

use crate::value::Value;

/// Floating comparison predicates. Only the ordered variants the front
/// end produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FcmpPred {
    /// Ordered equal.
    Oeq,
    /// Ordered not-equal.
    One,
    /// Ordered less-than.
    Olt,
    /// Ordered greater-than.
    Ogt,
}

/// An instruction: opcode, operand values, and a result name when the
/// instruction produces a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    FAdd { result: String, lhs: Value, rhs: Value },
    FSub { result: String, lhs: Value, rhs: Value },
    FMul { result: String, lhs: Value, rhs: Value },
    FDiv { result: String, lhs: Value, rhs: Value },
    /// Bitwise and of the operand bit patterns. Comparison results are
    /// all-ones/all-zeros masks, so this doubles as logical and.
    And { result: String, lhs: Value, rhs: Value },
    Or { result: String, lhs: Value, rhs: Value },
    FCmp {
        pred: FcmpPred,
        result: String,
        lhs: Value,
        rhs: Value,
    },
    /// Copy `src` into the named temp.
    Load { result: String, src: Value },
    /// Copy `src` into `dst`.
    Store { src: Value, dst: Value },
    /// Reserve a named local. Emits no code; the variable analyzer sizes
    /// the frame from the name alone.
    Alloca { result: String },
    Call {
        callee: String,
        args: Vec<Value>,
        result: Option<String>,
    },
    /// Unconditional branch to the named block.
    Br { target: String },
    /// Conditional branch: nonzero condition takes `then_block`.
    CondBr {
        cond: Value,
        then_block: String,
        else_block: String,
    },
    Ret { value: Option<Value> },
}

impl Inst {
    /// Whether this instruction ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Br { .. } | Inst::CondBr { .. } | Inst::Ret { .. })
    }

    /// The name this instruction writes, if any. A store to a temp counts
    /// as writing that temp.
    pub fn def(&self) -> Option<&str> {
        match self {
            Inst::FAdd { result, .. }
            | Inst::FSub { result, .. }
            | Inst::FMul { result, .. }
            | Inst::FDiv { result, .. }
            | Inst::And { result, .. }
            | Inst::Or { result, .. }
            | Inst::FCmp { result, .. }
            | Inst::Load { result, .. }
            | Inst::Alloca { result } => Some(result),
            Inst::Store { dst, .. } => dst.temp_name(),
            Inst::Call { result, .. } => result.as_deref(),
            _ => None,
        }
    }

    /// Append this instruction's operand values (not its result) to `out`.
    pub fn operands<'a>(&'a self, out: &mut Vec<&'a Value>) {
        match self {
            Inst::FAdd { lhs, rhs, .. }
            | Inst::FSub { lhs, rhs, .. }
            | Inst::FMul { lhs, rhs, .. }
            | Inst::FDiv { lhs, rhs, .. }
            | Inst::And { lhs, rhs, .. }
            | Inst::Or { lhs, rhs, .. }
            | Inst::FCmp { lhs, rhs, .. } => {
                out.push(lhs);
                out.push(rhs);
            }
            Inst::Load { src, .. } => out.push(src),
            Inst::Store { src, dst } => {
                out.push(src);
                out.push(dst);
            }
            Inst::Call { args, .. } => out.extend(args.iter()),
            Inst::CondBr { cond, .. } => out.push(cond),
            Inst::Ret { value: Some(v) } => out.push(v),
            Inst::Alloca { .. } | Inst::Br { .. } | Inst::Ret { value: None } => {}
        }
    }
}
