//! Insert-point builder for constructing a function's IR.

use crate::function::{BasicBlock, Function};
use crate::instruction::{FcmpPred, Inst};
use crate::value::{BlockRef, Value};

/// Builder for one function. Blocks are created up front and filled by
/// switching the insert point between them.
pub struct Builder<'a> {
    func: &'a mut Function,
    current: Option<BlockRef>,
}

impl<'a> Builder<'a> {
    pub fn new(func: &'a mut Function) -> Self {
        Self {
            func,
            current: None,
        }
    }

    /// Create a new basic block and return its reference. Does not move
    /// the insert point.
    pub fn create_block(&mut self, name: impl Into<String>) -> BlockRef {
        let idx = self.func.blocks.len() as u32;
        self.func.blocks.push(BasicBlock::new(name));
        BlockRef(idx)
    }

    /// Set the insert point for subsequent instructions.
    pub fn switch_to_block(&mut self, block: BlockRef) {
        self.current = Some(block);
    }

    /// The current insert block.
    pub fn current_block(&self) -> BlockRef {
        self.current.expect("no insert block")
    }

    /// Name of a block.
    pub fn block_name(&self, block: BlockRef) -> &str {
        &self.func.block(block).name
    }

    /// Whether the current block already ends in a terminator.
    pub fn is_terminated(&self) -> bool {
        self.func.block(self.current_block()).is_terminated()
    }

    fn push(&mut self, inst: Inst) {
        let block = self.current_block();
        self.func.block_mut(block).insts.push(inst);
    }

    fn binary(
        &mut self,
        make: impl FnOnce(String, Value, Value) -> Inst,
        result: impl Into<String>,
        lhs: Value,
        rhs: Value,
    ) -> Value {
        let result = result.into();
        self.push(make(result.clone(), lhs, rhs));
        Value::Temp(result)
    }

    pub fn fadd(&mut self, result: impl Into<String>, lhs: Value, rhs: Value) -> Value {
        self.binary(|result, lhs, rhs| Inst::FAdd { result, lhs, rhs }, result, lhs, rhs)
    }

    pub fn fsub(&mut self, result: impl Into<String>, lhs: Value, rhs: Value) -> Value {
        self.binary(|result, lhs, rhs| Inst::FSub { result, lhs, rhs }, result, lhs, rhs)
    }

    pub fn fmul(&mut self, result: impl Into<String>, lhs: Value, rhs: Value) -> Value {
        self.binary(|result, lhs, rhs| Inst::FMul { result, lhs, rhs }, result, lhs, rhs)
    }

    pub fn fdiv(&mut self, result: impl Into<String>, lhs: Value, rhs: Value) -> Value {
        self.binary(|result, lhs, rhs| Inst::FDiv { result, lhs, rhs }, result, lhs, rhs)
    }

    pub fn and(&mut self, result: impl Into<String>, lhs: Value, rhs: Value) -> Value {
        self.binary(|result, lhs, rhs| Inst::And { result, lhs, rhs }, result, lhs, rhs)
    }

    pub fn or(&mut self, result: impl Into<String>, lhs: Value, rhs: Value) -> Value {
        self.binary(|result, lhs, rhs| Inst::Or { result, lhs, rhs }, result, lhs, rhs)
    }

    pub fn fcmp(
        &mut self,
        pred: FcmpPred,
        result: impl Into<String>,
        lhs: Value,
        rhs: Value,
    ) -> Value {
        let result = result.into();
        self.push(Inst::FCmp {
            pred,
            result: result.clone(),
            lhs,
            rhs,
        });
        Value::Temp(result)
    }

    pub fn load(&mut self, result: impl Into<String>, src: Value) -> Value {
        let result = result.into();
        self.push(Inst::Load {
            result: result.clone(),
            src,
        });
        Value::Temp(result)
    }

    pub fn store(&mut self, src: Value, dst: Value) {
        self.push(Inst::Store { src, dst });
    }

    pub fn alloca(&mut self, result: impl Into<String>) -> Value {
        let result = result.into();
        self.push(Inst::Alloca {
            result: result.clone(),
        });
        Value::Temp(result)
    }

    /// Emit a call. `result` names the returned value; pass `None` for a
    /// void callee.
    pub fn call(
        &mut self,
        callee: impl Into<String>,
        args: Vec<Value>,
        result: Option<String>,
    ) -> Option<Value> {
        self.push(Inst::Call {
            callee: callee.into(),
            args,
            result: result.clone(),
        });
        result.map(Value::Temp)
    }

    pub fn br(&mut self, target: BlockRef) {
        let target = self.func.block(target).name.clone();
        self.push(Inst::Br { target });
    }

    pub fn cond_br(&mut self, cond: Value, then_block: BlockRef, else_block: BlockRef) {
        let then_block = self.func.block(then_block).name.clone();
        let else_block = self.func.block(else_block).name.clone();
        self.push(Inst::CondBr {
            cond,
            then_block,
            else_block,
        });
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.push(Inst::Ret { value });
    }
}
