//! SSA-to-x86-64 lowering.
//!
//! One pass per function: analyze variables, emit the prologue, walk the
//! blocks emitting code per instruction, then patch intra-function jumps.
//! Call displacements are patched once, after the runtime stubs land.
//!
//! Register conventions: arguments and return in xmm0…xmm5/xmm0; the
//! return bit pattern is also left in rax, which is what callers read.
//! r15 and r13 hold the runtime base addresses of the data and rodata
//! areas; r14 stages every gpr↔memory move; xmm15 is the spill scratch.

use dbl_ir::function::Function;
use dbl_ir::instruction::{FcmpPred, Inst};
use dbl_ir::module::Module;
use dbl_ir::value::Value;
use log::debug;

use crate::encode::{self, Cond, CALL_LEN, JCC_LEN, JMP_LEN};
use crate::error::BackendError;
use crate::image::{Area, Flashing, X86Image};
use crate::refs::RefTable;
pub use crate::refs::ResolvePolicy;
use crate::reg::{Gpr, Xmm, XMM_SCRATCH};
use crate::runtime;
use crate::vars::{self, FrameLayout, Loc};

/// Registers preserved across calls, pushed by the prologue in this order.
const CALLEE_SAVED: [Gpr; 5] = [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// Registers never handed out as staging scratch.
const RESERVED_GPRS: [Gpr; 5] = [Gpr::Rsp, Gpr::Rbp, Gpr::R13, Gpr::R14, Gpr::R15];

/// `vcmpsd` immediate predicate encodings.
fn fcmp_imm(pred: FcmpPred) -> u8 {
    match pred {
        FcmpPred::Oeq => 0,  // EQ
        FcmpPred::Olt => 1,  // LT
        FcmpPred::One => 4,  // NE
        FcmpPred::Ogt => 14, // NLE
    }
}

/// Byte offsets of the module's globals within the data and rodata areas.
pub struct GlobalLayout {
    doubles: Vec<(String, i32)>,
    strings: Vec<(String, i32)>,
}

impl GlobalLayout {
    fn double_offset(&self, name: &str) -> Option<i32> {
        self.doubles
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, off)| off)
    }

    fn string_offset(&self, name: &str) -> Option<i32> {
        self.strings
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, off)| off)
    }
}

/// Write the module's globals into the data (doubles) and rodata (strings)
/// areas, recording each name's offset.
fn layout_globals(module: &Module, image: &mut X86Image) -> GlobalLayout {
    let mut doubles = Vec::with_capacity(module.doubles.len());
    for g in &module.doubles {
        doubles.push((g.name.clone(), image.data.len() as i32));
        image.data.write(&g.init.to_le_bytes());
    }
    let mut strings = Vec::with_capacity(module.strings.len());
    for s in &module.strings {
        strings.push((s.name.clone(), image.rodata.len() as i32));
        image.rodata.write(&s.bytes);
    }
    GlobalLayout { doubles, strings }
}

/// Lower a whole module to an image: globals, every function in order, the
/// runtime stubs, then call resolution.
pub fn compile_module(module: &Module, policy: ResolvePolicy) -> Result<X86Image, BackendError> {
    let mut image = X86Image::new();
    let globals = layout_globals(module, &mut image);
    let mut calls = RefTable::new();
    let mut flashing = Flashing::default();

    for func in &module.functions {
        lower_function(func, &mut image, &mut calls, &globals, &mut flashing)?;
    }

    runtime::append(&mut image, &mut calls, &mut flashing)?;
    calls.resolve(&mut image.text, policy)?;

    debug_assert_eq!(flashing.lib_offset + flashing.lib_size, image.text.len());
    image.flashing = flashing;
    Ok(image)
}

fn lower_function(
    func: &Function,
    image: &mut X86Image,
    calls: &mut RefTable,
    globals: &GlobalLayout,
    flashing: &mut Flashing,
) -> Result<(), BackendError> {
    // Declarations contribute no label and no bytes; calls to them resolve
    // against the runtime stubs instead.
    if func.is_declaration() {
        return Ok(());
    }

    calls.add_label(&func.name, image.text.len());
    debug!("lowering {:?} at text+{:#x}", func.name, image.text.len());

    let in_main = func.name == "main";
    if in_main {
        flashing.main_offset = Some(image.text.len());
        flashing.data_patch_site = image.text.len() + 2;
        encode::movabs(&mut image.text, Gpr::R15, 0);
        flashing.rodata_patch_site = image.text.len() + 2;
        encode::movabs(&mut image.text, Gpr::R13, 0);
    }

    let frame = vars::analyze(func);
    let mut lw = FunctionLowerer {
        image,
        jumps: RefTable::new(),
        calls,
        globals,
        frame,
        func,
        block: 0,
        in_main,
    };

    lw.emit_prologue();
    for bi in 0..func.blocks.len() {
        lw.block = bi;
        // The label marks the block's first byte; entering jumps must run
        // the reload sequence.
        lw.jumps.add_label(&func.blocks[bi].name, lw.image.text.len());
        lw.emit_reloads();
        for inst in &func.blocks[bi].insts {
            if inst.is_terminator() {
                lw.emit_writebacks();
            }
            lw.lower_inst(inst)?;
        }
    }
    lw.jumps.resolve(&mut lw.image.text, ResolvePolicy::Strict)?;
    Ok(())
}

/// What a staged operand needs at cleanup time.
enum StagedKind {
    /// Register-resident: nothing to do.
    InPlace,
    /// Spilled block-local or multi-block home: write back to `[rbp+off]`.
    Spill(i32),
    /// Global double: write back to `[r15+off]`.
    GlobalDouble(i32),
    /// String pointer or immediate: nothing to write back.
    Transient,
}

/// Operand staging state for one instruction.
struct Staged {
    locs: Vec<Xmm>,
    kinds: Vec<StagedKind>,
    /// Scratch registers whose previous contents were parked in a gpr.
    saves: Vec<(Gpr, Xmm)>,
}

struct FunctionLowerer<'a> {
    image: &'a mut X86Image,
    jumps: RefTable,
    calls: &'a mut RefTable,
    globals: &'a GlobalLayout,
    frame: FrameLayout,
    func: &'a Function,
    block: usize,
    in_main: bool,
}

impl FunctionLowerer<'_> {
    fn emit_prologue(&mut self) {
        let text = &mut self.image.text;
        encode::push_r(text, Gpr::Rbp);
        encode::mov_rr(text, Gpr::Rbp, Gpr::Rsp);
        encode::sub_ri(text, Gpr::Rsp, self.frame.frame_size);
        for r in CALLEE_SAVED {
            encode::push_r(text, r);
        }

        // Parameters arrive in xmm0…xmm5 and move to their assigned slots.
        // A multi-block parameter is also seeded into its home slot so the
        // first block's reload sees the right value.
        for (i, param) in self.func.params.iter().take(6).enumerate() {
            let arg = Xmm(i as u8);
            match self.frame.loc(0, param) {
                Some(Loc::Xmm(x)) => {
                    encode::vmovq_xmm_xmm(&mut self.image.text, x, arg);
                    if let Some(home) = self.frame.home(param) {
                        encode::vmovq_gpr_xmm(&mut self.image.text, Gpr::Rax, arg);
                        encode::mov_mem_r(&mut self.image.text, Gpr::Rbp, home, Gpr::Rax);
                    }
                }
                Some(Loc::Mem(off)) => {
                    encode::vmovq_gpr_xmm(&mut self.image.text, Gpr::Rax, arg);
                    encode::mov_mem_r(&mut self.image.text, Gpr::Rbp, off, Gpr::Rax);
                }
                None => {}
            }
        }
    }

    /// Reload multi-block values into their block-local registers.
    fn emit_reloads(&mut self) {
        for (x, home) in self.frame.reloads(self.block) {
            encode::mov_r_mem(&mut self.image.text, Gpr::R14, Gpr::Rbp, home);
            encode::vmovq_xmm_gpr(&mut self.image.text, x, Gpr::R14);
        }
    }

    /// Store modified multi-block values back to their home slots.
    fn emit_writebacks(&mut self) {
        for (home, x) in self.frame.writebacks(self.block) {
            encode::vmovq_gpr_xmm(&mut self.image.text, Gpr::R14, x);
            encode::mov_mem_r(&mut self.image.text, Gpr::Rbp, home, Gpr::R14);
        }
    }

    fn unknown(&self, name: &str) -> BackendError {
        BackendError::UnknownValue {
            name: name.to_string(),
            block: self.func.blocks[self.block].name.clone(),
        }
    }

    /// Bring every operand into an xmm register. Register-resident temps
    /// stay put; everything else is loaded into a scratch register through
    /// r14, parking the scratch's previous contents in a free gpr.
    fn prepare(&mut self, values: &[&Value]) -> Result<Staged, BackendError> {
        let mut used_xmm = [false; 16];
        let mut used_gpr = [false; 16];
        for r in RESERVED_GPRS {
            used_gpr[r as usize] = true;
        }
        for v in values {
            if let Value::Temp(name) = v {
                if let Some(Loc::Xmm(x)) = self.frame.loc(self.block, name) {
                    used_xmm[x.0 as usize] = true;
                }
            }
        }

        let mut staged = Staged {
            locs: Vec::with_capacity(values.len()),
            kinds: Vec::with_capacity(values.len()),
            saves: Vec::new(),
        };
        for v in values {
            match v {
                Value::Temp(name) => match self.frame.loc(self.block, name) {
                    Some(Loc::Xmm(x)) => {
                        staged.locs.push(x);
                        staged.kinds.push(StagedKind::InPlace);
                    }
                    Some(Loc::Mem(off)) => {
                        let x = alloc_scratch(
                            &mut self.image.text,
                            &mut used_xmm,
                            &mut used_gpr,
                            &mut staged.saves,
                        );
                        encode::mov_r_mem(&mut self.image.text, Gpr::R14, Gpr::Rbp, off);
                        encode::vmovq_xmm_gpr(&mut self.image.text, x, Gpr::R14);
                        staged.locs.push(x);
                        staged.kinds.push(StagedKind::Spill(off));
                    }
                    None => return Err(self.unknown(name)),
                },
                Value::GlobalDouble(name) => {
                    let off = self
                        .globals
                        .double_offset(name)
                        .ok_or_else(|| self.unknown(name))?;
                    let x = alloc_scratch(
                        &mut self.image.text,
                        &mut used_xmm,
                        &mut used_gpr,
                        &mut staged.saves,
                    );
                    encode::mov_r_mem(&mut self.image.text, Gpr::R14, Gpr::R15, off);
                    encode::vmovq_xmm_gpr(&mut self.image.text, x, Gpr::R14);
                    staged.locs.push(x);
                    staged.kinds.push(StagedKind::GlobalDouble(off));
                }
                Value::GlobalString(name) => {
                    let off = self
                        .globals
                        .string_offset(name)
                        .ok_or_else(|| self.unknown(name))?;
                    let x = alloc_scratch(
                        &mut self.image.text,
                        &mut used_xmm,
                        &mut used_gpr,
                        &mut staged.saves,
                    );
                    encode::lea(&mut self.image.text, Gpr::R14, Gpr::R13, off);
                    encode::vmovq_xmm_gpr(&mut self.image.text, x, Gpr::R14);
                    staged.locs.push(x);
                    staged.kinds.push(StagedKind::Transient);
                }
                Value::Const(c) => {
                    let x = alloc_scratch(
                        &mut self.image.text,
                        &mut used_xmm,
                        &mut used_gpr,
                        &mut staged.saves,
                    );
                    encode::movabs(&mut self.image.text, Gpr::R14, c.to_bits());
                    encode::vmovq_xmm_gpr(&mut self.image.text, x, Gpr::R14);
                    staged.locs.push(x);
                    staged.kinds.push(StagedKind::Transient);
                }
            }
        }
        Ok(staged)
    }

    /// Write staged operands back to memory and restore parked scratch
    /// registers. Walks the operands in reverse so the result operand's
    /// writeback lands last when it shares a slot with a source.
    fn cleanup(&mut self, staged: &Staged) {
        for i in (0..staged.locs.len()).rev() {
            match staged.kinds[i] {
                StagedKind::Spill(off) => {
                    encode::vmovq_gpr_xmm(&mut self.image.text, Gpr::R14, staged.locs[i]);
                    encode::mov_mem_r(&mut self.image.text, Gpr::Rbp, off, Gpr::R14);
                }
                StagedKind::GlobalDouble(off) => {
                    encode::vmovq_gpr_xmm(&mut self.image.text, Gpr::R14, staged.locs[i]);
                    encode::mov_mem_r(&mut self.image.text, Gpr::R15, off, Gpr::R14);
                }
                StagedKind::InPlace | StagedKind::Transient => {}
            }
        }
        for &(g, x) in staged.saves.iter().rev() {
            encode::vmovq_xmm_gpr(&mut self.image.text, x, g);
        }
    }

    fn binary(
        &mut self,
        op: fn(&mut Area, Xmm, Xmm, Xmm),
        result: &str,
        lhs: &Value,
        rhs: &Value,
    ) -> Result<(), BackendError> {
        let dst = Value::Temp(result.to_string());
        let staged = self.prepare(&[&dst, lhs, rhs])?;
        op(
            &mut self.image.text,
            staged.locs[0],
            staged.locs[1],
            staged.locs[2],
        );
        self.cleanup(&staged);
        Ok(())
    }

    /// `vmovq dst, src`, staging either side through memory as needed.
    fn assign(&mut self, dst: &Value, src: &Value) -> Result<(), BackendError> {
        let staged = self.prepare(&[dst, src])?;
        encode::vmovq_xmm_xmm(&mut self.image.text, staged.locs[0], staged.locs[1]);
        self.cleanup(&staged);
        Ok(())
    }

    /// Load a value's bit pattern into rax.
    fn materialize_in_rax(&mut self, v: &Value) -> Result<(), BackendError> {
        self.stage_in_gpr(Gpr::Rax, v)
    }

    fn stage_in_gpr(&mut self, dst: Gpr, v: &Value) -> Result<(), BackendError> {
        match v {
            Value::Const(c) => encode::movabs(&mut self.image.text, dst, c.to_bits()),
            Value::GlobalDouble(name) => {
                let off = self
                    .globals
                    .double_offset(name)
                    .ok_or_else(|| self.unknown(name))?;
                encode::mov_r_mem(&mut self.image.text, dst, Gpr::R15, off);
            }
            Value::GlobalString(name) => {
                let off = self
                    .globals
                    .string_offset(name)
                    .ok_or_else(|| self.unknown(name))?;
                encode::lea(&mut self.image.text, dst, Gpr::R13, off);
            }
            Value::Temp(name) => match self.frame.loc(self.block, name) {
                Some(Loc::Xmm(x)) => encode::vmovq_gpr_xmm(&mut self.image.text, dst, x),
                Some(Loc::Mem(off)) => {
                    encode::mov_r_mem(&mut self.image.text, dst, Gpr::Rbp, off)
                }
                None => return Err(self.unknown(name)),
            },
        }
        Ok(())
    }

    fn lower_call(
        &mut self,
        callee: &str,
        args: &[Value],
        result: Option<&str>,
    ) -> Result<(), BackendError> {
        if args.len() > 6 {
            return Err(BackendError::NotImplemented(format!(
                "call to {callee:?} passes {} arguments; at most 6 are supported",
                args.len()
            )));
        }

        // Save every live block-local register; the callee owns all xmms.
        let live: Vec<Xmm> = self.frame.tables[self.block]
            .entries
            .iter()
            .filter_map(|e| match e.loc {
                Loc::Xmm(x) => Some(x),
                Loc::Mem(_) => None,
            })
            .collect();
        for &x in &live {
            encode::vmovq_gpr_xmm(&mut self.image.text, Gpr::R14, x);
            encode::push_r(&mut self.image.text, Gpr::R14);
        }

        // Marshal: push every argument's bit pattern, then pop into
        // xmm(n-1)…xmm0. Reading all sources before writing any argument
        // register keeps arguments that live in xmm0…xmm5 intact.
        for arg in args {
            self.stage_in_gpr(Gpr::R14, arg)?;
            encode::push_r(&mut self.image.text, Gpr::R14);
        }
        for i in (0..args.len()).rev() {
            encode::pop_r(&mut self.image.text, Gpr::R14);
            encode::vmovq_xmm_gpr(&mut self.image.text, Xmm(i as u8), Gpr::R14);
        }

        let pos = self.image.text.len();
        let patch = encode::call(&mut self.image.text);
        self.calls.add_reference(pos, patch, -CALL_LEN, callee);

        // Restore saved registers through r14; rax carries the return bits
        // and the result is materialized only after the restores.
        for &x in live.iter().rev() {
            encode::pop_r(&mut self.image.text, Gpr::R14);
            encode::vmovq_xmm_gpr(&mut self.image.text, x, Gpr::R14);
        }

        if let Some(name) = result {
            match self.frame.loc(self.block, name) {
                Some(Loc::Xmm(x)) => {
                    encode::vmovq_xmm_gpr(&mut self.image.text, x, Gpr::Rax);
                }
                Some(Loc::Mem(off)) => {
                    encode::mov_mem_r(&mut self.image.text, Gpr::Rbp, off, Gpr::Rax);
                }
                None => return Err(self.unknown(name)),
            }
        }
        Ok(())
    }

    fn lower_inst(&mut self, inst: &Inst) -> Result<(), BackendError> {
        match inst {
            Inst::FAdd { result, lhs, rhs } => self.binary(encode::vaddsd, result, lhs, rhs),
            Inst::FSub { result, lhs, rhs } => self.binary(encode::vsubsd, result, lhs, rhs),
            Inst::FMul { result, lhs, rhs } => self.binary(encode::vmulsd, result, lhs, rhs),
            Inst::FDiv { result, lhs, rhs } => self.binary(encode::vdivsd, result, lhs, rhs),
            Inst::And { result, lhs, rhs } => self.binary(encode::vandpd, result, lhs, rhs),
            Inst::Or { result, lhs, rhs } => self.binary(encode::vorpd, result, lhs, rhs),
            Inst::FCmp {
                pred,
                result,
                lhs,
                rhs,
            } => {
                let dst = Value::Temp(result.clone());
                let staged = self.prepare(&[&dst, lhs, rhs])?;
                encode::vcmpsd(
                    &mut self.image.text,
                    staged.locs[0],
                    staged.locs[1],
                    staged.locs[2],
                    fcmp_imm(*pred),
                );
                self.cleanup(&staged);
                Ok(())
            }
            Inst::Load { result, src } => {
                let dst = Value::Temp(result.clone());
                self.assign(&dst, src)
            }
            Inst::Store { src, dst } => self.assign(dst, src),
            // The variable analyzer already reserved the slot.
            Inst::Alloca { .. } => Ok(()),
            Inst::Call {
                callee,
                args,
                result,
            } => self.lower_call(callee, args, result.as_deref()),
            Inst::Br { target } => {
                let pos = self.image.text.len();
                let patch = encode::jmp(&mut self.image.text);
                self.jumps.add_reference(pos, patch, -JMP_LEN, target);
                Ok(())
            }
            Inst::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                self.materialize_in_rax(cond)?;
                encode::test_rr(&mut self.image.text, Gpr::Rax, Gpr::Rax);
                let pos = self.image.text.len();
                let patch = encode::jcc(&mut self.image.text, Cond::Z);
                self.jumps.add_reference(pos, patch, -JCC_LEN, else_block);
                let pos = self.image.text.len();
                let patch = encode::jmp(&mut self.image.text);
                self.jumps.add_reference(pos, patch, -JMP_LEN, then_block);
                Ok(())
            }
            Inst::Ret { value } => {
                if let Some(v) = value {
                    self.materialize_in_rax(v)?;
                    encode::vmovq_xmm_gpr(&mut self.image.text, Xmm(0), Gpr::Rax);
                }
                let text = &mut self.image.text;
                for r in CALLEE_SAVED.iter().rev() {
                    encode::pop_r(text, *r);
                }
                encode::add_ri(text, Gpr::Rsp, self.frame.frame_size);
                encode::pop_r(text, Gpr::Rbp);
                if self.in_main {
                    encode::xor_edi_edi(text);
                    encode::mov_ri32(text, Gpr::Rax, 0x3C);
                    encode::syscall(text);
                } else {
                    encode::ret(text);
                }
                Ok(())
            }
        }
    }
}

/// Pick a scratch xmm for operand staging. xmm15 is free by reservation;
/// any further scratch parks its previous contents in a spare gpr first.
fn alloc_scratch(
    text: &mut Area,
    used_xmm: &mut [bool; 16],
    used_gpr: &mut [bool; 16],
    saves: &mut Vec<(Gpr, Xmm)>,
) -> Xmm {
    if !used_xmm[XMM_SCRATCH.0 as usize] {
        used_xmm[XMM_SCRATCH.0 as usize] = true;
        return XMM_SCRATCH;
    }
    let xi = (0..16)
        .find(|&i| !used_xmm[i])
        .expect("more staged operands than xmm registers");
    let gi = (0..16)
        .find(|&i| !used_gpr[i])
        .expect("more staged operands than spare gprs");
    used_xmm[xi] = true;
    used_gpr[gi] = true;
    let x = Xmm(xi as u8);
    let g = Gpr::from_index(gi as u8);
    encode::vmovq_gpr_xmm(text, g, x);
    saves.push((g, x));
    x
}
