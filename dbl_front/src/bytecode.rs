//! SoftCPU bytecode reader and lowering.
//!
//! File format: 3-byte magic `"DB\0"`, a version byte, a videoMode byte
//! (ignored), and a little-endian u32 command count, followed by commands
//! of one header byte `{opcode:5, mem:1, reg:1, immed:1}`, an optional
//! i32 immediate, and an optional register byte.
//!
//! The lowering targets the stack-machine core: six registers, a value
//! stack simulated at translation time, fixed-point (×1000) immediates.

use std::fs;
use std::path::Path;

use dbl_ir::builder::Builder;
use dbl_ir::function::Function;
use dbl_ir::module::{Module, NameGenerator};
use dbl_ir::value::Value;
use log::debug;

use crate::error::FrontError;

const MAGIC: &[u8; 3] = b"DB\0";
const VERSION: u8 = 2;
const HEADER_SIZE: usize = 9;

/// SoftCPU register count (`rax` through `rfx`).
const REG_COUNT: usize = 6;

/// Fixed-point scale of immediates.
const IMMED_SCALE: f64 = 1000.0;

/// SoftCPU opcodes this lowering understands.
mod op {
    pub const HLT: u8 = 0;
    pub const PUSH: u8 = 1;
    pub const POP: u8 = 2;
    pub const ADD: u8 = 3;
    pub const SUB: u8 = 4;
    pub const MUL: u8 = 5;
    pub const DIV: u8 = 6;
    pub const OUT: u8 = 7;
    pub const IN: u8 = 8;
    pub const SQRT: u8 = 9;
}

/// One decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cmd {
    pub opcode: u8,
    pub mem: bool,
    pub reg: bool,
    pub immed: bool,
    pub data: i32,
    pub reg_index: u8,
}

pub fn read_bytecode(path: &Path) -> Result<Vec<Cmd>, FrontError> {
    let bytes = fs::read(path).map_err(|source| FrontError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_bytecode(&bytes)
}

pub fn parse_bytecode(bytes: &[u8]) -> Result<Vec<Cmd>, FrontError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrontError::Corrupted("bytecode header too short".into()));
    }
    if &bytes[0..3] != MAGIC {
        return Err(FrontError::BadMagic);
    }
    if bytes[3] != VERSION {
        return Err(FrontError::Version {
            found: bytes[3],
            expected: VERSION,
        });
    }
    // bytes[4] is the videoMode, ignored.
    let count = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    if count == 0 {
        return Err(FrontError::Corrupted("bytecode command count is zero".into()));
    }

    let mut cmds = Vec::with_capacity(count);
    let mut pos = HEADER_SIZE;
    for _ in 0..count {
        let Some(&header) = bytes.get(pos) else {
            return Err(FrontError::Corrupted("truncated command stream".into()));
        };
        pos += 1;
        let mut cmd = Cmd {
            opcode: header & 0x1F,
            mem: header & 0x20 != 0,
            reg: header & 0x40 != 0,
            immed: header & 0x80 != 0,
            data: 0,
            reg_index: 0,
        };
        if cmd.immed {
            let Some(raw) = bytes.get(pos..pos + 4) else {
                return Err(FrontError::Corrupted("truncated immediate".into()));
            };
            cmd.data = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            pos += 4;
        }
        if cmd.reg {
            let Some(&r) = bytes.get(pos) else {
                return Err(FrontError::Corrupted("truncated register byte".into()));
            };
            cmd.reg_index = r;
            pos += 1;
        }
        cmds.push(cmd);
    }
    debug!("read {} bytecode commands", cmds.len());
    Ok(cmds)
}

/// Lower a command stream into a module with a single void `main`.
pub fn build_module(cmds: &[Cmd]) -> Result<Module, FrontError> {
    let mut module = Module::new("bytecode");
    module.add_string("GlobalStr0", "\n");
    let endl = Value::GlobalString("GlobalStr0".into());

    let mut func = Function::new("main", vec![], false);
    let mut names = NameGenerator::new();
    let mut b = Builder::new(&mut func);
    let entry_name = names.block("entry");
    let entry = b.create_block(entry_name);
    b.switch_to_block(entry);

    let regs: Vec<Value> = (0..REG_COUNT).map(|_| b.alloca(names.value())).collect();
    let mut stack: Vec<Value> = Vec::new();
    let mut pop = |stack: &mut Vec<Value>| {
        stack
            .pop()
            .ok_or_else(|| FrontError::Corrupted("stack underflow".into()))
    };

    for cmd in cmds {
        if cmd.mem {
            return Err(FrontError::NotImplemented(
                "bytecode memory operands".into(),
            ));
        }
        if cmd.reg && cmd.reg_index as usize >= REG_COUNT {
            return Err(FrontError::Corrupted(format!(
                "register index {} out of range",
                cmd.reg_index
            )));
        }
        match cmd.opcode {
            op::HLT => {
                b.ret(None);
                break;
            }
            op::PUSH => {
                if cmd.immed && cmd.reg {
                    return Err(FrontError::NotImplemented(
                        "push with register and immediate".into(),
                    ));
                }
                if cmd.immed {
                    stack.push(Value::Const(f64::from(cmd.data) / IMMED_SCALE));
                } else if cmd.reg {
                    let name = names.value();
                    let v = b.load(name, regs[cmd.reg_index as usize].clone());
                    stack.push(v);
                } else {
                    return Err(FrontError::Corrupted("push without an operand".into()));
                }
            }
            op::POP => {
                let v = pop(&mut stack)?;
                if cmd.reg {
                    b.store(v, regs[cmd.reg_index as usize].clone());
                }
            }
            op::ADD | op::SUB | op::MUL | op::DIV => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                let name = names.value();
                let v = match cmd.opcode {
                    op::ADD => b.fadd(name, lhs, rhs),
                    op::SUB => b.fsub(name, lhs, rhs),
                    op::MUL => b.fmul(name, lhs, rhs),
                    _ => b.fdiv(name, lhs, rhs),
                };
                stack.push(v);
            }
            op::SQRT => {
                let v = pop(&mut stack)?;
                let name = names.value();
                b.call("sqrt", vec![v], Some(name.clone()));
                stack.push(Value::Temp(name));
            }
            op::OUT => {
                let v = pop(&mut stack)?;
                b.call("printDouble", vec![v], None);
                b.call("printString", vec![endl.clone()], None);
            }
            op::IN => {
                let name = names.value();
                b.call("scanDouble", vec![], Some(name.clone()));
                stack.push(Value::Temp(name));
            }
            other => {
                return Err(FrontError::NotImplemented(format!(
                    "bytecode opcode {other}"
                )));
            }
        }
    }
    if !b.is_terminated() {
        b.ret(None);
    }

    drop(b);
    module.add_function(func);
    Ok(module)
}
