//! Per-function variable analysis.
//!
//! Runs before any code is emitted. Collection walks every instruction and
//! records each non-global, non-constant name in its block's table; a name
//! seen in a second block joins the multi-block set and gets a home slot in
//! the frame. Location assignment then hands each block's first fifteen
//! entries xmm0-xmm14 and spills the rest: multi-block names to their home
//! slot, block-locals to fresh slots below the multi region.

use dbl_ir::function::Function;
use dbl_ir::value::Value;

use crate::reg::{Xmm, LAST_ALLOCATABLE_XMM};

/// Where a value lives within one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Xmm(Xmm),
    /// Stack slot at `rbp + offset` (offset is negative).
    Mem(i32),
}

#[derive(Debug)]
pub struct VarEntry {
    pub name: String,
    pub usage_count: u32,
    pub loc: Loc,
    /// Whether some instruction in the block writes this name.
    pub defined: bool,
}

/// Variable table for one basic block, parallel to the function's blocks.
#[derive(Debug, Default)]
pub struct BlockVarTable {
    pub entries: Vec<VarEntry>,
}

impl BlockVarTable {
    pub fn find(&self, name: &str) -> Option<&VarEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// A value used in more than one block, with its frame home slot.
#[derive(Debug)]
pub struct MultiVar {
    pub name: String,
    /// rbp-relative home slot offset.
    pub home: i32,
}

/// Result of analyzing one function.
#[derive(Debug)]
pub struct FrameLayout {
    pub tables: Vec<BlockVarTable>,
    pub multi: Vec<MultiVar>,
    /// Total stack frame bytes, 16-byte rounded.
    pub frame_size: i32,
}

impl FrameLayout {
    /// Block-local location of `name` in `block`.
    pub fn loc(&self, block: usize, name: &str) -> Option<Loc> {
        self.tables[block].find(name).map(|e| e.loc)
    }

    /// Home slot of a multi-block name.
    pub fn home(&self, name: &str) -> Option<i32> {
        self.multi.iter().find(|m| m.name == name).map(|m| m.home)
    }

    /// Multi-block names that hold an xmm in `block`: (register, home slot).
    /// These are reloaded from their home at block entry.
    pub fn reloads(&self, block: usize) -> Vec<(Xmm, i32)> {
        self.tables[block]
            .entries
            .iter()
            .filter_map(|e| match e.loc {
                Loc::Xmm(x) => self.home(&e.name).map(|home| (x, home)),
                Loc::Mem(_) => None,
            })
            .collect()
    }

    /// Multi-block names `block` writes while holding them in an xmm:
    /// (home slot, register). These are stored back before the terminator.
    pub fn writebacks(&self, block: usize) -> Vec<(i32, Xmm)> {
        self.tables[block]
            .entries
            .iter()
            .filter_map(|e| match e.loc {
                Loc::Xmm(x) if e.defined => self.home(&e.name).map(|home| (home, x)),
                _ => None,
            })
            .collect()
    }
}

/// Analyze a function: build per-block tables, the multi-block set, and
/// the frame layout.
pub fn analyze(func: &Function) -> FrameLayout {
    let mut tables: Vec<BlockVarTable> = (0..func.blocks.len())
        .map(|_| BlockVarTable::default())
        .collect();
    let mut multi_names: Vec<String> = Vec::new();
    // Block index where each name was first seen.
    let mut first_seen: Vec<(String, usize)> = Vec::new();

    // Parameters belong to the first block and are written by the prologue.
    if !func.blocks.is_empty() {
        for param in &func.params {
            add_name(
                &mut tables,
                &mut multi_names,
                &mut first_seen,
                0,
                param,
                true,
            );
        }
    }

    let mut operands = Vec::new();
    for (bi, block) in func.blocks.iter().enumerate() {
        for inst in &block.insts {
            if let Some(def) = inst.def() {
                add_name(&mut tables, &mut multi_names, &mut first_seen, bi, def, true);
            }
            operands.clear();
            inst.operands(&mut operands);
            for op in &operands {
                if let Value::Temp(name) = op {
                    // A store destination was already counted as a def.
                    if inst.def() == Some(name.as_str()) {
                        continue;
                    }
                    add_name(
                        &mut tables,
                        &mut multi_names,
                        &mut first_seen,
                        bi,
                        name,
                        false,
                    );
                }
            }
        }
    }

    let multi: Vec<MultiVar> = multi_names
        .into_iter()
        .enumerate()
        .map(|(i, name)| MultiVar {
            name,
            home: -8 * (i as i32 + 1),
        })
        .collect();

    // Location assignment, per block.
    let mut max_spills = 0usize;
    for table in &mut tables {
        let mut spills = 0usize;
        for (i, entry) in table.entries.iter_mut().enumerate() {
            if i <= LAST_ALLOCATABLE_XMM as usize {
                entry.loc = Loc::Xmm(Xmm(i as u8));
            } else if let Some(m) = multi.iter().find(|m| m.name == entry.name) {
                entry.loc = Loc::Mem(m.home);
            } else {
                entry.loc = Loc::Mem(-8 * (multi.len() as i32 + spills as i32 + 1));
                spills += 1;
            }
        }
        max_spills = max_spills.max(spills);
    }

    let raw = 8 * (multi.len() + max_spills) as i32;
    let frame_size = (raw + 15) & !15;

    FrameLayout {
        tables,
        multi,
        frame_size,
    }
}

fn add_name(
    tables: &mut [BlockVarTable],
    multi: &mut Vec<String>,
    first_seen: &mut Vec<(String, usize)>,
    block: usize,
    name: &str,
    defined: bool,
) {
    let table = &mut tables[block];
    if let Some(entry) = table.entries.iter_mut().find(|e| e.name == name) {
        entry.usage_count += 1;
        entry.defined |= defined;
    } else {
        table.entries.push(VarEntry {
            name: name.to_string(),
            usage_count: 1,
            // Placeholder until the assignment pass.
            loc: Loc::Mem(0),
            defined,
        });
    }

    match first_seen.iter().find(|(n, _)| n == name) {
        None => first_seen.push((name.to_string(), block)),
        Some((_, first_block)) => {
            if *first_block != block && !multi.iter().any(|m| m == name) {
                multi.push(name.to_string());
            }
        }
    }
}
