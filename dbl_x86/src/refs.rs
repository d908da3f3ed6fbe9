//! Label and reference tables for jump and call resolution.
//!
//! Two tables share this shape: the per-function jump table, cleared
//! between functions, and the module-wide call table, resolved once after
//! the runtime stubs are appended. Lookup is a linear scan; the tables
//! are small and resolution runs once per pass.

use log::trace;

use crate::error::BackendError;
use crate::image::Area;

/// A named position in the text area.
#[derive(Debug, Clone)]
pub struct Label {
    pub name: String,
    pub offset: usize,
}

/// A pending rel32 patch.
///
/// Resolution writes `int32(target − position + delta)` at `patch_offset`,
/// where `position` is the referencing instruction's first byte and `delta`
/// is minus the instruction length, making the displacement relative to
/// the instruction's end.
#[derive(Debug, Clone)]
pub struct Reference {
    pub position: usize,
    pub patch_offset: usize,
    pub delta: i64,
    pub referee: String,
}

/// How [`RefTable::resolve`] treats a reference with no matching label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvePolicy {
    /// Missing referee is a fatal error (AOT).
    Strict,
    /// Missing referee leaves the zero placeholder in place (JIT, where an
    /// inlined runtime stub may shadow its label).
    ZeroMissing,
}

#[derive(Debug, Default)]
pub struct RefTable {
    labels: Vec<Label>,
    refs: Vec<Reference>,
}

impl RefTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_label(&mut self, name: impl Into<String>, offset: usize) {
        self.labels.push(Label {
            name: name.into(),
            offset,
        });
    }

    pub fn add_reference(
        &mut self,
        position: usize,
        patch_offset: usize,
        delta: i64,
        referee: impl Into<String>,
    ) {
        self.refs.push(Reference {
            position,
            patch_offset,
            delta,
            referee: referee.into(),
        });
    }

    pub fn label_offset(&self, name: &str) -> Option<usize> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.offset)
    }

    /// Patch every reference in `text`.
    pub fn resolve(&self, text: &mut Area, policy: ResolvePolicy) -> Result<(), BackendError> {
        for r in &self.refs {
            let Some(target) = self.label_offset(&r.referee) else {
                match policy {
                    ResolvePolicy::Strict => {
                        return Err(BackendError::UnresolvedSymbol(r.referee.clone()));
                    }
                    ResolvePolicy::ZeroMissing => continue,
                }
            };
            let disp = target as i64 - r.position as i64 + r.delta;
            trace!(
                "patch {} at {:#x}: rel32 {disp} -> {:?}",
                r.position, r.patch_offset, r.referee
            );
            text.patch_i32(r.patch_offset, disp as i32);
        }
        Ok(())
    }

    /// Forget labels and references; the jump table is reused per function.
    pub fn clear(&mut self) {
        self.labels.clear();
        self.refs.clear();
    }
}
