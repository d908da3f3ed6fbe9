//! Module-level IR container.

use crate::function::Function;

/// A module-level double variable with its initial value.
#[derive(Debug, Clone)]
pub struct GlobalDouble {
    pub name: String,
    pub init: f64,
}

/// A module-level string constant. The bytes include the NUL terminator
/// so the runtime's `printString` can find the end.
#[derive(Debug, Clone)]
pub struct GlobalString {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Top-level IR container: ordered functions plus the two global tables.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub doubles: Vec<GlobalDouble>,
    pub strings: Vec<GlobalString>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            doubles: Vec::new(),
            strings: Vec::new(),
        }
    }

    pub fn add_function(&mut self, func: Function) {
        self.functions.push(func);
    }

    pub fn add_double(&mut self, name: impl Into<String>, init: f64) {
        self.doubles.push(GlobalDouble {
            name: name.into(),
            init,
        });
    }

    /// Add a string constant. A NUL terminator is appended to the stored
    /// bytes.
    pub fn add_string(&mut self, name: impl Into<String>, text: &str) {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.strings.push(GlobalString {
            name: name.into(),
            bytes,
        });
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Per-compilation counters for synthesized value and block names.
///
/// Replaces the process-wide counters the historical implementation kept;
/// the front end resets one per function the same way.
#[derive(Debug, Default)]
pub struct NameGenerator {
    next_value: usize,
    next_block: usize,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next synthesized value name: a bare decimal counter.
    pub fn value(&mut self) -> String {
        let n = self.next_value;
        self.next_value += 1;
        n.to_string()
    }

    /// Next synthesized block name: `stem` plus a counter.
    pub fn block(&mut self, stem: &str) -> String {
        let n = self.next_block;
        self.next_block += 1;
        format!("{stem}{n}")
    }
}
