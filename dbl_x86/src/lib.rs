//! dbl_x86: x86-64 back end for the db compiler.
//!
//! Lowers a [`dbl_ir::module::Module`] to machine code in a three-area
//! [`image::X86Image`], then hands it to the ELF writer (AOT) or the JIT
//! loader.

pub mod elf;
pub mod encode;
pub mod error;
pub mod image;
pub mod jit;
pub mod lower;
pub mod refs;
pub mod reg;
pub mod runtime;
pub mod vars;

pub use error::BackendError;
pub use lower::{compile_module, ResolvePolicy};

#[cfg(test)]
mod tests;
