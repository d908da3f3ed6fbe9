//! Front-end error taxonomy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrontError {
    #[error("fail to open {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Malformed AST text or bytecode stream.
    #[error("broken file: {0}")]
    Corrupted(String),

    /// The bytecode magic did not match.
    #[error("invalid file type")]
    BadMagic,

    /// The bytecode carries a different SoftCPU command-set version.
    #[error("incorrect CPU version: {found}. Expected: {expected}")]
    Version { found: u8, expected: u8 },

    /// A well-formed construct this front end does not lower.
    #[error("not implemented: {0}")]
    NotImplemented(String),
}
