//! Back-end error taxonomy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("fail to open {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A well-formed construct the back end cannot lower.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A jump or call referee with no matching label.
    #[error("unresolved symbol {0:?}")]
    UnresolvedSymbol(String),

    /// The module defines no `main`, so there is no entry point and no
    /// movabs patch sites.
    #[error("module has no main function")]
    MissingEntry,

    /// A value name the variable analyzer never saw. Indicates an internal
    /// invariant violation in the IR or the analyzer.
    #[error("unknown value {name:?} in block {block:?}")]
    UnknownValue { name: String, block: String },

    #[error("memory map failed: {0}")]
    Map(io::Error),
}
