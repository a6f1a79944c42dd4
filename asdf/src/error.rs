//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for this crate
#[derive(Error, Debug)]
pub enum Error {
    /// Node is not present in this `Context`
    #[error("node is not present in this `Context`")]
    BadNode,

    /// `IndexMap` is empty
    #[error("`IndexMap` is empty")]
    EmptyMap,

    /// Unknown opcode {0}
    #[error("unknown opcode {0}")]
    UnknownOpcode(String),

    /// Unknown variable {0}
    #[error("unknown variable {0}")]
    UnknownVariable(String),

    /// A line of a text file could not be parsed
    #[error("parse error on line {line}: {msg}")]
    ParseError {
        /// Line number (1-indexed)
        line: usize,
        /// Description of what went wrong
        msg: String,
    },

    /// Empty file
    #[error("empty file")]
    EmptyFile,

    /// Region has an invalid size or bounds
    #[error("invalid region: {0}")]
    BadRegion(&'static str),

    /// File header is missing or malformed
    #[error("bad file header")]
    BadHeader,

    /// File was written with an unsupported version
    #[error("unsupported file version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    /// Unknown cell tag in an ASDF file
    #[error("unknown cell tag {0:#x}")]
    BadTag(u8),

    /// The operation was cancelled by the caller
    ///
    /// This is not a failure: all partially-built data has been dropped
    #[error("operation was cancelled")]
    Cancelled,

    /// Neighbor consistency could not be restored
    ///
    /// The value is the number of repair passes or meshing attempts made.
    /// This indicates a bug in neighbor resolution, not a user error.
    #[error("neighbor topology is still inconsistent after {0} attempts")]
    Inconsistent(usize),

    /// IO error; see inner code for details
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}
