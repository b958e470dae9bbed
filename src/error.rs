//! Error types for vmpatch.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while walking the address space or patching code.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to query memory at 0x{addr:X} (os error {code})")]
    RegionQuery { addr: usize, code: u32 },

    #[error("failed to change protection of 0x{addr:X} (size: {len}, os error {code})")]
    Protect { addr: usize, len: usize, code: u32 },

    #[error("failed to read memory at 0x{addr:X} (size: {size})")]
    MemoryReadFailed { addr: usize, size: usize },

    #[error("failed to write memory at 0x{addr:X} (size: {size})")]
    MemoryWriteFailed { addr: usize, size: usize },

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("{name}: no known address for binary variant '{variant}'")]
    UnknownVariant { name: String, variant: String },

    #[error("{name}: code at 0x{addr:X} does not match signature (expected [{expected}], found [{found}])")]
    SignatureMismatch {
        name: String,
        addr: usize,
        expected: String,
        found: String,
    },

    #[error("empty write at 0x{0:X}")]
    EmptyWrite(usize),

    #[error("write at 0x{addr:X} (size: {len}) overlaps an earlier write in the same transaction")]
    OverlappingWrite { addr: usize, len: usize },

    #[error("branch from 0x{from:X} to 0x{to:X} is out of rel32 range")]
    DisplacementOutOfRange { from: usize, to: usize },

    #[error("{name}: {failed} of {total} writes failed, changes rolled back")]
    InstallFailed {
        name: String,
        failed: usize,
        total: usize,
    },

    #[error("{failed} of {total} restorations failed, affected bytes may remain patched")]
    RestoreIncomplete { failed: usize, total: usize },

    #[error("raw call supports at most 4 arguments, got {0}")]
    TooManyArguments(usize),

    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),
}
