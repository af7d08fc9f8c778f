//! Error types for the kernel patch finder.
//!
//! Every failure maps onto one of a handful of kinds (see [`ErrorKind`]).
//! Scans that simply run out of instructions report [`Error::Exhausted`],
//! which callers treat as "feature not present" rather than as a fault.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::arm64::Kind;

/// The main error type for image loading and patch finding.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("required load command {cmd:#x} not present")]
    MissingLoadCommand { cmd: u32 },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("malformed image at offset {offset:#x}: {reason}")]
    Malformed { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    // ==================== Lookup Errors ====================
    #[error("symbol not found: {name}")]
    SymbolNotFound { name: String },

    #[error("byte pattern not found: {what}")]
    PatternNotFound { what: String },

    #[error("no reference to {target:#x}")]
    ReferenceNotFound { target: u64 },

    // ==================== Cursor Errors ====================
    #[error("address {addr:#x} not found in any segment")]
    OutOfRange { addr: u64 },

    #[error("scan exhausted the address space at {addr:#x}")]
    Exhausted { addr: u64 },

    // ==================== Decoder Errors ====================
    #[error("{field} not defined for {kind:?} instruction {instr:#010x}")]
    NotApplicable {
        kind: Kind,
        instr: u32,
        field: &'static str,
    },

    #[error("branch at {addr:#x} does not call through a jump stub")]
    NotJumpStub { addr: u64 },
}

/// A specialized Result type for patch finding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A symbol, string or reference is absent
    NotFound,
    /// An address lies outside every segment
    OutOfRange,
    /// A directional scan ran off the address space
    Exhausted,
    /// The image is not a well-formed 64-bit Mach-O
    Malformed,
    /// A field was requested from an instruction that lacks it
    NotApplicable,
    /// A branch target is not an `adrp; ldr; br` stub
    NotJumpStub,
    /// File access failed
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::OutOfRange => "out of range",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Malformed => "malformed",
            ErrorKind::NotApplicable => "not applicable",
            ErrorKind::NotJumpStub => "not a jump stub",
            ErrorKind::Io => "i/o",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FileOpen { .. } | Error::MemoryMap { .. } => ErrorKind::Io,
            Error::InvalidMachoMagic(_)
            | Error::MissingLoadCommand { .. }
            | Error::LoadCommandOverflow { .. }
            | Error::Malformed { .. }
            | Error::BufferTooSmall { .. } => ErrorKind::Malformed,
            Error::SymbolNotFound { .. }
            | Error::PatternNotFound { .. }
            | Error::ReferenceNotFound { .. } => ErrorKind::NotFound,
            Error::OutOfRange { .. } => ErrorKind::OutOfRange,
            Error::Exhausted { .. } => ErrorKind::Exhausted,
            Error::NotApplicable { .. } => ErrorKind::NotApplicable,
            Error::NotJumpStub { .. } => ErrorKind::NotJumpStub,
        }
    }

    /// Returns true if this error means the searched-for feature is absent.
    ///
    /// Such errors are reported per feature and never abort a whole run.
    #[inline]
    pub fn is_feature_absent(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound | ErrorKind::Exhausted | ErrorKind::NotJumpStub
        )
    }

    /// Creates a malformed-image error with a formatted message.
    #[inline]
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Error::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a pattern-not-found error for a byte needle.
    pub fn pattern_not_found(needle: &[u8]) -> Self {
        Error::PatternNotFound {
            what: String::from_utf8_lossy(needle)
                .trim_end_matches('\0')
                .to_string(),
        }
    }

    /// Creates a not-applicable error for a decoder field request.
    #[inline]
    pub fn not_applicable(kind: Kind, instr: u32, field: &'static str) -> Self {
        Error::NotApplicable { kind, instr, field }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidMachoMagic(0xCAFEBABE);
        assert_eq!(err.to_string(), "invalid Mach-O magic: 0xcafebabe");

        let err = Error::Exhausted { addr: 0x1000 };
        assert_eq!(
            err.to_string(),
            "scan exhausted the address space at 0x1000"
        );

        let err = Error::not_applicable(Kind::Ret, 0xD65F03C0, "immediate");
        assert_eq!(
            err.to_string(),
            "immediate not defined for Ret instruction 0xd65f03c0"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::malformed(0, "x").kind(), ErrorKind::Malformed);
        assert_eq!(
            Error::SymbolNotFound { name: "_memcmp".into() }.kind(),
            ErrorKind::NotFound
        );
        assert!(Error::Exhausted { addr: 0 }.is_feature_absent());
        assert!(Error::pattern_not_found(b"csflags\0").is_feature_absent());
        assert!(!Error::InvalidMachoMagic(0).is_feature_absent());
        assert!(!Error::OutOfRange { addr: 0 }.is_feature_absent());
    }

    #[test]
    fn test_pattern_not_found_strips_terminator() {
        let err = Error::pattern_not_found(b"csflags\0");
        assert_eq!(err.to_string(), "byte pattern not found: csflags");
    }
}
