//! Patch descriptors.

use std::fmt;

use crate::arm64::{words_to_bytes, NOP};
use crate::util::hex_string;

/// A byte replacement at a live virtual address.
///
/// Patches only describe an edit; applying them is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Live address of the first patched byte
    pub location: u64,
    /// Replacement bytes
    pub bytes: Vec<u8>,
}

impl Patch {
    /// Creates a patch.
    pub fn new(location: u64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            location,
            bytes: bytes.into(),
        }
    }

    /// Creates a patch replacing `count` instructions with NOPs.
    pub fn nops(location: u64, count: usize) -> Self {
        Self::new(location, words_to_bytes(&vec![NOP; count]))
    }

    /// Creates a patch from instruction words.
    pub fn words(location: u64, words: &[u32]) -> Self {
        Self::new(location, words_to_bytes(words))
    }

    /// Number of patched bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the patch replaces nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#018x}  {:>3}  {}",
            self.location,
            self.len(),
            hex_string(&self.bytes)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nops() {
        let patch = Patch::nops(0x1000, 3);
        assert_eq!(patch.len(), 12);
        assert_eq!(&patch.bytes[..4], b"\x1F\x20\x03\xD5");
        assert!(Patch::nops(0x1000, 0).is_empty());
    }

    #[test]
    fn test_display() {
        let patch = Patch::new(0xFFFF_FFF0_0712_3456, [0x01]);
        assert_eq!(patch.to_string(), "0xfffffff007123456    1  01");
    }
}
