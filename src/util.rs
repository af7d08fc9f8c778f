//! Small helpers for binary data processing.
//!
//! - Unaligned little-endian reads (byteorder)
//! - SIMD-accelerated byte and substring searches (memchr)
//! - Alignment arithmetic

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Fast Unaligned Reads
// =============================================================================

/// Reads a little-endian u64 from a byte slice at the given offset.
///
/// Returns `None` if fewer than 8 bytes are available.
#[inline(always)]
pub fn read_u64_le_at(data: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(8)?;
    data.get(offset..end).map(LittleEndian::read_u64)
}

/// Reads a little-endian u32 from a byte slice at the given offset.
///
/// Returns `None` if fewer than 4 bytes are available.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    data.get(offset..end).map(LittleEndian::read_u32)
}

// =============================================================================
// SIMD-Accelerated Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Finds the first occurrence of `needle` in `haystack`.
///
/// An empty needle never matches.
#[inline]
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    memchr::memmem::find(haystack, needle)
}

/// Returns the null-terminated string starting at `offset`, without the terminator.
#[inline]
pub fn cstr_at(data: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = data.get(offset..)?;
    Some(&tail[..memchr_null(tail)])
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// ARM64 page size used by ADRP.
pub const PAGE_SIZE: u64 = 0x1000;

/// Aligns a value down to the given power-of-two alignment.
#[inline(always)]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Returns the 4 KiB page containing `addr`.
#[inline(always)]
pub const fn page_of(addr: u64) -> u64 {
    align_down(addr, PAGE_SIZE)
}

/// Formats bytes as lowercase hex without separators.
pub fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u64_le_at() {
        let data = [0xFF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_u64_le_at(&data, 1), Some(0x0807060504030201));
        assert_eq!(read_u64_le_at(&data, 2), None);
        assert_eq!(read_u64_le_at(&data, usize::MAX), None);
    }

    #[test]
    fn test_read_u32_le_at() {
        let data = [0x1F, 0x20, 0x03, 0xD5];
        assert_eq!(read_u32_le_at(&data, 0), Some(0xD503201F));
        assert_eq!(read_u32_le_at(&data, 1), None);
    }

    #[test]
    fn test_find_bytes() {
        assert_eq!(find_bytes(b"hello csflags\0", b"csflags\0"), Some(6));
        assert_eq!(find_bytes(b"hello", b"world"), None);
        assert_eq!(find_bytes(b"hello", b""), None);
    }

    #[test]
    fn test_cstr_at() {
        let table = b"\0_memcmp\0_bzero\0";
        assert_eq!(cstr_at(table, 1), Some(&b"_memcmp"[..]));
        assert_eq!(cstr_at(table, 9), Some(&b"_bzero"[..]));
        assert_eq!(cstr_at(table, 0), Some(&b""[..]));
        assert_eq!(cstr_at(table, 100), None);
    }

    #[test]
    fn test_page_of() {
        assert_eq!(page_of(0xFFFF_FFF0_0700_4ABC), 0xFFFF_FFF0_0700_4000);
        assert_eq!(page_of(0x1000), 0x1000);
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0x1F, 0x20, 0x03, 0xD5]), "1f2003d5");
        assert_eq!(hex_string(&[]), "");
    }
}
