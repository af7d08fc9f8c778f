//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (big-endian, needs byte swap)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

// =============================================================================
// File Types
// =============================================================================

/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Kernel extension bundle
pub const MH_KEXT_BUNDLE: u32 = 0xB;
/// File set (kernel cache)
pub const MH_FILESET: u32 = 0xC;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// ARM64e (pointer authentication)
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

// =============================================================================
// Load Commands
// =============================================================================

/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xE0;
/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;

/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

// =============================================================================
// VM Protection
// =============================================================================

bitflags! {
    /// Virtual memory protection bits of a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        /// Readable
        const READ = 0x1;
        /// Writable
        const WRITE = 0x2;
        /// Executable
        const EXECUTE = 0x4;
    }
}
