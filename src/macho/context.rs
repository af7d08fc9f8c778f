//! Kernel image context: segment model, symbol lookup and byte scanning.

use std::cell::OnceCell;
use std::fmt;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, info, warn};
use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::arm64::{AddressSpace, Segment};
use crate::error::{Error, Result};
use crate::util::{cstr_at, find_bytes, read_u32_le_at, read_u64_le_at};

// =============================================================================
// Image Buffer
// =============================================================================

/// The raw bytes behind a [`KernelImage`].
///
/// An owned buffer is released when the image is dropped; a borrowed one
/// belongs to the caller (a mapped file, or a live kernel view) and is never
/// released here.
pub enum ImageBuffer<'a> {
    /// Buffer owned by the image
    Owned(Vec<u8>),
    /// Buffer owned by the caller
    Borrowed(&'a [u8]),
}

impl ImageBuffer<'_> {
    /// Returns the buffer contents.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ImageBuffer::Owned(data) => data,
            ImageBuffer::Borrowed(data) => data,
        }
    }

    /// Returns true if the image owns the buffer.
    #[inline]
    pub fn is_owned(&self) -> bool {
        matches!(self, ImageBuffer::Owned(_))
    }
}

impl fmt::Debug for ImageBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_owned() { "Owned" } else { "Borrowed" };
        write!(f, "{}({} bytes)", kind, self.as_bytes().len())
    }
}

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns true if the static address range `[addr, addr+len)` is backed by file data.
    #[inline]
    fn contains_range(&self, addr: u64, len: u64) -> bool {
        addr >= self.command.vmaddr
            && addr.saturating_add(len) <= self.command.vmaddr.saturating_add(self.command.filesize)
    }
}

// =============================================================================
// Kernel Image
// =============================================================================

/// A loaded 64-bit Mach-O kernel image.
///
/// The image is read-only after loading. Addresses accepted and returned by
/// its methods are live addresses, i.e. static addresses plus the slide.
#[derive(Debug)]
pub struct KernelImage<'a> {
    /// The Mach-O header
    pub header: MachHeader64,
    buffer: ImageBuffer<'a>,
    slide: u64,
    segments: Vec<SegmentInfo>,
    /// (cmd, offset) of every load command, bounds-checked at load time
    commands: Vec<(u32, usize)>,
    symtab: OnceCell<SymtabCommand>,
}

impl KernelImage<'static> {
    /// Loads an image from a buffer it takes ownership of.
    pub fn from_vec(data: Vec<u8>, slide: u64) -> Result<Self> {
        Self::load(ImageBuffer::Owned(data), slide)
    }
}

impl<'a> KernelImage<'a> {
    /// Loads an image over a caller-owned buffer (a mapped file or live kernel memory).
    pub fn from_slice(data: &'a [u8], slide: u64) -> Result<Self> {
        Self::load(ImageBuffer::Borrowed(data), slide)
    }

    /// Loads an image from either kind of buffer.
    pub fn load(buffer: ImageBuffer<'a>, slide: u64) -> Result<Self> {
        let data = buffer.as_bytes();

        let magic = read_u32_le_at(data, 0).ok_or(Error::BufferTooSmall {
            needed: 4,
            available: data.len(),
        })?;
        if magic != MH_MAGIC_64 {
            if magic == MH_CIGAM_64 || magic == MH_MAGIC {
                warn!("Unsupported Mach-O flavour (magic {:#x}), need little-endian 64-bit", magic);
            }
            return Err(Error::InvalidMachoMagic(magic));
        }

        let header = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::BufferTooSmall {
                needed: MachHeader64::SIZE,
                available: data.len(),
            })?
            .0;

        if !header.is_arm64() {
            warn!("Image CPU type {:#x} is not ARM64", header.cputype);
        }

        let commands = parse_load_commands(data, &header)?;
        let segments = parse_segments(data, &commands)?;

        if segments.is_empty() {
            return Err(Error::MissingLoadCommand { cmd: LC_SEGMENT_64 });
        }

        info!(
            "Loaded {} {} image: {} segments ({} executable), slide {:#x}",
            header.filetype_name(),
            if header.is_arm64e() { "arm64e" } else { "arm64" },
            segments.len(),
            segments.iter().filter(|s| s.command.is_executable()).count(),
            slide
        );

        Ok(Self {
            header,
            buffer,
            slide,
            segments,
            commands,
            symtab: OnceCell::new(),
        })
    }

    /// Returns the runtime slide.
    #[inline]
    pub fn slide(&self) -> u64 {
        self.slide
    }

    /// Returns the raw image bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    /// Returns the image buffer.
    #[inline]
    pub fn buffer(&self) -> &ImageBuffer<'a> {
        &self.buffer
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Returns byte views of every segment, in load-command order.
    pub fn segments(&self) -> Vec<Segment<'_>> {
        let data = self.as_bytes();
        self.segments
            .iter()
            .map(|info| {
                let start = info.command.fileoff as usize;
                let end = start + info.command.filesize as usize;
                Segment::new(
                    info.name(),
                    &data[start..end],
                    info.command.vmaddr,
                    info.command.is_executable(),
                )
            })
            .collect()
    }

    /// Returns the executable address space used for instruction scans.
    pub fn text_space(&self) -> AddressSpace<'_> {
        AddressSpace::new(self.segments(), self.slide, true)
    }

    /// Returns the address space over every segment.
    pub fn full_space(&self) -> AddressSpace<'_> {
        AddressSpace::new(self.segments(), self.slide, false)
    }

    // =========================================================================
    // Byte Scanner
    // =========================================================================

    /// Finds the first occurrence of `needle`, scanning segments in load order.
    ///
    /// Returns the live address of the match.
    pub fn search(&self, needle: &[u8]) -> Option<u64> {
        self.segments().iter().find_map(|seg| {
            find_bytes(seg.data, needle)
                .map(|pos| (pos as u64).wrapping_add(seg.base).wrapping_add(self.slide))
        })
    }

    /// Like [`search`](Self::search), but absence is an error.
    pub fn search_required(&self, needle: &[u8]) -> Result<u64> {
        let addr = self
            .search(needle)
            .ok_or_else(|| Error::pattern_not_found(needle))?;
        debug!(
            "Found {:?} at {:#x}",
            String::from_utf8_lossy(needle).trim_end_matches('\0'),
            addr
        );
        Ok(addr)
    }

    // =========================================================================
    // Data Access
    // =========================================================================

    /// Reads `len` bytes at a live address from any segment.
    pub fn read_at_addr(&self, va: u64, len: usize) -> Result<&[u8]> {
        let addr = va.wrapping_sub(self.slide);
        let info = self
            .segments
            .iter()
            .find(|s| s.contains_range(addr, len as u64))
            .ok_or(Error::OutOfRange { addr: va })?;
        let start = (info.command.fileoff + (addr - info.command.vmaddr)) as usize;
        Ok(&self.as_bytes()[start..start + len])
    }

    /// Reads the 64-bit little-endian value stored at a live address.
    pub fn read_u64_at_addr(&self, va: u64) -> Result<u64> {
        let bytes = self.read_at_addr(va, 8)?;
        read_u64_le_at(bytes, 0).ok_or(Error::OutOfRange { addr: va })
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    /// Returns the symbol table command, locating and validating it on first use.
    pub fn symtab(&self) -> Result<&SymtabCommand> {
        if let Some(symtab) = self.symtab.get() {
            return Ok(symtab);
        }

        let data = self.as_bytes();
        let offset = self
            .commands
            .iter()
            .find(|(cmd, _)| *cmd == LC_SYMTAB)
            .map(|&(_, offset)| offset)
            .ok_or(Error::MissingLoadCommand { cmd: LC_SYMTAB })?;

        let symtab = SymtabCommand::read_from_prefix(&data[offset..])
            .map_err(|_| Error::malformed(offset, "truncated symtab command"))?
            .0;

        let symbols_end = symtab.symoff as u64 + symtab.nsyms as u64 * Nlist64::SIZE as u64;
        let strings_end = symtab.stroff as u64 + symtab.strsize as u64;
        if symbols_end > data.len() as u64 || strings_end > data.len() as u64 {
            return Err(Error::malformed(offset, "symbol table extends beyond buffer"));
        }

        debug!(
            "Symbol table: {} symbols at {:#x}, {} string bytes at {:#x}",
            symtab.nsyms, symtab.symoff, symtab.strsize, symtab.stroff
        );

        Ok(self.symtab.get_or_init(|| symtab))
    }

    /// Looks up a symbol by exact name, returning its live address.
    ///
    /// Debugging and undefined entries are skipped; among the rest the
    /// first entry with a matching name wins.
    pub fn find_symbol(&self, name: &str) -> Result<u64> {
        let symtab = self.symtab()?;
        let data = self.as_bytes();
        let stroff = symtab.stroff as usize;
        let strtab = &data[stroff..stroff + symtab.strsize as usize];

        for i in 0..symtab.nsyms as usize {
            let offset = symtab.symoff as usize + i * Nlist64::SIZE;
            let Ok((entry, _)) = Nlist64::read_from_prefix(&data[offset..]) else {
                break;
            };
            if entry.is_debug() || entry.is_undefined() {
                continue;
            }
            if cstr_at(strtab, entry.n_strx as usize) == Some(name.as_bytes()) {
                return Ok(entry.n_value.wrapping_add(self.slide));
            }
        }

        Err(Error::SymbolNotFound {
            name: name.to_string(),
        })
    }
}

// =============================================================================
// Load Command Parsing
// =============================================================================

/// Walks the load commands, checking every `cmdsize` against the header and buffer.
fn parse_load_commands(data: &[u8], header: &MachHeader64) -> Result<Vec<(u32, usize)>> {
    let mut commands = Vec::with_capacity(header.ncmds as usize);
    let mut offset = MachHeader64::SIZE;
    let end_offset = MachHeader64::SIZE + header.sizeofcmds as usize;

    if end_offset > data.len() {
        return Err(Error::LoadCommandOverflow { offset });
    }

    for _ in 0..header.ncmds {
        if offset + LoadCommand::SIZE > end_offset {
            return Err(Error::LoadCommandOverflow { offset });
        }

        let lc = LoadCommand::read_from_prefix(&data[offset..])
            .map_err(|_| Error::malformed(offset, "failed to parse load command"))?
            .0;

        let size = lc.cmdsize as usize;
        if size < LoadCommand::SIZE {
            return Err(Error::malformed(
                offset,
                format!("load command size {} too small", size),
            ));
        }
        if offset + size > end_offset {
            return Err(Error::LoadCommandOverflow { offset });
        }

        commands.push((lc.cmd, offset));
        offset += size;
    }

    Ok(commands)
}

/// Reads every LC_SEGMENT_64 and checks its file range.
fn parse_segments(data: &[u8], commands: &[(u32, usize)]) -> Result<Vec<SegmentInfo>> {
    let mut segments = Vec::new();

    for &(cmd, offset) in commands {
        if cmd != LC_SEGMENT_64 {
            continue;
        }

        let seg = SegmentCommand64::read_from_prefix(&data[offset..])
            .map_err(|_| Error::malformed(offset, "failed to parse segment command"))?
            .0;

        if (seg.cmdsize as usize) < SegmentCommand64::SIZE {
            return Err(Error::malformed(offset, "segment command truncated"));
        }

        let file_end = seg.fileoff.checked_add(seg.filesize);
        if file_end.map_or(true, |end| end > data.len() as u64) {
            return Err(Error::malformed(
                offset,
                format!("segment {} extends beyond buffer", seg.name()),
            ));
        }

        debug!(
            "Segment {:<16} {:#018x} - {:#018x} {}",
            seg.name(),
            seg.vmaddr,
            seg.vmaddr.wrapping_add(seg.filesize),
            if seg.is_executable() { "r-x" } else { "r--" }
        );

        segments.push(SegmentInfo { command: seg });
    }

    Ok(segments)
}

// =============================================================================
// File Mapping
// =============================================================================

/// Memory-maps a file read-only.
///
/// The mapping is meant to back a borrowing [`KernelImage`].
pub fn map_file<P: AsRef<Path>>(path: P) -> Result<Mmap> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;

    // SAFETY: the mapping is read-only and only ever viewed as bytes.
    unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
        path: path.to_path_buf(),
        source: e,
    })
}
