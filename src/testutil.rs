//! Synthetic kernel images for unit tests.

use zerocopy::IntoBytes;

use crate::arm64::words_to_bytes;
use crate::macho::{MachHeader64, Nlist64, SegmentCommand64, SymtabCommand, VmProt};

/// Static base of the default executable segment.
pub const IMAGE_BASE: u64 = 0xFFFF_FFF0_0700_4000;

/// Bytes at the start of the body reserved for the header and load commands.
pub const HEADER_ROOM: usize = 0x400;

struct SegmentLayout {
    name: String,
    fileoff: u64,
    filesize: u64,
    vmaddr: u64,
    executable: bool,
}

/// Builds a little-endian Mach-O 64 image in memory.
///
/// Unless segments are declared explicitly, the whole body forms a single
/// executable `__TEXT_EXEC` segment at [`IMAGE_BASE`], so `va(off)` maps body
/// offsets to addresses. The symbol table is appended after the body, outside
/// every segment.
pub struct ImageBuilder {
    body: Vec<u8>,
    segments: Vec<SegmentLayout>,
    symbols: Vec<(String, u64)>,
    with_segments: bool,
    with_symtab: bool,
}

impl ImageBuilder {
    /// Creates a builder with a zero-filled body of `size` bytes.
    pub fn new(size: usize) -> Self {
        assert!(size >= HEADER_ROOM);
        Self {
            body: vec![0u8; size],
            segments: Vec::new(),
            symbols: Vec::new(),
            with_segments: true,
            with_symtab: true,
        }
    }

    /// Address of a body offset under the default layout.
    pub fn va(&self, offset: usize) -> u64 {
        IMAGE_BASE + offset as u64
    }

    /// Declares a segment over `[fileoff, fileoff+filesize)`.
    pub fn segment(
        &mut self,
        name: &str,
        fileoff: u64,
        filesize: u64,
        vmaddr: u64,
        executable: bool,
    ) -> &mut Self {
        self.segments.push(SegmentLayout {
            name: name.to_string(),
            fileoff,
            filesize,
            vmaddr,
            executable,
        });
        self
    }

    /// Adds a symbol with a static value.
    pub fn symbol(&mut self, name: &str, value: u64) -> &mut Self {
        self.symbols.push((name.to_string(), value));
        self
    }

    /// Emits no segment commands at all.
    pub fn no_segments(&mut self) -> &mut Self {
        self.with_segments = false;
        self
    }

    /// Emits no LC_SYMTAB.
    pub fn no_symtab(&mut self) -> &mut Self {
        self.with_symtab = false;
        self
    }

    /// Copies raw bytes into the body.
    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8]) -> &mut Self {
        self.body[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Writes instruction words into the body.
    pub fn put_words(&mut self, offset: usize, words: &[u32]) -> &mut Self {
        let bytes = words_to_bytes(words);
        self.put_bytes(offset, &bytes)
    }

    /// Writes a little-endian u64 into the body.
    pub fn put_u64(&mut self, offset: usize, value: u64) -> &mut Self {
        self.put_bytes(offset, &value.to_le_bytes())
    }

    /// Assembles the image.
    pub fn build(&self) -> Vec<u8> {
        let mut segments: Vec<SegmentCommand64> = Vec::new();
        if self.with_segments {
            if self.segments.is_empty() {
                let mut seg = SegmentCommand64::default();
                seg.set_name("__TEXT_EXEC");
                seg.vmaddr = IMAGE_BASE;
                seg.vmsize = self.body.len() as u64;
                seg.filesize = self.body.len() as u64;
                segments.push(seg);
            }
            for layout in &self.segments {
                let prot = if layout.executable {
                    VmProt::READ | VmProt::EXECUTE
                } else {
                    VmProt::READ
                };
                let mut seg = SegmentCommand64 {
                    vmaddr: layout.vmaddr,
                    vmsize: layout.filesize,
                    fileoff: layout.fileoff,
                    filesize: layout.filesize,
                    maxprot: prot.bits(),
                    initprot: prot.bits(),
                    ..Default::default()
                };
                seg.set_name(&layout.name);
                segments.push(seg);
            }
        }

        let mut out = self.body.clone();

        let mut symtab = SymtabCommand::default();
        if self.with_symtab {
            while out.len() % 8 != 0 {
                out.push(0);
            }
            let mut strtab = vec![0u8];
            let mut entries = Vec::new();
            for (name, value) in &self.symbols {
                entries.push(Nlist64 {
                    n_strx: strtab.len() as u32,
                    n_value: *value,
                    ..Default::default()
                });
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
            }

            symtab.symoff = out.len() as u32;
            symtab.nsyms = entries.len() as u32;
            for entry in &entries {
                out.extend_from_slice(entry.as_bytes());
            }
            symtab.stroff = out.len() as u32;
            symtab.strsize = strtab.len() as u32;
            out.extend_from_slice(&strtab);
        }

        let ncmds = segments.len() + usize::from(self.with_symtab);
        let sizeofcmds = segments.len() * SegmentCommand64::SIZE
            + if self.with_symtab { SymtabCommand::SIZE } else { 0 };
        assert!(MachHeader64::SIZE + sizeofcmds <= HEADER_ROOM);

        let header = MachHeader64 {
            ncmds: ncmds as u32,
            sizeofcmds: sizeofcmds as u32,
            ..Default::default()
        };

        let mut commands = Vec::new();
        commands.extend_from_slice(header.as_bytes());
        for seg in &segments {
            commands.extend_from_slice(seg.as_bytes());
        }
        if self.with_symtab {
            commands.extend_from_slice(symtab.as_bytes());
        }
        out[..commands.len()].copy_from_slice(&commands);
        out
    }
}
