//! Instruction cursor over the virtual-address space of a set of segments.
//!
//! An [`AddressSpace`] is a sorted, optionally executable-only view of the
//! image segments. An [`InsnCursor`] points at one instruction inside it and
//! steps in 4-byte units, hopping across segment boundaries. Running off the
//! first or last segment yields [`Error::Exhausted`]; scans rely on that to
//! terminate.
//!
//! All addresses accepted and returned here are live (slid) addresses.

use super::{classify, rd, rn, rt, subtype, supertype, Kind, LdrSubtype, Supertype, INSN_SIZE};
use crate::error::{Error, Result};
use crate::util::read_u32_le_at;

// =============================================================================
// Segment
// =============================================================================

/// A contiguous virtual-address range backed by bytes of the image buffer.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Segment name (e.g. `__TEXT_EXEC`)
    pub name: &'a str,
    /// File contents of the segment
    pub data: &'a [u8],
    /// Static virtual address of the first byte
    pub base: u64,
    /// Size in bytes (the file size of the segment)
    pub size: u64,
    /// Whether the maximum protection allows execution
    pub executable: bool,
}

impl<'a> Segment<'a> {
    /// Creates a segment covering all of `data`.
    pub fn new(name: &'a str, data: &'a [u8], base: u64, executable: bool) -> Self {
        Self {
            name,
            data,
            base,
            size: data.len() as u64,
            executable,
        }
    }

    /// Returns the first static address past the segment.
    #[inline]
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    /// Returns true if a whole instruction starting at `addr` lies inside.
    #[inline]
    pub fn contains_insn(&self, addr: u64) -> bool {
        addr >= self.base && addr.saturating_add(INSN_SIZE) <= self.end()
    }

    /// Static address of the last whole instruction.
    #[inline]
    fn last_insn(&self) -> u64 {
        self.base + (self.size & !(INSN_SIZE - 1)) - INSN_SIZE
    }
}

// =============================================================================
// Address Space
// =============================================================================

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards higher addresses
    Forward,
    /// Towards lower addresses
    Backward,
}

/// Segments sorted by base address, plus the runtime slide.
#[derive(Debug, Clone)]
pub struct AddressSpace<'a> {
    segments: Vec<Segment<'a>>,
    slide: u64,
}

impl<'a> AddressSpace<'a> {
    /// Builds an address space from segments.
    ///
    /// Segments are sorted by base. With `text_only`, non-executable segments
    /// are dropped. Segments too small to hold an instruction are always dropped.
    pub fn new(mut segments: Vec<Segment<'a>>, slide: u64, text_only: bool) -> Self {
        segments.sort_by_key(|s| s.base);
        segments.retain(|s| (!text_only || s.executable) && s.size >= INSN_SIZE);
        Self { segments, slide }
    }

    /// Returns the runtime slide.
    #[inline]
    pub fn slide(&self) -> u64 {
        self.slide
    }

    /// Returns the segments in address order.
    #[inline]
    pub fn segments(&self) -> &[Segment<'a>] {
        &self.segments
    }

    /// Returns true if no segment is usable.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns a cursor at the base of the first segment.
    pub fn cursor(&self) -> Result<InsnCursor<'_>> {
        let first = self
            .segments
            .first()
            .ok_or(Error::OutOfRange { addr: self.slide })?;
        Ok(InsnCursor::place(self, first.base, 0))
    }

    /// Returns a cursor at `va`, or at the start of the space when `va` is zero.
    pub fn cursor_from(&self, va: u64) -> Result<InsnCursor<'_>> {
        if va == 0 {
            self.cursor()
        } else {
            self.cursor_at(va)
        }
    }

    /// Returns a cursor at the live address `va`.
    ///
    /// Fails with [`Error::OutOfRange`] unless a whole instruction at `va` lies
    /// inside one of the segments.
    pub fn cursor_at(&self, va: u64) -> Result<InsnCursor<'_>> {
        let addr = va.wrapping_sub(self.slide);
        let index = self
            .segments
            .iter()
            .position(|s| s.contains_insn(addr))
            .ok_or(Error::OutOfRange { addr: va })?;
        Ok(InsnCursor::place(self, addr, index))
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// A position on one instruction of an [`AddressSpace`].
///
/// Cursors are `Copy`; copy one to look ahead without losing the original
/// position. The word and its classification are decoded once per position.
#[derive(Debug, Clone, Copy)]
pub struct InsnCursor<'a> {
    space: &'a AddressSpace<'a>,
    addr: u64,
    index: usize,
    word: u32,
    kind: Kind,
}

impl<'a> InsnCursor<'a> {
    fn place(space: &'a AddressSpace<'a>, addr: u64, index: usize) -> Self {
        let mut cursor = Self {
            space,
            addr,
            index,
            word: 0,
            kind: Kind::Unknown,
        };
        cursor.decode();
        cursor
    }

    fn decode(&mut self) {
        let seg = &self.space.segments[self.index];
        // Positions are only ever set to whole instructions inside `seg`.
        self.word = read_u32_le_at(seg.data, (self.addr - seg.base) as usize).unwrap_or_default();
        self.kind = classify(self.word);
    }

    /// Moves to the next instruction, crossing into the next segment if needed.
    ///
    /// On [`Error::Exhausted`] the position is unchanged.
    pub fn advance(&mut self) -> Result<()> {
        let segments = &self.space.segments;
        if self.addr + 2 * INSN_SIZE <= segments[self.index].end() {
            self.addr += INSN_SIZE;
        } else if self.index + 1 < segments.len() {
            self.index += 1;
            self.addr = segments[self.index].base;
        } else {
            return Err(Error::Exhausted { addr: self.pc() });
        }
        self.decode();
        Ok(())
    }

    /// Moves to the previous instruction, crossing into the previous segment if needed.
    ///
    /// On [`Error::Exhausted`] the position is unchanged.
    pub fn retreat(&mut self) -> Result<()> {
        let segments = &self.space.segments;
        if self.addr >= segments[self.index].base + INSN_SIZE {
            self.addr -= INSN_SIZE;
        } else if self.index > 0 {
            self.index -= 1;
            self.addr = segments[self.index].last_insn();
        } else {
            return Err(Error::Exhausted { addr: self.pc() });
        }
        self.decode();
        Ok(())
    }

    /// Moves one instruction in `direction`.
    #[inline]
    pub fn step(&mut self, direction: Direction) -> Result<()> {
        match direction {
            Direction::Forward => self.advance(),
            Direction::Backward => self.retreat(),
        }
    }

    /// Returns a copy moved by `n` instructions (negative moves backward).
    pub fn offset_by(&self, n: i64) -> Result<Self> {
        let mut cursor = *self;
        let direction = if n >= 0 {
            Direction::Forward
        } else {
            Direction::Backward
        };
        for _ in 0..n.unsigned_abs() {
            cursor.step(direction)?;
        }
        Ok(cursor)
    }

    /// Steps in `direction` until `pred` holds, testing only after each step.
    pub fn seek<F>(&mut self, direction: Direction, mut pred: F) -> Result<()>
    where
        F: FnMut(&Self) -> Result<bool>,
    {
        loop {
            self.step(direction)?;
            if pred(self)? {
                return Ok(());
            }
        }
    }

    /// Steps in `direction` until an instruction of `kind` is reached.
    pub fn seek_kind(&mut self, direction: Direction, kind: Kind) -> Result<()> {
        self.seek(direction, |c| Ok(c.kind() == kind))
    }

    /// Returns a cursor at another live address of the same address space.
    pub fn at(&self, va: u64) -> Result<Self> {
        self.space.cursor_at(va)
    }

    /// Returns the address space this cursor walks.
    #[inline]
    pub fn space(&self) -> &'a AddressSpace<'a> {
        self.space
    }

    /// Returns the segment the cursor is in.
    #[inline]
    pub fn segment(&self) -> &'a Segment<'a> {
        &self.space.segments[self.index]
    }

    /// Live address of the current instruction.
    #[inline]
    pub fn pc(&self) -> u64 {
        self.addr.wrapping_add(self.space.slide)
    }

    /// Raw little-endian word at the cursor.
    #[inline]
    pub fn raw_word(&self) -> u32 {
        self.word
    }

    /// Classification of the current instruction.
    #[inline]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// LDR addressing form, if the current instruction is an LDR.
    #[inline]
    pub fn subtype(&self) -> Option<LdrSubtype> {
        subtype(self.word)
    }

    /// Supertype of the current instruction.
    #[inline]
    pub fn supertype(&self) -> Supertype {
        supertype(self.kind)
    }

    /// Immediate operand of the current instruction (see [`super::immediate`]).
    #[inline]
    pub fn immediate(&self) -> Result<i64> {
        super::immediate(self.word, self.kind, self.pc())
    }

    /// Target of the current BranchImmediate instruction.
    #[inline]
    pub fn branch_target(&self) -> Result<u64> {
        super::branch_target(self.word, self.kind, self.pc())
    }

    /// Destination register.
    #[inline]
    pub fn rd(&self) -> Result<u8> {
        rd(self.word, self.kind)
    }

    /// Base register.
    #[inline]
    pub fn rn(&self) -> Result<u8> {
        rn(self.word, self.kind)
    }

    /// Tested or loaded register.
    #[inline]
    pub fn rt(&self) -> Result<u8> {
        rt(self.word, self.kind)
    }
}
