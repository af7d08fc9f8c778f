//! ARM64 instruction encoding and decoding.
//!
//! Only the handful of instruction kinds needed to follow address
//! materialization, branches and import stubs are classified. Everything
//! else decodes as [`Kind::Unknown`].

pub mod cursor;

pub use cursor::{AddressSpace, Direction, InsnCursor, Segment};

use crate::error::{Error, Result};

/// Width of one instruction in bytes.
pub const INSN_SIZE: u64 = 4;

/// `nop`
pub const NOP: u32 = 0xD503_201F;

// =============================================================================
// Classification
// =============================================================================

/// Instruction kind as seen by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Anything not listed below
    Unknown,
    /// ADRP
    Adrp,
    /// ADD (immediate)
    Add,
    /// BL
    Bl,
    /// CBZ
    Cbz,
    /// CBNZ
    Cbnz,
    /// TBNZ
    Tbnz,
    /// RET
    Ret,
    /// BR
    Br,
    /// LDR (immediate, register or literal)
    Ldr,
}

/// Addressing form of an LDR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdrSubtype {
    /// Register offset
    Register,
    /// Unsigned scaled or signed unscaled immediate offset
    Immediate,
    /// PC-relative literal
    Literal,
}

/// Coarse grouping of instruction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supertype {
    /// No PC-relative immediate branch target
    General,
    /// Branches to `pc + imm * 4`
    BranchImmediate,
}

/// Returns true if the instruction is ADRP.
#[inline]
pub fn is_adrp(instr: u32) -> bool {
    (instr & 0x9F00_0000) == 0x9000_0000
}

/// Returns true if the instruction is ADD (immediate).
#[inline]
pub fn is_add_imm(instr: u32) -> bool {
    (instr & 0x1F00_0000) == 0x1100_0000
}

/// Returns true if the instruction is BL (branch with link).
#[inline]
pub fn is_bl(instr: u32) -> bool {
    (instr & 0xFC00_0000) == 0x9400_0000
}

/// Returns true if the instruction is CBZ.
#[inline]
pub fn is_cbz(instr: u32) -> bool {
    (instr & 0x7F00_0000) == 0x3400_0000
}

/// Returns true if the instruction is CBNZ.
#[inline]
pub fn is_cbnz(instr: u32) -> bool {
    (instr & 0x7F00_0000) == 0x3500_0000
}

/// Returns true if the instruction is TBNZ.
#[inline]
pub fn is_tbnz(instr: u32) -> bool {
    (instr & 0x7F00_0000) == 0x3700_0000
}

/// Returns true if the instruction is RET.
#[inline]
pub fn is_ret(instr: u32) -> bool {
    (instr & 0xFFFF_FC1F) == 0xD65F_0000
}

/// Returns true if the instruction is BR (branch to register).
#[inline]
pub fn is_br(instr: u32) -> bool {
    (instr & 0xFFFF_FC1F) == 0xD61F_0000
}

/// LDR with register offset or pre/post-indexed immediate (32 or 64 bit).
#[inline]
fn is_ldr_indexed(instr: u32) -> bool {
    ((instr >> 22) | 0x100) == 0x3E1 && (instr >> 10) & 0x3 != 0
}

/// Returns true if the instruction is LDR (unsigned immediate, 32 or 64 bit).
#[inline]
pub fn is_ldr_unsigned_imm(instr: u32) -> bool {
    ((instr >> 22) | 0x100) == 0x3E5
}

/// Returns true if the instruction is LDR (literal, 32 or 64 bit).
#[inline]
pub fn is_ldr_literal(instr: u32) -> bool {
    (instr & 0xBF00_0000) == 0x1800_0000
}

/// Returns true if the instruction is any classified LDR form.
#[inline]
pub fn is_ldr(instr: u32) -> bool {
    is_ldr_indexed(instr) || is_ldr_unsigned_imm(instr) || is_ldr_literal(instr)
}

/// Classifies a raw instruction word.
pub fn classify(instr: u32) -> Kind {
    if is_adrp(instr) {
        Kind::Adrp
    } else if is_add_imm(instr) {
        Kind::Add
    } else if is_bl(instr) {
        Kind::Bl
    } else if is_cbz(instr) {
        Kind::Cbz
    } else if is_ret(instr) {
        Kind::Ret
    } else if is_tbnz(instr) {
        Kind::Tbnz
    } else if is_br(instr) {
        Kind::Br
    } else if is_ldr(instr) {
        Kind::Ldr
    } else if is_cbnz(instr) {
        Kind::Cbnz
    } else {
        Kind::Unknown
    }
}

/// Returns the addressing form of an LDR, or `None` for other instructions.
pub fn subtype(instr: u32) -> Option<LdrSubtype> {
    if !is_ldr(instr) {
        return None;
    }
    if is_ldr_indexed(instr) && (instr >> 10) & 0x3 == 0b10 {
        Some(LdrSubtype::Register)
    } else if instr >> 31 != 0 {
        Some(LdrSubtype::Immediate)
    } else if is_ldr_literal(instr) {
        Some(LdrSubtype::Literal)
    } else {
        Some(LdrSubtype::Immediate)
    }
}

/// Returns the supertype of an instruction kind.
#[inline]
pub fn supertype(kind: Kind) -> Supertype {
    match kind {
        Kind::Bl | Kind::Cbz | Kind::Cbnz | Kind::Tbnz => Supertype::BranchImmediate,
        _ => Supertype::General,
    }
}

// =============================================================================
// Instruction Decoding
// =============================================================================

/// Sign-extends the low `width` bits of `value` to 64 bits.
///
/// Bit `width - 1` is replicated into every higher bit.
#[inline]
pub const fn sign_extend_64(value: u64, width: u32) -> i64 {
    debug_assert!(width > 0 && width <= 64);
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

/// Decodes the immediate operand of an instruction.
///
/// - ADRP: the absolute page address (`pc` with the low 12 bits cleared plus the offset)
/// - ADD: the unsigned immediate, shifted by 12 when the shift bit is set
/// - BL/CBZ/CBNZ/TBNZ: the signed displacement in instructions (multiply by 4)
/// - LDR (immediate): the byte offset
pub fn immediate(instr: u32, kind: Kind, pc: u64) -> Result<i64> {
    match kind {
        Kind::Adrp => Ok(decode_adrp(instr, pc) as i64),
        Kind::Add => Ok(decode_add_imm(instr) as i64),
        Kind::Bl => Ok(sign_extend_64((instr & 0x03FF_FFFF) as u64, 26)),
        Kind::Cbz | Kind::Cbnz => Ok(sign_extend_64(((instr >> 5) & 0x7_FFFF) as u64, 19)),
        Kind::Tbnz => Ok(sign_extend_64(((instr >> 5) & 0x3FFF) as u64, 14)),
        Kind::Ldr if subtype(instr) == Some(LdrSubtype::Immediate) => {
            if (instr >> 24) & 0x3 != 0 {
                Ok(decode_ldr_offset(instr) as i64)
            } else {
                Ok(sign_extend_64(((instr >> 12) & 0x1FF) as u64, 9))
            }
        }
        _ => Err(Error::not_applicable(kind, instr, "immediate")),
    }
}

/// Decodes an ADRP instruction, returning the target page address.
pub fn decode_adrp(instr: u32, pc: u64) -> u64 {
    let immlo = ((instr >> 29) & 0x3) as u64;
    let immhi = ((instr >> 5) & 0x7_FFFF) as u64;
    let offset = sign_extend_64(((immhi << 2) | immlo) << 12, 33);

    (pc & !0xFFF).wrapping_add(offset as u64)
}

/// Decodes an ADD (immediate) instruction, returning the immediate value.
pub fn decode_add_imm(instr: u32) -> u32 {
    let imm12 = (instr >> 10) & 0xFFF;
    let shift = (instr >> 22) & 0x1;
    if shift == 1 {
        imm12 << 12
    } else {
        imm12
    }
}

/// Decodes an LDR (unsigned immediate) instruction, returning the byte offset.
pub fn decode_ldr_offset(instr: u32) -> u32 {
    let imm12 = (instr >> 10) & 0xFFF;
    let size = (instr >> 30) & 0x3;
    imm12 << size
}

/// Returns the branch target of a BranchImmediate instruction at `pc`.
pub fn branch_target(instr: u32, kind: Kind, pc: u64) -> Result<u64> {
    if supertype(kind) != Supertype::BranchImmediate {
        return Err(Error::not_applicable(kind, instr, "branch target"));
    }
    let words = immediate(instr, kind, pc)?;
    Ok(pc.wrapping_add((words * 4) as u64))
}

/// Gets the destination register of an ADRP/ADD instruction.
pub fn rd(instr: u32, kind: Kind) -> Result<u8> {
    match kind {
        Kind::Adrp | Kind::Add => Ok((instr & 0x1F) as u8),
        _ => Err(Error::not_applicable(kind, instr, "rd")),
    }
}

/// Gets the base register of an ADD/RET/BR/LDR instruction.
pub fn rn(instr: u32, kind: Kind) -> Result<u8> {
    match kind {
        Kind::Add | Kind::Ret | Kind::Br => Ok(((instr >> 5) & 0x1F) as u8),
        Kind::Ldr if subtype(instr) != Some(LdrSubtype::Literal) => {
            Ok(((instr >> 5) & 0x1F) as u8)
        }
        _ => Err(Error::not_applicable(kind, instr, "rn")),
    }
}

/// Gets the tested or loaded register of a CBZ/CBNZ/TBNZ/LDR instruction.
pub fn rt(instr: u32, kind: Kind) -> Result<u8> {
    match kind {
        Kind::Cbz | Kind::Cbnz | Kind::Tbnz | Kind::Ldr => Ok((instr & 0x1F) as u8),
        _ => Err(Error::not_applicable(kind, instr, "rt")),
    }
}

// =============================================================================
// Instruction Encoding
// =============================================================================

/// Encodes an ADRP instruction.
pub fn encode_adrp(rd: u8, pc: u64, target: u64) -> u32 {
    let target_page = target & !0xFFF;
    let pc_page = pc & !0xFFF;
    let delta = target_page.wrapping_sub(pc_page) as i64;
    let imm = (delta >> 12) as u32;

    let immlo = (imm & 0x3) << 29;
    let immhi = ((imm >> 2) & 0x7_FFFF) << 5;

    0x9000_0000 | immlo | immhi | (rd as u32 & 0x1F)
}

/// Encodes a 64-bit ADD (immediate) instruction without shift.
pub fn encode_add_imm(rd: u8, rn: u8, imm: u32) -> u32 {
    let imm12 = (imm & 0xFFF) << 10;
    let sf = 1u32 << 31;

    0x1100_0000 | sf | imm12 | ((rn as u32 & 0x1F) << 5) | (rd as u32 & 0x1F)
}

/// Encodes a 64-bit LDR (unsigned immediate) instruction with a byte offset.
pub fn encode_ldr_unsigned(rt: u8, rn: u8, offset: u64) -> u32 {
    let imm12 = ((offset >> 3) & 0xFFF) as u32;
    let size = 3u32;

    0x3940_0000 | (size << 30) | (1 << 22) | (imm12 << 10) | ((rn as u32 & 0x1F) << 5)
        | (rt as u32 & 0x1F)
}

/// Encodes a BR (branch to register) instruction.
pub fn encode_br(rn: u8) -> u32 {
    0xD61F_0000 | ((rn as u32 & 0x1F) << 5)
}

/// Encodes `ret` (returning through x30).
pub fn encode_ret() -> u32 {
    0xD65F_03C0
}

/// Encodes a BL (branch with link) instruction.
pub fn encode_bl(pc: u64, target: u64) -> u32 {
    let offset = target.wrapping_sub(pc) as i64;
    let imm26 = ((offset >> 2) & 0x03FF_FFFF) as u32;
    0x9400_0000 | imm26
}

fn encode_compare_branch(op: u32, rt: u8, pc: u64, target: u64, wide: bool) -> u32 {
    let offset = target.wrapping_sub(pc) as i64;
    let imm19 = ((offset >> 2) & 0x7_FFFF) as u32;
    let sf = if wide { 1u32 << 31 } else { 0 };
    sf | op | (imm19 << 5) | (rt as u32 & 0x1F)
}

/// Encodes a CBZ instruction.
pub fn encode_cbz(rt: u8, pc: u64, target: u64, wide: bool) -> u32 {
    encode_compare_branch(0x3400_0000, rt, pc, target, wide)
}

/// Encodes a CBNZ instruction.
pub fn encode_cbnz(rt: u8, pc: u64, target: u64, wide: bool) -> u32 {
    encode_compare_branch(0x3500_0000, rt, pc, target, wide)
}

/// Encodes a TBNZ instruction testing bit `bit` of `rt`.
pub fn encode_tbnz(rt: u8, bit: u8, pc: u64, target: u64) -> u32 {
    let offset = target.wrapping_sub(pc) as i64;
    let imm14 = ((offset >> 2) & 0x3FFF) as u32;
    let b5 = ((bit as u32 >> 5) & 1) << 31;
    let b40 = (bit as u32 & 0x1F) << 19;
    0x3700_0000 | b5 | b40 | (imm14 << 5) | (rt as u32 & 0x1F)
}

/// Encodes a MOVZ instruction (`wide` selects the 64-bit form).
pub fn encode_movz(rd: u8, imm16: u16, wide: bool) -> u32 {
    let sf = if wide { 1u32 << 31 } else { 0 };
    0x5280_0000 | sf | ((imm16 as u32) << 5) | (rd as u32 & 0x1F)
}

/// Serializes instruction words as little-endian bytes.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PC: u64 = 0xFFFF_FFF0_0700_8000;

    #[test]
    fn test_is_adrp() {
        assert!(is_adrp(0x90000010)); // ADRP X16, ...
        assert!(!is_adrp(0xD61F0200)); // BR X16
        assert!(!is_adrp(0x10000010)); // ADR X16, ...
    }

    #[test]
    fn test_sign_extend() {
        let v = sign_extend_64(0x40000, 19);
        assert!(v < 0);
        assert_eq!((v as u64) >> 18, u64::MAX >> 18);
        assert_eq!(sign_extend_64(0, 19), 0);
        assert_eq!(sign_extend_64(0x3FFFF, 19), 0x3FFFF);
        assert_eq!(sign_extend_64(0x7FFFF, 19), -1);
    }

    #[test]
    fn test_classify_boundaries() {
        for reg in [0u8, 31] {
            assert_eq!(classify(encode_adrp(reg, PC, PC + 0xFFFF_F000)), Kind::Adrp);
            assert_eq!(classify(encode_adrp(reg, PC, PC - 0x1_0000_0000)), Kind::Adrp);
            assert_eq!(classify(encode_add_imm(reg, reg, 0xFFF)), Kind::Add);
            assert_eq!(classify(encode_add_imm(reg, reg, 0)), Kind::Add);
            assert_eq!(classify(encode_ldr_unsigned(reg, reg, 0x7FF8)), Kind::Ldr);
            assert_eq!(classify(encode_br(reg)), Kind::Br);
            assert_eq!(classify(0xD65F_0000 | ((reg as u32) << 5)), Kind::Ret);

            for wide in [false, true] {
                assert_eq!(classify(encode_cbz(reg, PC, PC + 0xF_FFFC, wide)), Kind::Cbz);
                assert_eq!(classify(encode_cbz(reg, PC, PC - 0x10_0000, wide)), Kind::Cbz);
                assert_eq!(classify(encode_cbnz(reg, PC, PC + 0xF_FFFC, wide)), Kind::Cbnz);
                assert_eq!(classify(encode_cbnz(reg, PC, PC - 0x10_0000, wide)), Kind::Cbnz);
            }
            assert_eq!(classify(encode_tbnz(reg, 63, PC, PC + 0x7FFC)), Kind::Tbnz);
            assert_eq!(classify(encode_tbnz(reg, 0, PC, PC - 0x8000)), Kind::Tbnz);
        }
        assert_eq!(classify(encode_bl(PC, PC + 0x7FF_FFFC)), Kind::Bl);
        assert_eq!(classify(encode_bl(PC, PC - 0x800_0000)), Kind::Bl);
        assert_eq!(classify(encode_ret()), Kind::Ret);
        assert_eq!(classify(NOP), Kind::Unknown);
        assert_eq!(classify(encode_movz(0, 0, false)), Kind::Unknown);
    }

    #[test]
    fn test_branch_immediates_round_trip_extremes() {
        let far = PC + 0x7FF_FFFC;
        let back = PC - 0x800_0000;
        assert_eq!(branch_target(encode_bl(PC, far), Kind::Bl, PC).unwrap(), far);
        assert_eq!(branch_target(encode_bl(PC, back), Kind::Bl, PC).unwrap(), back);

        let cbz = encode_cbz(0, PC, PC - 0x10_0000, false);
        assert_eq!(immediate(cbz, Kind::Cbz, PC).unwrap(), -0x4_0000);

        let tbnz = encode_tbnz(3, 5, PC, PC - 0x8000);
        assert_eq!(immediate(tbnz, Kind::Tbnz, PC).unwrap(), -0x2000);
        assert_eq!(rt(tbnz, Kind::Tbnz).unwrap(), 3);
    }

    #[test]
    fn test_decode_adrp_add() {
        let target = PC + 0x1234;
        let adrp = encode_adrp(0, PC, target);
        assert_eq!(immediate(adrp, Kind::Adrp, PC).unwrap() as u64, PC + 0x1000);

        let behind = encode_adrp(8, PC, PC - 0x5000);
        assert_eq!(decode_adrp(behind, PC + 0x10), PC - 0x5000);

        let add = encode_add_imm(0, 0, 0x234);
        assert_eq!(immediate(add, Kind::Add, 0).unwrap(), 0x234);
        // add x0, x0, #1, lsl #12
        assert_eq!(immediate(0x9100_0400 | (1 << 22), Kind::Add, 0).unwrap(), 0x1000);
        assert_eq!(decode_adrp(adrp, PC) + decode_add_imm(add) as u64, target);
    }

    #[test]
    fn test_ldr_subtypes() {
        let unsigned = encode_ldr_unsigned(16, 16, 0x10);
        assert_eq!(subtype(unsigned), Some(LdrSubtype::Immediate));
        assert_eq!(immediate(unsigned, Kind::Ldr, 0).unwrap(), 0x10);
        assert_eq!(rn(unsigned, Kind::Ldr).unwrap(), 16);

        // ldr x1, [x2, x3]
        let register = 0xF863_6841;
        assert_eq!(classify(register), Kind::Ldr);
        assert_eq!(subtype(register), Some(LdrSubtype::Register));
        assert!(immediate(register, Kind::Ldr, 0).is_err());

        // ldr x1, [x2, #-8]!
        let pre_index = 0xF85F_8C41;
        assert_eq!(classify(pre_index), Kind::Ldr);
        assert_eq!(subtype(pre_index), Some(LdrSubtype::Immediate));
        assert_eq!(immediate(pre_index, Kind::Ldr, 0).unwrap(), -8);

        // ldr x0, #8 (literal)
        let literal = 0x5800_0040;
        assert_eq!(classify(literal), Kind::Ldr);
        assert_eq!(subtype(literal), Some(LdrSubtype::Literal));
        assert!(rn(literal, Kind::Ldr).is_err());

        assert_eq!(subtype(NOP), None);
    }

    #[test]
    fn test_fields_not_applicable() {
        let ret = encode_ret();
        assert!(matches!(
            immediate(ret, Kind::Ret, 0),
            Err(Error::NotApplicable { field: "immediate", .. })
        ));
        assert!(rd(ret, Kind::Ret).is_err());
        assert_eq!(rn(ret, Kind::Ret).unwrap(), 30);
        assert!(rt(encode_br(16), Kind::Br).is_err());
        assert!(immediate(NOP, Kind::Unknown, 0).is_err());
        assert!(branch_target(encode_add_imm(0, 0, 4), Kind::Add, 0).is_err());
    }

    #[test]
    fn test_supertype() {
        assert_eq!(supertype(Kind::Bl), Supertype::BranchImmediate);
        assert_eq!(supertype(Kind::Tbnz), Supertype::BranchImmediate);
        assert_eq!(supertype(Kind::Br), Supertype::General);
        assert_eq!(supertype(Kind::Adrp), Supertype::General);
    }

    #[test]
    fn test_words_to_bytes() {
        assert_eq!(words_to_bytes(&[NOP]), vec![0x1F, 0x20, 0x03, 0xD5]);
    }
}
