//! Reference resolution over the executable address space.
//!
//! These helpers turn addresses back into the code that uses them: the
//! `adrp`/`add` pair materializing a literal, the branch jumping to a
//! position, and the pointer slot behind an `adrp; ldr; br` jump stub.

use tracing::debug;

use crate::arm64::{AddressSpace, Direction, InsnCursor, Kind, LdrSubtype, Supertype};
use crate::error::{Error, Result};

/// Finds the first `adrp`/`add` pair that materializes `target`.
///
/// Walks forward from the start of `space`, remembering the destination
/// register and page of the most recent `adrp`. An `add` writing that same
/// register whose immediate lands the page on `target` is a match, and the
/// `adrp`'s address is returned. Running off the end yields `None`.
pub fn literal_reference(space: &AddressSpace<'_>, target: u64) -> Result<Option<u64>> {
    let mut cursor = space.cursor()?;
    let mut adrp: Option<(u8, u64, u64)> = None;

    loop {
        match cursor.kind() {
            Kind::Adrp => {
                adrp = Some((cursor.rd()?, cursor.immediate()? as u64, cursor.pc()));
            }
            Kind::Add => {
                if let Some((rd, page, pc)) = adrp {
                    if cursor.rd()? == rd
                        && page.wrapping_add(cursor.immediate()? as u64) == target
                    {
                        debug!("Literal {:#x} referenced at {:#x}", target, pc);
                        return Ok(Some(pc));
                    }
                }
            }
            _ => {}
        }

        match cursor.advance() {
            Ok(()) => {}
            Err(Error::Exhausted { .. }) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// Finds the immediate branch that jumps to the instruction at `to`.
///
/// Steps away from `to` (towards lower addresses when `search_up`), testing
/// every BranchImmediate instruction on the way. The scan never restarts; it
/// ends at the first match or with [`Error::Exhausted`].
pub fn relative_branch_source(to: &InsnCursor<'_>, search_up: bool) -> Result<u64> {
    let target = to.pc();
    let direction = if search_up {
        Direction::Backward
    } else {
        Direction::Forward
    };

    let mut cursor = *to;
    loop {
        cursor.seek(direction, |c| Ok(c.supertype() == Supertype::BranchImmediate))?;
        if cursor.branch_target()? == target {
            debug!("Branch to {:#x} from {:#x}", target, cursor.pc());
            return Ok(cursor.pc());
        }
    }
}

/// Resolves the pointer slot a `bl` calls through.
///
/// The call must land on `adrp xN, P; ldr xN, [xN, #O]; br xN`. Returns `P+O`.
pub fn jump_stub_target(bl: &InsnCursor<'_>) -> Result<u64> {
    let not_stub = || Error::NotJumpStub { addr: bl.pc() };

    if bl.kind() != Kind::Bl {
        return Err(not_stub());
    }

    let adrp = bl.at(bl.branch_target()?).map_err(|_| not_stub())?;
    let ldr = adrp.offset_by(1).map_err(|_| not_stub())?;
    let br = adrp.offset_by(2).map_err(|_| not_stub())?;

    if adrp.kind() != Kind::Adrp
        || ldr.kind() != Kind::Ldr
        || ldr.subtype() != Some(LdrSubtype::Immediate)
        || br.kind() != Kind::Br
    {
        return Err(not_stub());
    }

    Ok((adrp.immediate()? as u64).wrapping_add(ldr.immediate()? as u64))
}

/// Returns true if `bl` calls through a jump stub.
#[inline]
pub fn is_jump_stub(bl: &InsnCursor<'_>) -> bool {
    jump_stub_target(bl).is_ok()
}
