//! Feature finders.
//!
//! Each finder is tied to one string in the kernel and one code shape around
//! its use. A kernel built differently makes the walk exhaust instead of
//! landing somewhere wrong.

use tracing::debug;

use super::recipe::{Anchor, Marker, Recipe, Walk};
use super::resolve::jump_stub_target;
use super::{Patch, PatchFinder};
use crate::arm64::{Direction, Kind, NOP};
use crate::error::{Error, Result};

/// `movz w0, #0`
const MOVZ_W0_0: u32 = 0x5280_0000;

/// Replacement for the execve hook's flag test.
const EXECVE_HOOK_GADGET: [u32; 5] = [
    NOP,
    0x1216_7800, // and w0, w0, #0xfffffeff
    NOP,
    MOVZ_W0_0,
    0x5280_01E9, // movz w9, #0xf
];

const DARWIN_KERNEL: &[u8] = b"Darwin Kernel";
const PROC_ENFORCE_DESCRIPTION: &[u8] = b"Enforce MAC policy on process operations";
const MEMCMP: &str = "_memcmp";

/// Bytes between the `proc_enforce` value pointer and the stored pointer to
/// its sysctl description.
///
/// This is a fixed layout assumption about the sysctl descriptor and is the
/// most fragile step of any finder here.
pub const PROC_ENFORCE_BACKSTEP: u64 = 5 * 8;

/// `movz w0, #0; ret`
pub const RET0_GADGET: Marker = Marker::WordThenKind(MOVZ_W0_0, Kind::Ret);

/// The conditional branch guarding the sandbox label-update denial.
pub const SANDBOX_LABEL_UPDATE: Recipe = Recipe {
    anchor: Anchor::LiteralRef(b"process-exec denied while updating label"),
    walk: &[
        Walk::Until {
            direction: Direction::Backward,
            marker: Marker::Kind(Kind::Bl),
            count: 4,
        },
        Walk::Offset(-1),
        Walk::BranchSource { search_up: true },
    ],
};

/// The flag test in AMFI's execve hook.
pub const AMFI_EXECVE_HOOK: Recipe = Recipe {
    anchor: Anchor::LiteralRef(b"AMFI: hook..execve() killing pid %u: %s"),
    walk: &[
        Walk::forward(Marker::Kind(Kind::Ret)),
        Walk::backward(Marker::Kind(Kind::Tbnz)),
    ],
};

/// The `cbz` opening AMFI's code-signing enforcement block.
pub const CS_ENFORCEMENT_AMFI: Recipe = Recipe {
    anchor: Anchor::LiteralRef(b"csflags\0"),
    walk: &[Walk::backward(Marker::Kind(Kind::Cbz))],
};

/// The `memcmp` call validating a code-directory hash.
pub const AMFI_CODE_DIRECTORY_HASH: Recipe = Recipe {
    anchor: Anchor::LiteralRef(b"int _validateCodeDirectoryHashInDaemon"),
    walk: &[Walk::forward(Marker::CallThroughStubTo(MEMCMP))],
};

impl PatchFinder<'_, '_> {
    /// NOPs the branch that jumps into the label-update denial path.
    pub fn sandbox_label_update(&self) -> Result<Patch> {
        let branch = SANDBOX_LABEL_UPDATE.locate(self.image(), self.text())?;
        Ok(Patch::nops(branch.pc(), 1))
    }

    /// Overwrites the hook's `tbnz` with a sequence that clears the flag and returns success.
    pub fn amfi_execve_hook(&self) -> Result<Patch> {
        let tbnz = AMFI_EXECVE_HOOK.locate(self.image(), self.text())?;
        Ok(Patch::words(tbnz.pc(), &EXECVE_HOOK_GADGET))
    }

    /// NOPs everything from the enforcement `cbz` through the next `ret`.
    pub fn cs_enforcement_amfi(&self) -> Result<Patch> {
        let cbz = CS_ENFORCEMENT_AMFI.locate(self.image(), self.text())?;
        let segment = cbz.segment().base;
        let mut ret = cbz;
        ret.seek(Direction::Forward, |c| {
            if c.segment().base != segment {
                return Err(Error::Exhausted { addr: c.pc() });
            }
            Ok(c.kind() == Kind::Ret)
        })?;

        let count = ((ret.pc() - cbz.pc()) / 4 + 1) as usize;
        debug!("Enforcement block {:#x}..={:#x}", cbz.pc(), ret.pc());
        Ok(Patch::nops(cbz.pc(), count))
    }

    /// Sets the flag byte four bytes ahead of the kernel version string.
    pub fn debugger_flag(&self) -> Result<Patch> {
        let version = Anchor::Address(DARWIN_KERNEL).resolve(self.image(), self.text())?;
        Ok(Patch::new(version.wrapping_sub(4), [0x01]))
    }

    /// Points the `memcmp` jump-stub slot at a `movz w0, #0; ret` gadget.
    ///
    /// The gadget is the nearest one at or before `_memcmp`.
    pub fn amfi_code_directory_hash(&self) -> Result<Patch> {
        let image = self.image();
        let call = AMFI_CODE_DIRECTORY_HASH.locate(image, self.text())?;
        let slot = jump_stub_target(&call)?;

        let memcmp = image.find_symbol(MEMCMP)?;
        let ret0 = RET0_GADGET.bind(image)?;
        let mut gadget = self.text().cursor_at(memcmp)?;
        if !ret0.matches(&gadget)? {
            gadget.seek(Direction::Backward, |c| ret0.matches(c))?;
        }

        debug!(
            "memcmp slot {:#x}, return-zero gadget {:#x}",
            slot,
            gadget.pc()
        );
        Ok(Patch::new(slot, gadget.pc().to_le_bytes()))
    }

    /// Sets the `proc_enforce` value found through its sysctl description.
    pub fn proc_enforce(&self) -> Result<Patch> {
        let image = self.image();
        let description = image.search_required(PROC_ENFORCE_DESCRIPTION)?;
        let stored = image
            .search(&description.to_le_bytes())
            .ok_or(Error::ReferenceNotFound {
                target: description,
            })?;

        let value_ptr = stored.wrapping_sub(PROC_ENFORCE_BACKSTEP);
        let value = image.read_u64_at_addr(value_ptr)?;
        debug!("proc_enforce pointer at {:#x} -> {:#x}", value_ptr, value);
        Ok(Patch::new(value, [0x01]))
    }
}
