//! Mach-O image handling.
//!
//! On-disk structures, constants and the [`KernelImage`] loader that turns a
//! 64-bit ARM64 kernel image into segments the scanners can walk.

mod constants;
mod context;
mod structs;

pub use constants::*;
pub use context::*;
pub use structs::*;
