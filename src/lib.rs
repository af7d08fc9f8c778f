//! xnufind - ARM64 kernel patch offset finder.
//!
//! This library locates byte-level patch sites in a decompressed 64-bit
//! Mach-O ARM64 kernel image. It never applies the patches it finds.
//!
//! # Features
//!
//! - Owned or borrowed (memory-mapped, live) image buffers
//! - Slide-aware addressing throughout
//! - Bidirectional instruction walks across segment boundaries
//! - Literal-reference, branch-source and jump-stub resolution
//! - Declarative anchor-and-walk recipes for each patch
//!
//! # Example
//!
//! ```no_run
//! use xnufind::{find_patches, map_file, FinderOptions, KernelImage};
//!
//! fn main() -> xnufind::Result<()> {
//!     let mmap = map_file("/path/to/kernelcache.decompressed")?;
//!     let image = KernelImage::from_slice(&mmap, 0)?;
//!
//!     let report = find_patches(&image, &FinderOptions::default());
//!     for (feature, patch) in report.found() {
//!         println!("{}: {}", feature, patch);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arm64;
pub mod error;
pub mod finder;
pub mod macho;
pub mod util;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use arm64::{AddressSpace, InsnCursor, Kind, Segment};
pub use error::{Error, ErrorKind, Result};
pub use finder::{find_patches, Feature, FinderOptions, Patch, PatchFinder, PatchReport};
pub use macho::{map_file, ImageBuffer, KernelImage};
