//! Declarative patch locators.
//!
//! Every locator starts from a string anchor that sits close to the code of
//! interest and walks the instruction stream to a structural marker. A walk
//! that runs off the address space reports [`Error::Exhausted`], which means
//! the image does not have the expected shape.

use tracing::debug;

use super::resolve::{jump_stub_target, literal_reference, relative_branch_source};
use crate::arm64::{AddressSpace, Direction, InsnCursor, Kind};
use crate::error::{Error, Result};
use crate::macho::KernelImage;

/// Where a walk starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// The `adrp` of the first literal reference to these bytes
    LiteralRef(&'static [u8]),
    /// The address of these bytes themselves
    Address(&'static [u8]),
}

impl Anchor {
    /// Resolves the anchor to a live address.
    pub fn resolve(&self, image: &KernelImage<'_>, text: &AddressSpace<'_>) -> Result<u64> {
        match *self {
            Anchor::Address(needle) => image.search_required(needle),
            Anchor::LiteralRef(needle) => {
                let string = image.search_required(needle)?;
                let reference = literal_reference(text, string)?
                    .ok_or(Error::ReferenceNotFound { target: string })?;
                debug!("Anchor {:#x} referenced from {:#x}", string, reference);
                Ok(reference)
            }
        }
    }
}

/// What a walk stops at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// An instruction of this kind
    Kind(Kind),
    /// This exact instruction word
    Word(u32),
    /// This exact word, directly followed by an instruction of this kind
    WordThenKind(u32, Kind),
    /// A `bl` through a jump stub whose pointer slot holds this symbol's address
    CallThroughStubTo(&'static str),
}

impl Marker {
    /// Binds the marker to an image, resolving any symbol it names.
    pub fn bind<'i>(&self, image: &'i KernelImage<'_>) -> Result<BoundMarker<'i>> {
        let symbol = match self {
            Marker::CallThroughStubTo(name) => Some(image.find_symbol(name)?),
            _ => None,
        };
        Ok(BoundMarker {
            marker: *self,
            image,
            symbol,
        })
    }
}

/// A [`Marker`] ready to be tested against cursor positions.
pub struct BoundMarker<'i> {
    marker: Marker,
    image: &'i KernelImage<'i>,
    symbol: Option<u64>,
}

impl BoundMarker<'_> {
    /// Tests the instruction under `cursor`.
    pub fn matches(&self, cursor: &InsnCursor<'_>) -> Result<bool> {
        match self.marker {
            Marker::Kind(kind) => Ok(cursor.kind() == kind),
            Marker::Word(word) => Ok(cursor.raw_word() == word),
            Marker::WordThenKind(word, kind) => Ok(cursor.raw_word() == word
                && cursor.offset_by(1).is_ok_and(|next| next.kind() == kind)),
            Marker::CallThroughStubTo(_) => {
                if cursor.kind() != Kind::Bl {
                    return Ok(false);
                }
                let slot = match jump_stub_target(cursor) {
                    Ok(slot) => slot,
                    Err(Error::NotJumpStub { .. }) => return Ok(false),
                    Err(e) => return Err(e),
                };
                match self.image.read_u64_at_addr(slot) {
                    Ok(pointer) => Ok(Some(pointer) == self.symbol),
                    Err(Error::OutOfRange { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// One step of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Step until `marker` matches, `count` times; every repeat steps at least once
    Until {
        /// Scan direction
        direction: Direction,
        /// Stop condition
        marker: Marker,
        /// Number of matches to pass
        count: usize,
    },
    /// Move by a fixed number of instructions
    Offset(i64),
    /// Move to the immediate branch targeting the current instruction
    BranchSource {
        /// Search towards lower addresses
        search_up: bool,
    },
}

impl Walk {
    /// Steps forward until `marker` matches once.
    pub const fn forward(marker: Marker) -> Self {
        Walk::Until {
            direction: Direction::Forward,
            marker,
            count: 1,
        }
    }

    /// Steps backward until `marker` matches once.
    pub const fn backward(marker: Marker) -> Self {
        Walk::Until {
            direction: Direction::Backward,
            marker,
            count: 1,
        }
    }

    fn apply<'s>(&self, image: &KernelImage<'_>, cursor: &mut InsnCursor<'s>) -> Result<()> {
        match *self {
            Walk::Until {
                direction,
                marker,
                count,
            } => {
                let bound = marker.bind(image)?;
                for _ in 0..count {
                    cursor.seek(direction, |c| bound.matches(c))?;
                }
            }
            Walk::Offset(n) => *cursor = cursor.offset_by(n)?,
            Walk::BranchSource { search_up } => {
                let source = relative_branch_source(cursor, search_up)?;
                *cursor = cursor.at(source)?;
            }
        }
        Ok(())
    }
}

/// An anchor plus the walk leading from it to the patch site.
#[derive(Debug, Clone, Copy)]
pub struct Recipe {
    /// Starting point
    pub anchor: Anchor,
    /// Steps applied in order
    pub walk: &'static [Walk],
}

impl Recipe {
    /// Runs the recipe, returning a cursor on the located instruction.
    pub fn locate<'s>(
        &self,
        image: &KernelImage<'_>,
        text: &'s AddressSpace<'s>,
    ) -> Result<InsnCursor<'s>> {
        let start = self.anchor.resolve(image, text)?;
        let mut cursor = text.cursor_at(start)?;

        for step in self.walk {
            step.apply(image, &mut cursor)?;
            debug!("{:?} -> {:#x}", step, cursor.pc());
        }

        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::{encode_add_imm, encode_adrp, encode_bl, encode_cbz, encode_ret, NOP};
    use crate::testutil::ImageBuilder;

    const ANCHOR: &[u8] = b"anchor string for the walk";

    fn image() -> (Vec<u8>, ImageBuilder) {
        let mut b = ImageBuilder::new(0x4000);
        let s = b.va(0x3000);
        let words = [
            encode_cbz(0, b.va(0x1000), b.va(0x1010), false), // 0x1000
            encode_bl(b.va(0x1004), b.va(0x2000)),            // 0x1004
            encode_bl(b.va(0x1008), b.va(0x2000)),            // 0x1008
            encode_adrp(0, b.va(0x100C), s),                  // 0x100C
            encode_add_imm(0, 0, (s & 0xFFF) as u32),         // 0x1010
            NOP,                                              // 0x1014
            encode_ret(),                                     // 0x1018
        ];
        b.put_words(0x1000, &words).put_bytes(0x3000, ANCHOR);
        (b.build(), b)
    }

    #[test]
    fn test_anchor_resolve() {
        let (data, b) = image();
        let image = KernelImage::from_vec(data, 0).unwrap();
        let text = image.text_space();

        assert_eq!(
            Anchor::Address(ANCHOR).resolve(&image, &text).unwrap(),
            b.va(0x3000)
        );
        assert_eq!(
            Anchor::LiteralRef(ANCHOR).resolve(&image, &text).unwrap(),
            b.va(0x100C)
        );
        assert!(matches!(
            Anchor::LiteralRef(b"missing").resolve(&image, &text),
            Err(Error::PatternNotFound { .. })
        ));
        // Present but never referenced.
        assert!(matches!(
            Anchor::LiteralRef(b"string for").resolve(&image, &text),
            Err(Error::ReferenceNotFound { .. })
        ));
    }

    #[test]
    fn test_until_counts_repeats() {
        let (data, b) = image();
        let image = KernelImage::from_vec(data, 0).unwrap();
        let text = image.text_space();

        const ONCE: Recipe = Recipe {
            anchor: Anchor::LiteralRef(ANCHOR),
            walk: &[Walk::backward(Marker::Kind(Kind::Bl))],
        };
        assert_eq!(ONCE.locate(&image, &text).unwrap().pc(), b.va(0x1008));

        const TWICE: Recipe = Recipe {
            anchor: Anchor::LiteralRef(ANCHOR),
            walk: &[Walk::Until {
                direction: Direction::Backward,
                marker: Marker::Kind(Kind::Bl),
                count: 2,
            }],
        };
        assert_eq!(TWICE.locate(&image, &text).unwrap().pc(), b.va(0x1004));
    }

    #[test]
    fn test_walk_sequence() {
        let (data, b) = image();
        let image = KernelImage::from_vec(data, 0).unwrap();
        let text = image.text_space();

        // ret, back two to the add, then whatever branches there
        const TO_BRANCH: Recipe = Recipe {
            anchor: Anchor::LiteralRef(ANCHOR),
            walk: &[
                Walk::forward(Marker::Kind(Kind::Ret)),
                Walk::Offset(-2),
                Walk::BranchSource { search_up: true },
            ],
        };
        assert_eq!(TO_BRANCH.locate(&image, &text).unwrap().pc(), b.va(0x1000));

        const TO_WORD: Recipe = Recipe {
            anchor: Anchor::LiteralRef(ANCHOR),
            walk: &[Walk::forward(Marker::WordThenKind(NOP, Kind::Ret))],
        };
        assert_eq!(TO_WORD.locate(&image, &text).unwrap().pc(), b.va(0x1014));
    }

    #[test]
    fn test_walk_exhausts() {
        let (data, _) = image();
        let image = KernelImage::from_vec(data, 0).unwrap();
        let text = image.text_space();

        const TO_TBNZ: Recipe = Recipe {
            anchor: Anchor::LiteralRef(ANCHOR),
            walk: &[Walk::forward(Marker::Kind(Kind::Tbnz))],
        };
        let err = TO_TBNZ.locate(&image, &text).unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }));
        assert!(err.is_feature_absent());
    }

    #[test]
    fn test_call_through_stub_needs_symbol() {
        let (data, _) = image();
        let image = KernelImage::from_vec(data, 0).unwrap();
        let text = image.text_space();

        const TO_MEMCMP: Recipe = Recipe {
            anchor: Anchor::LiteralRef(ANCHOR),
            walk: &[Walk::forward(Marker::CallThroughStubTo("_memcmp"))],
        };
        assert!(matches!(
            TO_MEMCMP.locate(&image, &text),
            Err(Error::SymbolNotFound { .. })
        ));
    }
}
