//! The on-media checkpoint header, with magic verification.
//!
//! Every checkpoint group's meta page begins with this 16-byte header,
//! followed by the cookie and one metadata slot per user page in the group.
//! The layout is bit-exact: all multi-byte fields are little-endian.

use deku::prelude::*;

/// Number of bytes the header occupies at the start of a meta page
pub const HEADER_SIZE: usize = 16;

/// Magic bytes identifying a programmed meta page
pub const CHECKPOINT_MAGIC: [u8; 3] = *b"Dha";

/// The persistent state stamped into every checkpoint.
///
/// `tail` and the bad-block counters are what resume needs to rebuild the
/// queue; `epoch` discriminates successive passes over the chip so that the
/// newest checkpoint wins after a wrap-around.
#[derive(Debug, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct CheckpointHeader {
    magic: [u8; 3],
    pub epoch: u8,
    pub tail: u32,
    pub bb_current: u32,
    pub bb_last: u32,
}

impl CheckpointHeader {
    pub fn new(epoch: u8, tail: u32, bb_current: u32, bb_last: u32) -> Self {
        Self {
            magic: CHECKPOINT_MAGIC,
            epoch,
            tail,
            bb_current,
            bb_last,
        }
    }

    /// Parse a header from the start of a meta page buffer, verifying the
    /// magic. Returns None for anything that isn't a programmed meta page
    /// (erased pages, user data, failed-program junk).
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;

        if header.magic != CHECKPOINT_MAGIC {
            return None;
        }

        Some(header)
    }

    /// Write the header into the first [`HEADER_SIZE`] bytes of a meta page
    /// buffer.
    pub fn encode(self, out: &mut [u8]) {
        let bytes = self.to_bytes().unwrap();
        out[..bytes.len()].copy_from_slice(&bytes);
    }
}
