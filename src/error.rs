//! Error kinds shared by the journal and the map.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between the NAND driver and the map.
///
/// `Recover` is a signal rather than a failure: the journal has relocated its
/// head past a bad block and the caller must now drive the assisted recovery
/// procedure ([`Journal::next_recoverable`](crate::journal::Journal::next_recoverable))
/// before retrying. The map handles this internally; users of the bare
/// journal must handle it themselves.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// The chip reported a program/erase failure.
    #[error("bad page/eraseblock")]
    BadBlock,

    /// Uncorrectable ECC error on read.
    #[error("ECC failure")]
    Ecc,

    /// Too many failures in a row; the operation cannot make progress.
    #[error("too many bad blocks")]
    TooBad,

    /// The caller must complete the journal recovery procedure and retry.
    #[error("journal recovery is required")]
    Recover,

    /// Appending would roll the head onto the synchronized tail's block.
    #[error("journal is full")]
    JournalFull,

    /// The requested sector is not in the map.
    #[error("no such sector")]
    NotFound,

    /// The map has reached its sector capacity.
    #[error("sector map is full")]
    MapFull,

    /// On-media map state is inconsistent. Declared for completeness; no
    /// current code path raises it.
    #[error("sector map is corrupted")]
    CorruptMap,
}
