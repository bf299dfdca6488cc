//! Abstractions and code to access NAND flash

use std::str::FromStr;

use anyhow::ensure;

use crate::error::Result;

#[cfg(target_os = "linux")]
pub mod mtd;
pub mod sim;

/// Page index within a chip. Pages are numbered consecutively across erase
/// blocks, so a page number is a concatenation (in binary) of a block number
/// and a page-within-block number.
pub type PageIndex = u32;

/// Erase block index within a chip.
pub type BlockIndex = u32;

/// A page index which can never refer to a real page.
pub const PAGE_NONE: PageIndex = u32::MAX;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device.
///
/// Page size and pages-per-block are powers of two, kept as base-2 logarithms
/// so that page/block arithmetic stays shift-and-mask.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub log2_page_size: u8,
    pub log2_ppb: u8,
    pub blocks: u32,
}

impl NandLayout {
    /// Bytes per page
    pub fn page_size(&self) -> usize {
        1 << self.log2_page_size
    }

    /// Pages per erase block
    pub fn pages_per_block(&self) -> u32 {
        1 << self.log2_ppb
    }

    /// Total pages in the chip
    pub fn pages(&self) -> u32 {
        self.blocks << self.log2_ppb
    }

    /// Bytes per erase block
    pub fn block_size(&self) -> usize {
        self.page_size() << self.log2_ppb
    }

    /// The erase block containing a page
    pub fn block_of(&self, page: PageIndex) -> BlockIndex {
        page >> self.log2_ppb
    }

    /// The first page of an erase block
    pub fn first_page(&self, block: BlockIndex) -> PageIndex {
        block << self.log2_ppb
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks: u32 = blocks.parse()?;
        let pages_per_block: u32 = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;

        ensure!(
            pages_per_block.is_power_of_two(),
            "pages per block must be a power of two"
        );
        ensure!(
            bytes_per_page.is_power_of_two(),
            "page size must be a power of two"
        );

        Ok(NandLayout {
            log2_page_size: bytes_per_page.trailing_zeros() as u8,
            log2_ppb: pages_per_block.trailing_zeros() as u8,
            blocks,
        })
    }
}

/// Represents a NAND flash device.
///
/// Implementations report failed program/erase operations as
/// [`Error::BadBlock`](crate::Error::BadBlock) and uncorrectable reads as
/// [`Error::Ecc`](crate::Error::Ecc); the journal's relocation machinery is
/// built on those two signals.
pub trait Nand {
    /// Get the layout of the NAND
    fn layout(&self) -> NandLayout;

    /// Is the given block marked bad? Cheap and side-effect free.
    fn is_bad(&self, block: BlockIndex) -> bool;

    /// Mark the given block bad (or attempt to). There is nothing useful to
    /// do in response to a failure, so none is reported.
    fn mark_bad(&mut self, block: BlockIndex);

    /// Erase a block, making all of its pages writable again
    fn erase(&mut self, block: BlockIndex) -> Result<()>;

    /// Program one full page.
    ///
    /// Pages are programmed sequentially within a block and never
    /// reprogrammed between erases. This is to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn prog(&mut self, page: PageIndex, data: &[u8]) -> Result<()>;

    /// Is the given page unprogrammed?
    ///
    /// May be imprecise (a page programmed with all-0xFF bytes can report
    /// free), but must return true for a truly unprogrammed page.
    fn is_free(&self, page: PageIndex) -> bool;

    /// Read a portion of a page, with ECC applied
    fn read(&self, page: PageIndex, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Read a page from one location and reprogram it at another.
    ///
    /// This may use the chip's internal buffers, but it must preserve ECC
    /// guarantees.
    fn copy(&mut self, src: PageIndex, dst: PageIndex) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_parse() {
        let layout: NandLayout = "113x8x512".parse().unwrap();
        assert_eq!(
            layout,
            NandLayout {
                log2_page_size: 9,
                log2_ppb: 3,
                blocks: 113,
            }
        );
        assert_eq!(layout.page_size(), 512);
        assert_eq!(layout.pages_per_block(), 8);
        assert_eq!(layout.pages(), 904);

        assert!("113x8".parse::<NandLayout>().is_err());
        assert!("113x7x512".parse::<NandLayout>().is_err());
        assert!("113x8x500".parse::<NandLayout>().is_err());
    }

    #[test]
    fn test_layout_arithmetic() {
        let layout: NandLayout = "16x16x256".parse().unwrap();
        assert_eq!(layout.block_of(0), 0);
        assert_eq!(layout.block_of(15), 0);
        assert_eq!(layout.block_of(16), 1);
        assert_eq!(layout.first_page(3), 48);
        assert_eq!(layout.block_size(), 4096);
    }

    #[test]
    fn test_is_erased() {
        assert!([0xFFu8; 16].is_erased());
        let mut page = [0xFFu8; 16];
        page[7] = 0xFE;
        assert!(!page.is_erased());
    }
}
