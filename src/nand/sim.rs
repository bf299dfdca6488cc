//! A simulated in-memory NAND flash with fault injection, for testing
//! the layers above against bad blocks, program/erase failures and
//! power-loss style garbage.

use std::io::{Read, Write};

use rand::rngs::{SmallRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};

use super::{BlockIndex, Nand, NandLayout, PageIndex};
use crate::error::{Error, Result};

/// Fill a buffer with a deterministic pseudorandom byte sequence.
///
/// The same seed always produces the same bytes, so a page written with
/// `pattern_fill(seed, ..)` can later be verified by regenerating the
/// sequence and comparing.
pub fn pattern_fill(seed: u32, buf: &mut [u8]) {
    let mut rng = SmallRng::seed_from_u64(u64::from(seed));
    rng.fill_bytes(buf);
}

#[derive(Debug, Default, Copy, Clone)]
struct BlockStatus {
    /// Factory or runtime bad-block mark
    bad_mark: bool,

    /// The block fails every program/erase from now on
    failed: bool,

    /// If non-zero, the number of program/erase operations until
    /// permanent failure.
    timebomb: u32,

    /// Index of the next unprogrammed page. 0 means a fully erased
    /// block; pages_per_block means fully programmed.
    next_page: u32,
}

/// A simulated NAND flash device backed by an in-memory buffer.
///
/// The simulator enforces the device contract strictly: programming out of
/// order within a block, or touching a block that has been marked bad, is a
/// usage bug in the layer above and panics. Chip-level failures (factory-bad,
/// failed and timebombed blocks) are reported through the normal error
/// channel instead.
///
/// A freshly constructed chip is in an unknown factory state: every page
/// reads as garbage and every block needs an erase before its first program.
#[derive(Debug, Clone)]
pub struct SimNand {
    layout: NandLayout,
    blocks: Vec<BlockStatus>,
    data: Vec<u8>,
    rng: StdRng,
}

impl SimNand {
    /// Create a simulated chip with the given layout.
    ///
    /// Fault injection draws from a fixed-seed RNG, so a test constructing
    /// the same chip and injecting the same faults gets the same chip.
    pub fn new(layout: NandLayout) -> Self {
        let total = layout.blocks as usize * layout.block_size();

        Self {
            layout,
            blocks: vec![
                BlockStatus {
                    next_page: layout.pages_per_block(),
                    ..Default::default()
                };
                layout.blocks as usize
            ],
            data: vec![0x55; total],
            rng: StdRng::seed_from_u64(0),
        }
    }

    fn block_range(&self, block: BlockIndex) -> std::ops::Range<usize> {
        let begin = block as usize * self.layout.block_size();
        begin..begin + self.layout.block_size()
    }

    fn page_range(&self, page: PageIndex) -> std::ops::Range<usize> {
        let begin = page as usize * self.layout.page_size();
        begin..begin + self.layout.page_size()
    }

    fn status(&self, block: BlockIndex) -> &BlockStatus {
        &self.blocks[block as usize]
    }

    /// Count down an armed timebomb; on zero the block goes bad for good.
    fn timebomb_tick(&mut self, block: BlockIndex) {
        let b = &mut self.blocks[block as usize];

        if b.timebomb > 0 {
            b.timebomb -= 1;
            if b.timebomb == 0 {
                b.failed = true;
            }
        }
    }

    /// Make the given block fail all further program/erase operations
    pub fn set_failed(&mut self, block: BlockIndex) {
        self.blocks[block as usize].failed = true;
    }

    /// Arm a timebomb: the block fails permanently after `ttl` more
    /// program/erase operations.
    pub fn set_timebomb(&mut self, block: BlockIndex, ttl: u32) {
        self.blocks[block as usize].timebomb = ttl;
    }

    /// Create some factory-marked bad blocks at random positions
    pub fn inject_bad(&mut self, count: usize) {
        for _ in 0..count {
            let block = self.rng.gen_range(0..self.layout.blocks);
            let b = &mut self.blocks[block as usize];
            b.bad_mark = true;
            b.failed = true;
        }
    }

    /// Create some unmarked bad blocks at random positions
    pub fn inject_failed(&mut self, count: usize) {
        for _ in 0..count {
            let block = self.rng.gen_range(0..self.layout.blocks);
            self.set_failed(block);
        }
    }

    /// Arm timebombs with random TTLs in `1..=max_ttl` at random positions
    pub fn inject_timebombs(&mut self, count: usize, max_ttl: u32) {
        for _ in 0..count {
            let block = self.rng.gen_range(0..self.layout.blocks);
            let ttl = self.rng.gen_range(1..=max_ttl);
            self.set_timebomb(block, ttl);
        }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        read.read_exact(&mut self.data)?;
        for b in &mut self.blocks {
            *b = BlockStatus {
                next_page: self.layout.pages_per_block(),
                ..Default::default()
            };
        }
        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream
    /// (such as a File). Bad blocks are replaced by a recognizable filler.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let filler = vec![0xBD; self.layout.block_size()];

        for block in 0..self.layout.blocks {
            if self.status(block).bad_mark {
                write.write_all(&filler)?;
            } else {
                write.write_all(&self.data[self.block_range(block)])?;
            }
        }

        Ok(())
    }
}

impl Nand for SimNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn is_bad(&self, block: BlockIndex) -> bool {
        assert!(block < self.layout.blocks, "is_bad: block {block} out of range");
        self.status(block).bad_mark
    }

    fn mark_bad(&mut self, block: BlockIndex) {
        assert!(block < self.layout.blocks, "mark_bad: block {block} out of range");
        self.blocks[block as usize].bad_mark = true;
    }

    fn erase(&mut self, block: BlockIndex) -> Result<()> {
        assert!(block < self.layout.blocks, "erase: block {block} out of range");
        assert!(
            !self.status(block).bad_mark,
            "erase: block {block} is marked bad"
        );

        self.blocks[block as usize].next_page = 0;
        self.timebomb_tick(block);

        let range = self.block_range(block);
        if self.status(block).failed {
            // A failed erase leaves unpredictable junk behind, not clean
            // 0xFF -- resume must not mistake it for programmed data that
            // happens to parse.
            let seed = block.wrapping_mul(0x9E37).wrapping_add(0x79B9);
            pattern_fill(seed, &mut self.data[range]);
            return Err(Error::BadBlock);
        }

        self.data[range].fill(0xFF);
        Ok(())
    }

    fn prog(&mut self, page: PageIndex, data: &[u8]) -> Result<()> {
        let block = self.layout.block_of(page);
        let pno = page & (self.layout.pages_per_block() - 1);

        assert!(block < self.layout.blocks, "prog: block {block} out of range");
        assert!(
            !self.status(block).bad_mark,
            "prog: block {block} is marked bad"
        );
        assert_eq!(data.len(), self.layout.page_size(), "prog: not a full page");
        assert!(
            pno >= self.status(block).next_page,
            "prog: out-of-order program of block {block}, page {pno} (expected {})",
            self.status(block).next_page
        );

        self.blocks[block as usize].next_page = pno + 1;
        self.timebomb_tick(block);

        let range = self.page_range(page);
        if self.status(block).failed {
            let seed = page.wrapping_mul(0x9E37).wrapping_add(0x79B9);
            pattern_fill(seed, &mut self.data[range]);
            return Err(Error::BadBlock);
        }

        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn is_free(&self, page: PageIndex) -> bool {
        let block = self.layout.block_of(page);
        let pno = page & (self.layout.pages_per_block() - 1);

        assert!(block < self.layout.blocks, "is_free: block {block} out of range");
        self.status(block).next_page <= pno
    }

    fn read(&self, page: PageIndex, offset: usize, out: &mut [u8]) -> Result<()> {
        let block = self.layout.block_of(page);

        assert!(block < self.layout.blocks, "read: block {block} out of range");
        assert!(
            offset + out.len() <= self.layout.page_size(),
            "read: range {offset}..{} beyond page end",
            offset + out.len()
        );

        let begin = self.page_range(page).start + offset;
        out.copy_from_slice(&self.data[begin..begin + out.len()]);
        Ok(())
    }

    fn copy(&mut self, src: PageIndex, dst: PageIndex) -> Result<()> {
        let mut buf = vec![0; self.layout.page_size()];

        self.read(src, 0, &mut buf)?;
        self.prog(dst, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_LAYOUT: NandLayout = NandLayout {
        log2_page_size: 8,
        log2_ppb: 4,
        blocks: 8,
    };

    #[test]
    fn test_erase_then_program() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let page = vec![0xA5; TEST_LAYOUT.page_size()];
        let mut out = vec![0; TEST_LAYOUT.page_size()];

        // Factory state: nothing is free, programming requires an erase
        assert!(!nand.is_free(0));

        nand.erase(0).unwrap();
        assert!(nand.is_free(0));

        nand.prog(2, &page).unwrap();
        assert!(!nand.is_free(0));
        assert!(!nand.is_free(2));
        assert!(nand.is_free(3));

        nand.read(2, 0, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    #[should_panic(expected = "out-of-order")]
    fn test_out_of_order_program_panics() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let page = vec![0xA5; TEST_LAYOUT.page_size()];

        nand.erase(0).unwrap();
        nand.prog(3, &page).unwrap();
        nand.prog(1, &page).unwrap();
    }

    #[test]
    fn test_failed_block() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_failed(1);

        assert!(!nand.is_bad(1));
        assert_eq!(nand.erase(1), Err(Error::BadBlock));

        // The failed erase left junk, not clean 0xFF
        let mut out = vec![0; TEST_LAYOUT.page_size()];
        nand.read(TEST_LAYOUT.first_page(1), 0, &mut out).unwrap();
        assert!(out.iter().any(|&x| x != 0xFF));
    }

    #[test]
    fn test_timebomb() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let page = vec![0x11; TEST_LAYOUT.page_size()];

        nand.set_timebomb(0, 3);
        nand.erase(0).unwrap();
        nand.prog(0, &page).unwrap();
        assert_eq!(nand.prog(1, &page), Err(Error::BadBlock));
        assert_eq!(nand.prog(2, &page), Err(Error::BadBlock));
    }

    #[test]
    fn test_mark_bad() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        assert!(!nand.is_bad(5));
        nand.mark_bad(5);
        assert!(nand.is_bad(5));
    }

    #[test]
    fn test_copy() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let mut page = vec![0; TEST_LAYOUT.page_size()];
        pattern_fill(42, &mut page);

        nand.erase(0).unwrap();
        nand.erase(1).unwrap();
        nand.prog(0, &page).unwrap();
        nand.copy(0, TEST_LAYOUT.first_page(1)).unwrap();

        let mut out = vec![0; TEST_LAYOUT.page_size()];
        nand.read(TEST_LAYOUT.first_page(1), 0, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn test_load_save_round_trip() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let mut image = vec![0u8; TEST_LAYOUT.blocks as usize * TEST_LAYOUT.block_size()];
        pattern_fill(7, &mut image);

        nand.load(&mut image.as_slice())?;

        let mut saved = Vec::new();
        nand.save(&mut saved)?;
        assert_eq!(saved, image);

        Ok(())
    }
}
