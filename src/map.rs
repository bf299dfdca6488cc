//! A persistent sector map over the journal.
//!
//! The map translates logical sector indices into journal pages by storing a
//! radix tree inline in the journal's metadata slots: every written user page
//! *is* a tree node. A node's slot holds its sector index plus one
//! "alt-pointer" per bit of the index, each naming the journal page that
//! roots the sibling subtree for that bit (or `PAGE_NONE`).
//!
//! Because the tree lives in an append-only journal, an update is a
//! copy-on-write rewrite of the path from the root: the new node's slot is
//! rebuilt with the alt-pointers of the existing path, plus the old page at
//! the depth where the paths diverge. Obsolete nodes are reclaimed by a
//! garbage collector that runs interleaved with writes, bounded by the
//! configured ratio.

use log::debug;

use crate::error::{Error, Result};
use crate::journal::{Config, Journal};
use crate::nand::{Nand, PageIndex, PAGE_NONE};

/// Logical sector index exposed to map clients.
pub type SectorIndex = u32;

/// A sector index that can never be mapped; doubles as the on-media marker
/// for "no sector here".
pub const SECTOR_NONE: SectorIndex = u32::MAX;

/// One radix level per bit of a sector index.
const RADIX_DEPTH: usize = 32;

/// Serialized size of a [`SectorMeta`] slot.
pub const META_SIZE: usize = 4 + RADIX_DEPTH * 4;

/// The subtree rooted at `depth` diverges on this bit.
fn d_bit(depth: usize) -> u32 {
    1 << (RADIX_DEPTH - depth - 1)
}

/// A radix node, as stored in a journal metadata slot: the node's sector
/// index followed by 32 little-endian alt-pointers.
mod sector_meta {
    use deku::prelude::*;

    use super::{PAGE_NONE, RADIX_DEPTH};
    use crate::map::{SectorIndex, META_SIZE};

    #[derive(Debug, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
    #[deku(endian = "little")]
    pub(super) struct SectorMeta {
        pub(super) id: u32,
        pub(super) alt: [u32; RADIX_DEPTH],
    }

    impl SectorMeta {
        pub(super) fn blank(id: SectorIndex) -> Self {
            Self {
                id,
                alt: [PAGE_NONE; RADIX_DEPTH],
            }
        }

        pub(super) fn decode(buf: &[u8]) -> Self {
            let (_, meta) = Self::from_bytes((buf, 0)).unwrap();
            meta
        }

        pub(super) fn encode(self) -> [u8; META_SIZE] {
            let mut out = [0; META_SIZE];
            out.copy_from_slice(&self.to_bytes().unwrap());
            out
        }
    }
}
use sector_meta::SectorMeta;

/// The sector map: journal plus radix index plus sector counter.
///
/// Initialize the same chip with the same configuration (in particular the
/// same garbage collection ratio) in every session.
pub struct Map<'n, N: Nand> {
    journal: Journal<'n, N>,
    gc_ratio: u8,
    count: u32,
}

impl<'n, N: Nand> Map<'n, N> {
    /// Set up a map over a borrowed NAND device. Performs no NAND
    /// operations; call [`Map::resume`] to pick up existing state.
    pub fn new(nand: &'n mut N, config: Config) -> Self {
        // The radix layout fixes the slot and cookie sizes
        let config = Config {
            meta_size: META_SIZE,
            cookie_size: 4,
            ..config
        };

        Self {
            journal: Journal::new(nand, config),
            gc_ratio: config.gc_ratio.max(1),
            count: 0,
        }
    }

    /// Recover stored state from the chip, if possible. On failure an empty
    /// map is initialized and the error returned.
    pub fn resume(&mut self) -> Result<()> {
        if let Err(e) = self.journal.resume() {
            self.count = 0;
            return Err(e);
        }

        self.count = u32::from_le_bytes(self.journal.cookie().try_into().unwrap());
        debug!("map resumed: {} sectors", self.count);
        Ok(())
    }

    /// Delete all sectors.
    pub fn clear(&mut self) {
        if self.count > 0 {
            self.count = 0;
            self.journal.clear();
        }
    }

    /// The maximum number of sectors the map can hold: the journal's
    /// capacity less the garbage collector's reserve and a safety margin
    /// for bad-block relocation.
    pub fn capacity(&self) -> u32 {
        let cap = self.journal.capacity();
        let reserve = cap / (u32::from(self.gc_ratio) + 1);
        let safety_margin = (self.journal.config().max_retries as u32) << self.journal.layout().log2_ppb;

        if reserve + safety_margin >= cap {
            return 0;
        }

        cap - reserve - safety_margin
    }

    /// The current number of mapped sectors
    pub fn size(&self) -> u32 {
        self.count
    }

    /// Find the journal page holding the current version of a sector.
    /// Fails with `NotFound` if the sector isn't mapped.
    pub fn find(&self, sector: SectorIndex) -> Result<PageIndex> {
        self.trace_path(sector, None)
    }

    /// Read a sector into `data`. An unmapped sector reads as a blank
    /// (all-0xFF) page.
    pub fn read(&self, sector: SectorIndex, data: &mut [u8]) -> Result<()> {
        match self.find(sector) {
            Ok(page) => self.journal.nand().read(page, 0, data),
            Err(Error::NotFound) => {
                data.fill(0xFF);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Write one full page of data to a sector, creating it if necessary.
    pub fn write(&mut self, sector: SectorIndex, data: &[u8]) -> Result<()> {
        if sector == SECTOR_NONE {
            return Err(Error::NotFound);
        }

        loop {
            let old_count = self.count;
            let mut meta = SectorMeta::blank(sector);

            self.prepare_write(sector, &mut meta)?;

            match self.journal.enqueue(Some(data), Some(&meta.encode())) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.count = old_count;
                    self.try_recover(e)?;
                }
            }
        }
    }

    /// Map any existing flash page as the new content of a sector.
    pub fn copy_page(&mut self, src: PageIndex, dst: SectorIndex) -> Result<()> {
        if dst == SECTOR_NONE {
            return Err(Error::NotFound);
        }

        loop {
            let old_count = self.count;
            let mut meta = SectorMeta::blank(dst);

            self.prepare_write(dst, &mut meta)?;

            match self.journal.copy(src, Some(&meta.encode())) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.count = old_count;
                    self.try_recover(e)?;
                }
            }
        }
    }

    /// Copy one sector onto another. If the source is unmapped, the
    /// destination is trimmed.
    pub fn copy_sector(&mut self, src: SectorIndex, dst: SectorIndex) -> Result<()> {
        match self.find(src) {
            Ok(page) => self.copy_page(page, dst),
            Err(Error::NotFound) => self.trim(dst),
            Err(e) => Err(e),
        }
    }

    /// Delete a sector. Not required, but a useful hint when the sector's
    /// data no longer needs to be kept. Deleting an unmapped sector is a
    /// no-op.
    pub fn trim(&mut self, sector: SectorIndex) -> Result<()> {
        loop {
            self.auto_gc()?;

            match self.try_delete(sector) {
                Ok(()) => return Ok(()),
                Err(e) => self.try_recover(e)?,
            }
        }
    }

    /// Synchronize the map: once this returns successfully, all changes to
    /// date are durable. There is no guarantee for unsynchronized changes.
    pub fn sync(&mut self) -> Result<()> {
        while !self.journal.is_clean() {
            let page = self.journal.peek();

            let res = if page == PAGE_NONE {
                self.pad_queue()
            } else {
                let res = self.raw_gc(page);
                self.journal.dequeue();
                res
            };

            if let Err(e) = res {
                self.try_recover(e)?;
            }
        }

        Ok(())
    }

    /// Run one garbage collection step: relocate or discard the page at the
    /// journal's tail. Collection also happens automatically, interleaved
    /// with writes; this is for callers with idle time to spend.
    pub fn gc(&mut self) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }

        loop {
            let tail = self.journal.peek();
            if tail == PAGE_NONE {
                return Ok(());
            }

            match self.raw_gc(tail) {
                Ok(()) => {
                    self.journal.dequeue();
                    return Ok(());
                }
                Err(e) => self.try_recover(e)?,
            }
        }
    }

    /// The journal this map runs over, for inspection
    pub fn journal(&self) -> &Journal<'n, N> {
        &self.journal
    }

    /// Shared access to the underlying NAND device
    pub fn nand(&self) -> &N {
        self.journal.nand()
    }

    /// Trace the path from the root towards `target`, copying the path's
    /// alt-pointers into `new_meta` (so that enqueueing `new_meta` grafts a
    /// new version of the sector into the tree). Returns the page currently
    /// holding `target`, or `NotFound` with the remaining alt-pointers
    /// cleared.
    fn trace_path(
        &self,
        target: SectorIndex,
        mut new_meta: Option<&mut SectorMeta>,
    ) -> Result<PageIndex> {
        let mut meta_buf = [0u8; META_SIZE];
        let mut depth = 0;
        let mut page = self.journal.root();

        if let Some(meta) = new_meta.as_deref_mut() {
            meta.id = target;
        }

        let found = 'trace: {
            if page == PAGE_NONE {
                break 'trace false;
            }

            self.journal.read_meta(page, &mut meta_buf)?;
            let mut node = SectorMeta::decode(&meta_buf);

            while depth < RADIX_DEPTH {
                if node.id == SECTOR_NONE {
                    break 'trace false;
                }

                if (target ^ node.id) & d_bit(depth) != 0 {
                    // The paths diverge here: the current node roots the
                    // sibling subtree, and the target (if present) lives
                    // under this node's alt-pointer.
                    if let Some(meta) = new_meta.as_deref_mut() {
                        meta.alt[depth] = page;
                    }

                    page = node.alt[depth];
                    if page == PAGE_NONE {
                        depth += 1;
                        break 'trace false;
                    }

                    self.journal.read_meta(page, &mut meta_buf)?;
                    node = SectorMeta::decode(&meta_buf);
                } else if let Some(meta) = new_meta.as_deref_mut() {
                    meta.alt[depth] = node.alt[depth];
                }

                depth += 1;
            }

            true
        };

        if found {
            return Ok(page);
        }

        if let Some(meta) = new_meta {
            for slot in &mut meta.alt[depth..] {
                *slot = PAGE_NONE;
            }
        }

        Err(Error::NotFound)
    }

    /// Stamp the sector count into the journal cookie, to be persisted by
    /// the next checkpoint.
    fn set_cookie(&mut self, count: u32) {
        self.journal.cookie_mut().copy_from_slice(&count.to_le_bytes());
    }

    /// Check the page at `src`. If it's filler or an obsolete version,
    /// do nothing; otherwise rewrite it at the front of the journal.
    /// Journal errors (including `Recover`) pass through raw.
    fn raw_gc(&mut self, src: PageIndex) -> Result<()> {
        let mut meta_buf = [0u8; META_SIZE];
        self.journal.read_meta(src, &mut meta_buf)?;
        let mut meta = SectorMeta::decode(&meta_buf);

        // Filler pages carry no sector
        let target = meta.id;
        if target == SECTOR_NONE {
            return Ok(());
        }

        // Where does the sector this page once represented live now, if
        // anywhere?
        let current = match self.trace_path(target, Some(&mut meta)) {
            Ok(page) => page,
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };

        // Superseded by a newer version: nothing to keep
        if current != src {
            return Ok(());
        }

        self.set_cookie(self.count);
        self.journal.copy(src, Some(&meta.encode()))
    }

    /// Push something -- anything -- so the journal can make checkpoint
    /// progress: re-copy the root under its own metadata, or enqueue a
    /// filler entry into an empty journal.
    fn pad_queue(&mut self) -> Result<()> {
        let root = self.journal.root();

        self.set_cookie(self.count);

        if root == PAGE_NONE {
            return self.journal.enqueue(None, None);
        }

        let mut root_meta = [0u8; META_SIZE];
        self.journal.read_meta(root, &mut root_meta)?;
        self.journal.copy(root, Some(&root_meta))
    }

    /// Drive the journal's assisted recovery to completion: re-emit each
    /// recoverable page through [`Map::raw_gc`], padding when the
    /// enumeration runs dry, restarting a bounded number of times.
    fn try_recover(&mut self, cause: Error) -> Result<()> {
        if cause != Error::Recover {
            return Err(cause);
        }

        let mut restarts = 0;

        while self.journal.in_recovery() {
            let page = self.journal.next_recoverable();

            let res = if page == PAGE_NONE {
                self.pad_queue()
            } else {
                self.raw_gc(page)
            };

            match res {
                Ok(()) => {}
                Err(Error::Recover) => {
                    if restarts >= self.journal.config().max_retries {
                        return Err(Error::TooBad);
                    }
                    restarts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn auto_gc(&mut self) -> Result<()> {
        if self.journal.size() < self.capacity() {
            return Ok(());
        }

        for _ in 0..self.gc_ratio {
            self.gc()?;
        }

        Ok(())
    }

    /// Get ready to push a new version of `dst`: collect garbage if space
    /// demands it, build the copy-on-write path in `meta`, account for a
    /// possibly new sector, and stamp the cookie.
    fn prepare_write(&mut self, dst: SectorIndex, meta: &mut SectorMeta) -> Result<()> {
        self.auto_gc()?;

        match self.trace_path(dst, Some(meta)) {
            Ok(_) => {}
            Err(Error::NotFound) => {
                if self.count >= self.capacity() {
                    return Err(Error::MapFull);
                }

                self.count += 1;
            }
            Err(e) => return Err(e),
        }

        self.set_cookie(self.count);
        Ok(())
    }

    /// Unlink `sector` by rewriting its closest cousin with a path that no
    /// longer reaches the deleted node.
    fn try_delete(&mut self, sector: SectorIndex) -> Result<()> {
        let mut meta = SectorMeta::blank(sector);

        match self.trace_path(sector, Some(&mut meta)) {
            Ok(_) => {}
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        }

        // The deepest alt-pointer names the closest cousin subtree
        let Some(level) = (0..RADIX_DEPTH).rev().find(|&l| meta.alt[l] != PAGE_NONE) else {
            // No cousins at all: that was the last sector
            self.count = 0;
            self.journal.clear();
            return Ok(());
        };

        let alt_page = meta.alt[level];
        let mut alt_buf = [0u8; META_SIZE];
        self.journal.read_meta(alt_page, &mut alt_buf)?;
        let alt_meta = SectorMeta::decode(&alt_buf);

        // Splice: the cousin takes over this path, minus the branch that
        // led to the deleted node, keeping its own deeper branches.
        meta.id = alt_meta.id;
        meta.alt[level] = PAGE_NONE;
        meta.alt[level + 1..].copy_from_slice(&alt_meta.alt[level + 1..]);

        self.set_cookie(self.count - 1);
        self.journal.copy(alt_page, Some(&meta.encode()))?;

        self.count -= 1;
        Ok(())
    }
}
