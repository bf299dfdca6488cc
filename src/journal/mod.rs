//! An append-only page journal over raw NAND.
//!
//! The journal presents the NAND pages as a double-ended queue: pages with
//! associated metadata are pushed at the head and popped from the tail.
//! Block erasure and metadata storage are handled internally; bad blocks are
//! handled by relocating data to the next good page in the sequence.
//!
//! Within every erase block, pages are grouped into checkpoint groups of
//! `2^log2_ppc` contiguous aligned pages. The last page of each group is a
//! meta page carrying the journal header, a cookie owned by the layer above,
//! and one metadata slot for each user page in the group. A push becomes
//! persistent when its group's meta page is programmed.
//!
//! It is up to the caller to keep the queue within the capacity of the chip;
//! [`Journal::capacity`] and [`Journal::size`] exist to help with that. If
//! the head would roll onto the synchronized tail's block, enqueueing fails
//! with `JournalFull`.

pub mod header;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::nand::{BlockIndex, Nand, NandLayout, PageIndex, PAGE_NONE};

use header::{CheckpointHeader, HEADER_SIZE};

/// Static tuning parameters for a journal (and the map above it), resolved
/// once at init. The same configuration must be used for every session
/// against the same chip.
#[derive(Debug, Copy, Clone)]
pub struct Config {
    /// Size of the metadata slice accompanying each written page. This is
    /// independent of the underlying page size.
    pub meta_size: usize,

    /// Size of the cookie: global metadata available to the layer above,
    /// persistent once the journal reaches a checkpoint.
    pub cookie_size: usize,

    /// When a block fails or garbage is encountered, how many times to move
    /// on and retry before giving up with `TooBad`.
    pub max_retries: usize,

    /// Ratio of garbage collection operations to real writes when automatic
    /// collection is active. Smaller values give faster, more predictable
    /// I/O at the expense of capacity. Unused by the bare journal.
    pub gc_ratio: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta_size: 132,
            cookie_size: 4,
            max_retries: 8,
            gc_ratio: 4,
        }
    }
}

/// Is this page index aligned to N bits?
fn is_aligned(p: PageIndex, n: u8) -> bool {
    p & ((1 << n) - 1) == 0
}

/// Are these two pages in the same 2^n-aligned group?
fn align_eq(a: PageIndex, b: PageIndex, n: u8) -> bool {
    (a ^ b) >> n == 0
}

/// Calculate a checkpoint period: the largest ppc, up to `max`, such that
/// `2^ppc - 1` metadata slots and one header fit on a single page.
fn choose_ppc(cookie_size: usize, meta_size: usize, log2_page_size: u8, max: u8) -> u8 {
    let max_meta = (1usize << log2_page_size) - HEADER_SIZE - cookie_size;
    let mut total_meta = meta_size;
    let mut ppc: u8 = 1;

    while ppc < max {
        total_meta <<= 1;
        total_meta += meta_size;

        if total_meta > max_meta {
            break;
        }

        ppc += 1;
    }

    ppc
}

#[derive(Debug, Default, Copy, Clone)]
struct Flags {
    /// The meta-page buffer holds entries not yet on the chip
    dirty: bool,

    /// The dumped-meta block later failed; mark it bad once recovery ends
    bad_meta: bool,

    /// A mid-block failure left user pages that must be rewritten
    recovery: bool,

    /// The recovery enumeration has handed out its last page
    enum_done: bool,
}

/// The journal over a borrowed NAND device.
///
/// All cursor state lives here, plus one page-sized buffer used as the
/// in-RAM meta page; nothing else is allocated after construction.
pub struct Journal<'n, N: Nand> {
    nand: &'n mut N,
    layout: NandLayout,
    config: Config,

    /// Checkpoint period: user data is grouped into checkpoints of
    /// `2^log2_ppc` contiguous aligned pages.
    log2_ppc: u8,

    /// The buffer for the checkpoint group currently being filled
    page_buf: Vec<u8>,

    /// Incremented whenever the head passes the end of the chip and wraps
    epoch: u8,

    flags: Flags,

    /// Bad-block counters. `bb_last` is the best estimate for the chip as a
    /// whole; `bb_current` counts bad blocks seen before the current head.
    bb_current: u32,
    bb_last: u32,

    /// Queue cursors. `tail` is the oldest user page still wanted; the head
    /// is the next raw page to program. `tail_sync` trails `tail` until a
    /// checkpoint makes the dequeues permanent.
    tail_sync: PageIndex,
    tail: PageIndex,
    head: PageIndex,

    /// The last user page written (the newest checkpointed or buffered one)
    root: PageIndex,

    /// Recovery cursors: `recover_root` is the last valid user page in the
    /// block being recovered, `recover_next` the next page to re-emit. If
    /// buffered metadata had to be dumped to a free page first, that page is
    /// `recover_meta`.
    recover_next: PageIndex,
    recover_root: PageIndex,
    recover_meta: PageIndex,
}

impl<'n, N: Nand> Journal<'n, N> {
    /// Set up an empty journal over a borrowed NAND device.
    ///
    /// No NAND operations are performed; call [`Journal::resume`] to pick up
    /// existing on-chip state.
    pub fn new(nand: &'n mut N, config: Config) -> Self {
        let layout = nand.layout();
        let log2_ppc = choose_ppc(
            config.cookie_size,
            config.meta_size,
            layout.log2_page_size,
            layout.log2_ppb.min(6),
        );

        let mut journal = Self {
            nand,
            layout,
            config,
            log2_ppc,
            page_buf: vec![0; layout.page_size()],
            epoch: 0,
            flags: Flags::default(),
            bb_current: 0,
            bb_last: 0,
            tail_sync: 0,
            tail: 0,
            head: 0,
            root: PAGE_NONE,
            recover_next: PAGE_NONE,
            recover_root: PAGE_NONE,
            recover_meta: PAGE_NONE,
        };

        journal.reset();
        journal
    }

    /// Start up the journal: search the NAND for the newest checkpoint, or
    /// leave a blank journal if none is found.
    ///
    /// This operation is O(log n) in the number of pages on the chip; all
    /// other operations are O(1).
    ///
    /// On failure the journal is reset to an empty state and the error is
    /// returned (`TooBad` for a chip with no recognizable checkpoint).
    pub fn resume(&mut self) -> Result<()> {
        // Find the first and last checkpoint-containing blocks of the
        // newest epoch, then the last programmed group within the block.
        let (first, header) = match self.find_checkblock(0) {
            Ok(found) => found,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        self.epoch = header.epoch;

        let last = self.find_last_checkblock(first);
        let last_group = self.find_last_group(last);

        // Linear scan backwards for the last good checkpoint, which names
        // the root.
        let header = match self.find_root(last_group) {
            Ok(h) => h,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        self.tail = header.tail;
        self.bb_current = header.bb_current;
        self.bb_last = header.bb_last;
        self.clear_meta_slots();

        // Another linear scan for the next free user page
        self.find_head(last_group);

        self.flags = Flags::default();
        self.tail_sync = self.tail;
        self.clear_recovery();

        debug!(
            "journal resumed: epoch={} root={:#x} head={:#x} tail={:#x}",
            self.epoch, self.root, self.head, self.tail
        );
        Ok(())
    }

    /// Upper bound on the number of user pages storable in the journal
    pub fn capacity(&self) -> u32 {
        let max_bad = self.bb_last.max(self.bb_current);
        let good_blocks = self.layout.blocks - max_bad - 1;
        let log2_cpb = self.layout.log2_ppb - self.log2_ppc;
        let good_cps = good_blocks << log2_cpb;

        // Good checkpoint groups, less one meta page each
        (good_cps << self.log2_ppc) - good_cps
    }

    /// Upper bound on the number of user pages currently in the journal
    pub fn size(&self) -> u32 {
        // Count raw pages and checkpoint groups between the synced tail and
        // the head; the difference is the user pages.
        let mut num_pages = self.head;
        let mut num_cps = self.head >> self.log2_ppc;

        if self.head < self.tail_sync {
            let total_pages = self.layout.pages();

            num_pages += total_pages;
            num_cps += total_pages >> self.log2_ppc;
        }

        num_pages -= self.tail_sync;
        num_cps -= self.tail_sync >> self.log2_ppc;

        num_pages - num_cps
    }

    /// Location of the last written user page, or `PAGE_NONE` when empty
    pub fn root(&self) -> PageIndex {
        self.root
    }

    /// Is everything pushed so far persistent?
    pub fn is_clean(&self) -> bool {
        !self.flags.dirty
    }

    /// Mark the journal dirty
    pub fn mark_dirty(&mut self) {
        self.flags.dirty = true;
    }

    /// The cookie: a small piece of global metadata owned by the layer
    /// above, persisted in every checkpoint and restored by resume.
    pub fn cookie(&self) -> &[u8] {
        &self.page_buf[HEADER_SIZE..HEADER_SIZE + self.config.cookie_size]
    }

    /// Mutable access to the cookie. Changes become persistent at the next
    /// checkpoint.
    pub fn cookie_mut(&mut self) -> &mut [u8] {
        &mut self.page_buf[HEADER_SIZE..HEADER_SIZE + self.config.cookie_size]
    }

    /// Read the metadata associated with a user page.
    ///
    /// `buf` receives `meta_size` bytes. The slot may come from the in-RAM
    /// buffer (pages in the group at the head), from the meta page dumped at
    /// the start of a recovery, or from the group's meta page on the chip.
    pub fn read_meta(&self, page: PageIndex, buf: &mut [u8]) -> Result<()> {
        let ppc_mask = self.ppc_mask();
        let offset = self.user_offset(page & ppc_mask);
        let meta_size = self.config.meta_size;

        if align_eq(page, self.head, self.log2_ppc) {
            buf[..meta_size].copy_from_slice(&self.page_buf[offset..offset + meta_size]);
            return Ok(());
        }

        if self.recover_meta != PAGE_NONE && align_eq(page, self.recover_root, self.log2_ppc) {
            return self.nand.read(self.recover_meta, offset, &mut buf[..meta_size]);
        }

        self.nand.read(page | ppc_mask, offset, &mut buf[..meta_size])
    }

    /// Advance the tail past any bad blocks and return the page that is
    /// ready to read, or `PAGE_NONE` if the journal is empty.
    pub fn peek(&mut self) -> PageIndex {
        if self.head == self.tail {
            return PAGE_NONE;
        }

        let log2_ppb = self.layout.log2_ppb;

        if is_aligned(self.tail, log2_ppb) {
            let mut block = self.layout.block_of(self.tail);

            for _ in 0..self.config.max_retries {
                if block == self.layout.block_of(self.head) || !self.nand.is_bad(block) {
                    self.tail = self.layout.first_page(block);

                    if self.tail == self.head {
                        self.root = PAGE_NONE;
                    }

                    return self.tail;
                }

                block = self.next_block(block);
            }
        }

        self.tail
    }

    /// Remove the oldest page from the journal. The removal is not
    /// permanent until the next checkpoint.
    pub fn dequeue(&mut self) {
        if self.head == self.tail {
            return;
        }

        self.tail = self.next_upage(self.tail);

        // A dequeue from a clean journal removes data that was already
        // obsolete on media; its space can be reused immediately.
        if !(self.flags.dirty || self.flags.recovery) {
            self.tail_sync = self.tail;
        }

        if self.head == self.tail {
            self.root = PAGE_NONE;
        }
    }

    /// Remove all pages from the journal. Not permanent until the next
    /// checkpoint.
    pub fn clear(&mut self) {
        self.tail = self.head;
        self.root = PAGE_NONE;
        self.flags.dirty = true;

        self.clear_meta_slots();
    }

    /// Declare every dequeued page permanently reclaimable by advancing the
    /// synchronized tail to the current tail.
    ///
    /// Normally this happens by itself at the next checkpoint; it is needed
    /// only to recover space after draining a journal that cannot reach one
    /// (for example one that just reported `JournalFull`).
    pub fn sync_tail(&mut self) {
        self.tail_sync = self.tail;
    }

    /// Append a page to the journal.
    ///
    /// `data` is a full page, or `None` for a filler entry that occupies a
    /// queue position without programming anything. `meta` is the page's
    /// `meta_size`-byte metadata slot, or `None` for all-0xFF.
    ///
    /// The push is not persistent until a checkpoint is reached. May fail
    /// with `Recover`, in which case the caller must complete the assisted
    /// recovery procedure and try again; see [`Journal::next_recoverable`].
    pub fn enqueue(&mut self, data: Option<&[u8]>, meta: Option<&[u8]>) -> Result<()> {
        for _ in 0..self.config.max_retries {
            let res = self.prepare_head().and_then(|()| match data {
                Some(data) => self.nand.prog(self.head, data),
                None => Ok(()),
            });

            match res {
                Ok(()) => return self.push_meta(meta),
                Err(e) => self.recover_from(e)?,
            }
        }

        Err(Error::TooBad)
    }

    /// Copy an existing page to the head of the journal under new metadata,
    /// using the NAND's ECC-preserving page move.
    ///
    /// Same persistence and `Recover` semantics as [`Journal::enqueue`].
    pub fn copy(&mut self, page: PageIndex, meta: Option<&[u8]>) -> Result<()> {
        for _ in 0..self.config.max_retries {
            let res = self
                .prepare_head()
                .and_then(|()| self.nand.copy(page, self.head));

            match res {
                Ok(()) => return self.push_meta(meta),
                Err(e) => self.recover_from(e)?,
            }
        }

        Err(Error::TooBad)
    }

    /// Is the journal in the middle of the assisted recovery procedure?
    ///
    /// After an operation returns `Recover`, call
    /// [`Journal::next_recoverable`] for each page to be re-emitted (reading
    /// its metadata and re-pushing via [`Journal::copy`]), then proceed to
    /// the next checkpoint; recovery finishes automatically once the journal
    /// is clean. If an operation fails with `Recover` again, the procedure
    /// restarts. Do not add new data (rewrites of recovered data are fine)
    /// until recovery is complete.
    pub fn in_recovery(&self) -> bool {
        self.flags.recovery
    }

    /// The next user page of the failed block that needs to be re-emitted,
    /// or `PAGE_NONE` when the enumeration is exhausted.
    pub fn next_recoverable(&mut self) -> PageIndex {
        let next = self.recover_next;

        if !self.in_recovery() || self.flags.enum_done {
            return PAGE_NONE;
        }

        if self.recover_next == self.recover_root {
            self.flags.enum_done = true;
        } else {
            self.recover_next = self.next_upage(self.recover_next);
        }

        next
    }

    /// The geometry this journal runs over
    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    /// The configuration this journal was created with
    pub fn config(&self) -> Config {
        self.config
    }

    /// Base-2 logarithm of the checkpoint group size
    pub fn log2_ppc(&self) -> u8 {
        self.log2_ppc
    }

    /// Current epoch counter
    pub fn epoch(&self) -> u8 {
        self.epoch
    }

    /// The next raw page to be programmed
    pub fn head(&self) -> PageIndex {
        self.head
    }

    /// The oldest user page still enqueued
    pub fn tail(&self) -> PageIndex {
        self.tail
    }

    /// The oldest page that survives a crash (trails [`Journal::tail`]
    /// until a checkpoint)
    pub fn tail_sync(&self) -> PageIndex {
        self.tail_sync
    }

    /// Shared access to the underlying NAND device
    pub fn nand(&self) -> &N {
        &*self.nand
    }
}

// Geometry and media helpers
impl<N: Nand> Journal<'_, N> {
    fn ppc_mask(&self) -> PageIndex {
        (1 << self.log2_ppc) - 1
    }

    /// Byte offset of a user page's metadata slot within its meta page
    fn user_offset(&self, which: PageIndex) -> usize {
        HEADER_SIZE + self.config.cookie_size + which as usize * self.config.meta_size
    }

    /// Reset the meta slots of the buffered group, preserving the header
    /// area and the cookie.
    fn clear_meta_slots(&mut self) {
        self.page_buf[HEADER_SIZE + self.config.cookie_size..].fill(0xFF);
    }

    fn next_block(&self, block: BlockIndex) -> BlockIndex {
        let next = block + 1;
        if next >= self.layout.blocks {
            0
        } else {
            next
        }
    }

    /// The user page following `p`: skips meta pages, wraps at chip end
    fn next_upage(&self, page: PageIndex) -> PageIndex {
        let mut p = page + 1;

        if is_aligned(p + 1, self.log2_ppc) {
            p += 1;
        }

        if p >= self.layout.pages() {
            p = 0;
        }

        p
    }

    fn clear_recovery(&mut self) {
        self.recover_next = PAGE_NONE;
        self.recover_root = PAGE_NONE;
        self.recover_meta = PAGE_NONE;
        self.flags.bad_meta = false;
        self.flags.recovery = false;
        self.flags.enum_done = false;
    }

    /// Set up an empty journal
    fn reset(&mut self) {
        // No bad-block estimate is available yet; guess conservatively.
        self.epoch = 0;
        self.bb_last = self.layout.blocks >> 6;
        self.bb_current = 0;

        self.flags = Flags::default();

        self.head = 0;
        self.tail = 0;
        self.tail_sync = 0;
        self.root = PAGE_NONE;

        self.clear_recovery();

        self.page_buf.fill(0xFF);
    }

    fn roll_stats(&mut self) {
        self.bb_last = self.bb_current;
        self.bb_current = 0;
        self.epoch = self.epoch.wrapping_add(1);
        trace!("journal: head wrapped, epoch={}", self.epoch);
    }

    /// Find the first checkpoint-containing block at or after `block`. A
    /// block containing any checkpoint at all has one in its first group
    /// position; otherwise it would have been considered erasable.
    ///
    /// On success the meta page is left in the page buffer.
    fn find_checkblock(&mut self, mut block: BlockIndex) -> Result<(BlockIndex, CheckpointHeader)> {
        for _ in 0..self.config.max_retries {
            if block >= self.layout.blocks {
                break;
            }

            let p = self.layout.first_page(block) | self.ppc_mask();

            if !self.nand.is_bad(block) && self.nand.read(p, 0, &mut self.page_buf).is_ok() {
                if let Some(header) = CheckpointHeader::parse(&self.page_buf) {
                    return Ok((block, header));
                }
            }

            block += 1;
        }

        Err(Error::TooBad)
    }

    /// Binary-search for the last checkpoint-containing block of the
    /// current epoch, starting at `first`. Where a probe fails or lands in
    /// another epoch, the lower half wins.
    fn find_last_checkblock(&mut self, first: BlockIndex) -> BlockIndex {
        let mut low = first;
        let mut high = self.layout.blocks - 1;

        while low <= high {
            let mid = (low + high) >> 1;

            match self.find_checkblock(mid) {
                Ok((found, header)) if header.epoch == self.epoch => {
                    if found + 1 >= self.layout.blocks {
                        return found;
                    }

                    match self.find_checkblock(found + 1) {
                        Ok((next, header)) if header.epoch == self.epoch => low = next,
                        _ => return found,
                    }
                }
                _ => {
                    if mid == 0 {
                        return first;
                    }

                    high = mid - 1;
                }
            }
        }

        first
    }

    /// Is this checkpoint group fit for reprogramming?
    ///
    /// `is_free` may have no way to distinguish an unprogrammed page from
    /// one programmed with all-0xFF bytes, so every page of the group is
    /// probed. That still suffices: a group's final page is a meta page and
    /// is guaranteed to contain non-0xFF bytes, so a group reporting free
    /// is either truly unprogrammed or was partially programmed with only
    /// all-0xFF user pages, which changes nothing.
    fn cp_free(&self, first_user: PageIndex) -> bool {
        let count = 1 << self.log2_ppc;
        let pages = self.layout.pages();

        for i in 0..count {
            let p = first_user + i;

            // The head walk may probe from mid-group near the chip's end;
            // positions past the last page count as free.
            if p >= pages {
                break;
            }

            if !self.nand.is_free(p) {
                return false;
            }
        }

        true
    }

    /// Binary-search for the last programmed checkpoint group in a block.
    /// A completely unprogrammed group is followed only by unprogrammed
    /// groups, which is what makes the bisection valid.
    fn find_last_group(&self, block: BlockIndex) -> PageIndex {
        let num_groups = 1i32 << (self.layout.log2_ppb - self.log2_ppc);
        let mut low = 0i32;
        let mut high = num_groups - 1;

        while low <= high {
            let mid = (low + high) >> 1;
            let page = ((mid as PageIndex) << self.log2_ppc) | self.layout.first_page(block);

            if self.cp_free(page) {
                high = mid - 1;
            } else if mid + 1 >= num_groups || self.cp_free(page + (1 << self.log2_ppc)) {
                return page;
            } else {
                low = mid + 1;
            }
        }

        self.layout.first_page(block)
    }

    /// Scan backwards from `start`'s group for the last good checkpoint in
    /// the current epoch, setting the root. The found meta page is left in
    /// the page buffer (so the cookie is restored as a side effect).
    fn find_root(&mut self, start: PageIndex) -> Result<CheckpointHeader> {
        let block = self.layout.block_of(start);
        let mut group = ((start & (self.layout.pages_per_block() - 1)) >> self.log2_ppc) as i32;

        while group >= 0 {
            let p = self.layout.first_page(block) + (((group as PageIndex) + 1) << self.log2_ppc)
                - 1;

            if self.nand.read(p, 0, &mut self.page_buf).is_ok() {
                if let Some(header) = CheckpointHeader::parse(&self.page_buf) {
                    if header.epoch == self.epoch {
                        self.root = p - 1;
                        return Ok(header);
                    }
                }
            }

            group -= 1;
        }

        Err(Error::TooBad)
    }

    /// Starting from the last programmed checkpoint group, find either the
    /// next free user page in the same block or the first page of the next
    /// block. The block we land on might be bad; preparing the next write
    /// will skip it.
    fn find_head(&mut self, start: PageIndex) {
        let log2_ppb = self.layout.log2_ppb;

        self.head = start;

        loop {
            self.head = self.next_upage(self.head);
            if self.head == 0 {
                self.roll_stats();
            }

            // At the end of the block we're done; make sure the head didn't
            // chase over the tail.
            if is_aligned(self.head, log2_ppb) {
                if align_eq(self.head, self.tail, log2_ppb) {
                    self.tail = self
                        .layout
                        .first_page(self.next_block(self.layout.block_of(self.tail)));
                }
                break;
            }

            if self.cp_free(self.head) {
                break;
            }
        }
    }

    /// Move the head to the start of the next block, which must not be the
    /// synchronized tail's block.
    fn skip_block(&mut self) -> Result<()> {
        let next = self.next_block(self.layout.block_of(self.head));

        if self.layout.block_of(self.tail_sync) == next {
            return Err(Error::JournalFull);
        }

        self.head = self.layout.first_page(next);
        if self.head == 0 {
            self.roll_stats();
        }

        Ok(())
    }

    /// Make sure the head points at a ready-to-program page.
    fn prepare_head(&mut self) -> Result<()> {
        let log2_ppb = self.layout.log2_ppb;
        let next = self.next_upage(self.head);

        // Writing must not roll the head onto the block holding the
        // last-synced tail.
        if align_eq(next, self.tail_sync, log2_ppb) && !align_eq(next, self.head, log2_ppb) {
            return Err(Error::JournalFull);
        }

        self.flags.dirty = true;
        if !is_aligned(self.head, log2_ppb) {
            return Ok(());
        }

        for _ in 0..self.config.max_retries {
            let block = self.layout.block_of(self.head);

            if !self.nand.is_bad(block) {
                return self.nand.erase(block);
            }

            self.bb_current += 1;
            self.skip_block()?;
        }

        Err(Error::TooBad)
    }

    fn restart_recovery(&mut self, old_head: PageIndex) {
        let log2_ppb = self.layout.log2_ppb;

        // Mark the failed head bad immediately, unless it also holds the
        // dumped metadata; that block gets marked at the end of recovery.
        if self.recover_meta == PAGE_NONE || !align_eq(self.recover_meta, old_head, log2_ppb) {
            self.nand.mark_bad(self.layout.block_of(old_head));
        } else {
            self.flags.bad_meta = true;
        }

        // Start over: the source enumeration resets to the beginning of the
        // original bad block, the destination to the newly found block.
        self.flags.enum_done = false;
        self.recover_next = self.recover_root & !(self.layout.pages_per_block() - 1);

        self.root = self.recover_root;
        debug!("journal: recovery restarted at {:#x}", self.recover_next);
    }

    /// Recovery has just begun on a fresh erasable block, but the buffer
    /// holds metadata from the failed block. Program it out to the next
    /// available page so `read_meta` can still serve the failed group.
    fn dump_meta(&mut self) -> Result<()> {
        for _ in 0..self.config.max_retries {
            let res = self
                .prepare_head()
                .and_then(|()| self.nand.prog(self.head, &self.page_buf));

            match res {
                Ok(()) => {
                    self.recover_meta = self.head;
                    self.head = self.next_upage(self.head);
                    if self.head == 0 {
                        self.roll_stats();
                    }
                    self.clear_meta_slots();
                    return Ok(());
                }
                Err(Error::BadBlock) => {
                    self.bb_current += 1;
                    self.nand.mark_bad(self.layout.block_of(self.head));
                    self.skip_block()?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::TooBad)
    }

    /// React to a failed program/erase at the head. `BadBlock` starts (or
    /// restarts) the relocation machinery; anything else propagates.
    fn recover_from(&mut self, write_err: Error) -> Result<()> {
        let old_head = self.head;

        if write_err != Error::BadBlock {
            return Err(write_err);
        }

        // Advance to the next free page
        self.bb_current += 1;
        self.skip_block()?;

        // Already in the middle of a recovery?
        if self.in_recovery() {
            self.restart_recovery(old_head);
            return Err(Error::Recover);
        }

        // A failure on the block's first page loses nothing; just mark the
        // block and carry on.
        if is_aligned(old_head, self.layout.log2_ppb) {
            self.nand.mark_bad(self.layout.block_of(old_head));
            return Ok(());
        }

        self.recover_root = self.root;
        self.recover_next = self.recover_root & !(self.layout.pages_per_block() - 1);

        // Holding buffered metadata? Dump it first.
        if !is_aligned(old_head, self.log2_ppc) {
            self.dump_meta()?;
        }

        self.flags.recovery = true;
        debug!(
            "journal: recovery started, root={:#x} next={:#x}",
            self.recover_root, self.recover_next
        );
        Err(Error::Recover)
    }

    /// The last page recovered has been re-emitted and checkpointed; mark
    /// the failed block (and the dumped-meta block, if it also failed) bad
    /// and leave recovery.
    fn finish_recovery(&mut self) {
        self.nand.mark_bad(self.layout.block_of(self.recover_root));

        if self.flags.bad_meta {
            self.nand.mark_bad(self.layout.block_of(self.recover_meta));
        }

        self.clear_recovery();
        debug!("journal: recovery complete");
    }

    /// A user page has just been written at the head; record its metadata,
    /// and close out the checkpoint group if this fills it.
    fn push_meta(&mut self, meta: Option<&[u8]>) -> Result<()> {
        let old_head = self.head;
        let offset = self.user_offset(self.head & self.ppc_mask());
        let slot = &mut self.page_buf[offset..offset + self.config.meta_size];

        match meta {
            Some(meta) => slot.copy_from_slice(meta),
            None => slot.fill(0xFF),
        }

        // Unless the group is now full, no I/O happens
        if !is_aligned(self.head + 2, self.log2_ppc) {
            self.root = self.head;
            self.head += 1;
            return Ok(());
        }

        // No immediate recover can be needed for the meta page itself: its
        // position is never block-aligned.
        CheckpointHeader::new(self.epoch, self.tail, self.bb_current, self.bb_last)
            .encode(&mut self.page_buf[..HEADER_SIZE]);

        if let Err(e) = self.nand.prog(self.head + 1, &self.page_buf) {
            return self.recover_from(e);
        }

        self.flags.dirty = false;
        self.root = old_head;
        self.head = self.next_upage(self.head);

        if self.head == 0 {
            self.roll_stats();
        }

        if self.flags.enum_done {
            self.finish_recovery();
        }

        if !self.flags.recovery {
            self.tail_sync = self.tail;
        }

        Ok(())
    }
}
