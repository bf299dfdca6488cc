//! Shared harness for the end-to-end tests: invariant checks over the
//! journal and the map's radix tree, sequenced enqueue/dequeue drivers that
//! ride out recovery, and deterministic payload helpers.
#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use nandmap::journal::Journal;
use nandmap::map::{Map, SectorIndex, META_SIZE};
use nandmap::nand::sim::pattern_fill;
use nandmap::nand::{Nand, NandLayout, PageIndex, PAGE_NONE};
use nandmap::Error;

/// The simulated chip every scenario runs on: 512 B pages, 8 pages per
/// block, 113 blocks. With 132 B meta slots this gives 4-page checkpoint
/// groups.
pub const SIM_LAYOUT: NandLayout = NandLayout {
    log2_page_size: 9,
    log2_ppb: 3,
    blocks: 113,
};

/// Verify that a buffer holds the `pattern_fill` sequence for `seed`.
pub fn pattern_assert(seed: u32, buf: &[u8]) {
    let mut expect = vec![0u8; buf.len()];
    pattern_fill(seed, &mut expect);
    assert_eq!(buf, &expect[..], "payload mismatch for seed {seed}");
}

/// A seeded permutation of the sectors `0..n`.
pub fn shuffled_sectors(seed: u64, n: u32) -> Vec<SectorIndex> {
    let mut list: Vec<SectorIndex> = (0..n).collect();
    list.shuffle(&mut StdRng::seed_from_u64(seed));
    list
}

fn check_upage<N: Nand>(journal: &Journal<N>, p: PageIndex) {
    let mask = (1u32 << journal.log2_ppc()) - 1;

    assert_ne!(!p & mask, 0, "page {p:#x} is a meta-page position");
    assert!(
        p < journal.layout().pages(),
        "page {p:#x} is out of bounds"
    );
}

/// Check the journal's structural invariants.
pub fn check_journal<N: Nand>(journal: &Journal<N>) {
    // Head and tail pointers always hold valid user-page indices: never a
    // meta page, never out of bounds.
    check_upage(journal, journal.head());
    check_upage(journal, journal.tail());
    check_upage(journal, journal.tail_sync());

    // When not wrapped, the head never trails the synchronized tail
    if (journal.head() ^ journal.tail_sync()) >> journal.layout().log2_ppb == 0 {
        assert!(journal.head() >= journal.tail_sync());
    }

    // The current tail lies between the synchronized tail and the head
    assert!(
        journal.head().wrapping_sub(journal.tail_sync())
            >= journal.tail().wrapping_sub(journal.tail_sync())
    );

    // The root points into the live region of a non-empty journal
    if journal.head() != journal.tail() {
        let raw_size = journal.head().wrapping_sub(journal.tail());
        let root_offset = journal.root().wrapping_sub(journal.tail());

        check_upage(journal, journal.root());
        assert!(root_offset < raw_size);
    } else {
        assert_eq!(journal.root(), PAGE_NONE);
    }
}

/// Drive the journal's assisted recovery to completion, checking
/// invariants at every step.
pub fn recover<N: Nand>(journal: &mut Journal<N>) {
    let mut restarts = 0;

    while journal.in_recovery() {
        let page = journal.next_recoverable();

        check_journal(journal);

        let res = if page == PAGE_NONE {
            journal.enqueue(None, None)
        } else {
            let mut meta = [0u8; META_SIZE];
            journal.read_meta(page, &mut meta).expect("read_meta");
            journal.copy(page, Some(&meta))
        };

        check_journal(journal);

        match res {
            Ok(()) => {}
            Err(Error::Recover) => {
                restarts += 1;
                assert!(
                    restarts < journal.config().max_retries,
                    "recovery kept restarting"
                );
            }
            Err(e) => panic!("recovery failed: {e}"),
        }
    }

    check_journal(journal);
}

/// Enqueue one page whose payload and metadata are derived from `id`,
/// riding out any recovery that failures trigger.
pub fn enqueue_id<N: Nand>(journal: &mut Journal<N>, id: u32) -> Result<(), Error> {
    let mut payload = vec![0u8; journal.layout().page_size()];
    let mut meta = [0u8; META_SIZE];

    pattern_fill(id, &mut payload);
    meta[..4].copy_from_slice(&id.to_le_bytes());

    for _ in 0..journal.config().max_retries {
        check_journal(journal);

        match journal.enqueue(Some(&payload), Some(&meta)) {
            Ok(()) => return Ok(()),
            Err(Error::Recover) => recover(journal),
            Err(e) => return Err(e),
        }
    }

    Err(Error::TooBad)
}

/// Enqueue `count` sequenced pages starting at id `start` (or as many as
/// fit, if `count` is None). After each push, the root's metadata must name
/// the id just pushed. Returns the number of pages enqueued.
pub fn enqueue_sequence<N: Nand>(
    journal: &mut Journal<N>,
    start: u32,
    count: Option<u32>,
) -> u32 {
    let count = count.unwrap_or_else(|| journal.layout().pages());

    for i in 0..count {
        match enqueue_id(journal, start + i) {
            Ok(()) => {}
            Err(Error::JournalFull) => return i,
            Err(e) => panic!("enqueue: {e}"),
        }

        assert!(journal.size() >= i);

        let mut meta = [0u8; META_SIZE];
        journal.read_meta(journal.root(), &mut meta).expect("read_meta");
        assert_eq!(u32::from_le_bytes(meta[..4].try_into().unwrap()), start + i);
    }

    count
}

/// Dequeue until `count` valid pages with sequential ids (from `next`) have
/// been popped and payload-verified. Filler entries (all-0xFF metadata) may
/// appear between valid pages, but never a whole checkpoint group's worth
/// in a row.
pub fn dequeue_sequence<N: Nand>(journal: &mut Journal<N>, mut next: u32, mut count: u32) {
    let max_garbage = 1u32 << journal.log2_ppc();
    let mut garbage_count = 0;

    while count > 0 {
        let mut meta = [0u8; META_SIZE];
        let tail = journal.peek();

        assert_ne!(tail, PAGE_NONE, "journal ran dry with {count} pages to go");

        check_journal(journal);
        journal.read_meta(tail, &mut meta).expect("read_meta");

        check_journal(journal);
        journal.dequeue();

        let id = u32::from_le_bytes(meta[..4].try_into().unwrap());

        if id == u32::MAX {
            garbage_count += 1;
            assert!(garbage_count < max_garbage, "too much contiguous filler");
        } else {
            assert_eq!(id, next, "ids must dequeue in order");
            garbage_count = 0;
            next += 1;
            count -= 1;

            let mut payload = vec![0u8; journal.layout().page_size()];
            journal.nand().read(tail, 0, &mut payload).expect("nand read");
            pattern_assert(id, &payload);
        }
    }

    check_journal(journal);
}

/// Write one sector with a `pattern_fill` payload.
pub fn write_sector<N: Nand>(map: &mut Map<N>, sector: SectorIndex, seed: u32) {
    let mut buf = vec![0u8; map.journal().layout().page_size()];

    pattern_fill(seed, &mut buf);
    map.write(sector, &buf).expect("map write");
}

/// Read one sector and verify its payload.
pub fn assert_sector<N: Nand>(map: &Map<N>, sector: SectorIndex, seed: u32) {
    let mut buf = vec![0u8; map.journal().layout().page_size()];

    map.read(sector, &mut buf).expect("map read");
    pattern_assert(seed, &buf);
}

/// Assert that a sector is unmapped.
pub fn assert_blank<N: Nand>(map: &Map<N>, sector: SectorIndex) {
    assert_eq!(map.find(sector), Err(Error::NotFound));
}

/// Walk the radix tree under `page` (entered via `parent`), checking node
/// ordering, alignment and prefix consistency, and return the number of
/// sectors reached.
fn check_recurse<N: Nand>(
    map: &Map<N>,
    parent: PageIndex,
    page: PageIndex,
    id_expect: SectorIndex,
    depth: u32,
) -> u32 {
    if page == PAGE_NONE {
        return 0;
    }

    let journal = map.journal();
    let tail = journal.tail();
    let h_offset = journal.head().wrapping_sub(tail);
    let p_offset = parent.wrapping_sub(tail);
    let offset = page.wrapping_sub(tail);

    // A valid journal user page, older than the page pointing at it
    assert!(offset < p_offset);
    assert!(offset < h_offset);
    assert_ne!(!page & ((1u32 << journal.log2_ppc()) - 1), 0);

    let mut meta = [0u8; META_SIZE];
    journal.read_meta(page, &mut meta).expect("read_meta");
    let id = u32::from_le_bytes(meta[..4].try_into().unwrap());

    // The first `depth` bits of the id match the path taken to get here
    if depth > 0 {
        assert_eq!((id ^ id_expect) >> (32 - depth), 0);
    }

    let mut count = 1;
    for i in depth..32 {
        let slot = 4 + (i as usize) * 4;
        let child = u32::from_le_bytes(meta[slot..slot + 4].try_into().unwrap());

        count += check_recurse(map, page, child, id ^ (1 << (31 - i)), i + 1);
    }

    count
}

/// Check the map's radix invariants and that its sector count matches a
/// full traversal.
pub fn check_map<N: Nand>(map: &Map<N>) {
    let count = check_recurse(map, map.journal().head(), map.journal().root(), 0, 0);
    assert_eq!(map.size(), count);
}
