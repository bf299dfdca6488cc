//! Bad-block recovery scenarios: blocks that fail instantly, fail after a
//! checkpoint, fail mid-group, fail on the meta page itself, and fail in
//! cascades (including the block holding dumped metadata). Each scenario
//! pushes and pops a sequence through the minefield; every popped payload
//! must match its id and the journal must end empty.

mod common;

use common::*;
use nandmap::journal::{Config, Journal};
use nandmap::nand::sim::SimNand;
use nandmap::nand::PAGE_NONE;

fn run(scenario: impl FnOnce(&mut SimNand)) {
    let mut nand = SimNand::new(SIM_LAYOUT);
    scenario(&mut nand);

    let mut journal = Journal::new(&mut nand, Config::default());
    let _ = journal.resume();

    // The fault positions below are tuned for 4-page checkpoint groups
    assert_eq!(journal.log2_ppc(), 2);

    assert_eq!(enqueue_sequence(&mut journal, 0, Some(30)), 30);
    dequeue_sequence(&mut journal, 0, 30);

    // Nothing but filler may remain; drain it and reclaim
    while journal.peek() != PAGE_NONE {
        journal.dequeue();
    }
    journal.sync_tail();
    assert_eq!(journal.size(), 0);
}

#[test]
fn test_control() {
    run(|_| {});
}

#[test]
fn test_instant_fail() {
    run(|nand| nand.set_failed(0));
}

#[test]
fn test_fail_after_checkpoint() {
    run(|nand| nand.set_timebomb(0, 6));
}

#[test]
fn test_fail_mid_checkpoint() {
    run(|nand| nand.set_timebomb(0, 3));
}

#[test]
fn test_fail_on_meta() {
    run(|nand| nand.set_timebomb(0, 5));
}

#[test]
fn test_cascade_after_checkpoint() {
    run(|nand| {
        nand.set_timebomb(0, 6);
        nand.set_timebomb(1, 3);
        nand.set_timebomb(2, 3);
    });
}

#[test]
fn test_cascade_mid_checkpoint() {
    run(|nand| {
        nand.set_timebomb(0, 3);
        nand.set_timebomb(1, 3);
    });
}

#[test]
fn test_meta_dump_failure() {
    run(|nand| {
        nand.set_timebomb(0, 3);
        nand.set_failed(1);
    });
}

#[test]
fn test_bad_day() {
    run(|nand| {
        nand.set_timebomb(0, 7);
        for block in 1..5 {
            nand.set_timebomb(block, 3);
        }
    });
}
