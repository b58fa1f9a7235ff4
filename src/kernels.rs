//! Parallel verification kernels.
//!
//! Every function here is the body of one worker: it touches a single block
//! (or, for the address walk and the stress test, a single probe or lane)
//! and records mismatches in the ledger. Kernels never fail; a mismatch is
//! data, not an error.
//!
//! Fault records carry a re-read of the first word of the worker's block,
//! which helps tell a transient read error from corrupted storage.

use crate::ledger::ErrorLedger;
use crate::patterns::{block_move_pattern, AddressWalk, RotatingPattern, MOD_SZ};
use crate::region::{BlockRange, DeviceRegion, StressLane, WORD_BYTES};

/// Words rotated between the halves of a block by the block-move test.
const BLOCK_MOVE_SHIFT: usize = 8;

fn record(
    region: &DeviceRegion,
    ledger: &ErrorLedger,
    start_word: usize,
    index: usize,
    expected: u32,
    observed: u32,
) {
    ledger.record_fault(
        region.word_address(index),
        expected as u64,
        observed as u64,
        region.load(start_word) as u64,
    );
}

fn record_wide(
    region: &DeviceRegion,
    ledger: &ErrorLedger,
    start_wide: usize,
    index: usize,
    expected: u64,
    observed: u64,
) {
    ledger.record_fault(
        region.wide_address(index),
        expected,
        observed,
        region.load_wide(start_wide),
    );
}

fn check(
    region: &DeviceRegion,
    ledger: &ErrorLedger,
    start_word: usize,
    index: usize,
    expected: u32,
) -> u32 {
    let observed = region.load(index);
    if observed != expected {
        record(region, ledger, start_word, index, expected, observed);
    }
    observed
}

// Test 0: address-line walk.

/// Writes one probe of the global walk.
pub fn address_walk_write(region: &DeviceRegion, (offset, pattern): (u64, u32)) {
    region.store(offset as usize / WORD_BYTES, pattern);
}

/// Verifies one probe of the global walk.
pub fn address_walk_read(region: &DeviceRegion, ledger: &ErrorLedger, (offset, pattern): (u64, u32)) {
    check(region, ledger, 0, offset as usize / WORD_BYTES, pattern);
}

/// Writes the walk rooted at the start of `block`.
pub fn address_walk_block_write(region: &DeviceRegion, block: BlockRange) {
    for (offset, pattern) in AddressWalk::new(block.start_byte(), block.end_byte()) {
        region.store(offset as usize / WORD_BYTES, pattern);
    }
}

/// Verifies the walk rooted at the start of `block`.
pub fn address_walk_block_read(region: &DeviceRegion, ledger: &ErrorLedger, block: BlockRange) {
    for (offset, pattern) in AddressWalk::new(block.start_byte(), block.end_byte()) {
        check(region, ledger, block.start_word, offset as usize / WORD_BYTES, pattern);
    }
}

// Test 1: own address.

fn wide_words(block: BlockRange) -> std::ops::Range<usize> {
    block.start_word / 2..block.end_word / 2
}

/// Stores every 64-bit word's own address into it.
pub fn own_address_write(region: &DeviceRegion, block: BlockRange) {
    for i in wide_words(block) {
        region.store_wide(i, region.wide_address(i));
    }
}

/// Verifies every 64-bit word still holds its own address.
pub fn own_address_read(region: &DeviceRegion, ledger: &ErrorLedger, block: BlockRange) {
    let start = block.start_word / 2;
    for i in wide_words(block) {
        let expected = region.wide_address(i);
        let observed = region.load_wide(i);
        if observed != expected {
            record_wide(region, ledger, start, i, expected, observed);
        }
    }
}

// Moving inversions (tests 2, 3, 4 and 9).

pub fn move_inv_write(region: &DeviceRegion, block: BlockRange, pattern: u32) {
    for i in block.words() {
        region.store(i, pattern);
    }
}

/// Verifies `p1` and overwrites each word with `p2`.
pub fn move_inv_readwrite(
    region: &DeviceRegion,
    ledger: &ErrorLedger,
    block: BlockRange,
    p1: u32,
    p2: u32,
) {
    for i in block.words() {
        check(region, ledger, block.start_word, i, p1);
        region.store(i, p2);
    }
}

pub fn move_inv_read(region: &DeviceRegion, ledger: &ErrorLedger, block: BlockRange, pattern: u32) {
    for i in block.words() {
        check(region, ledger, block.start_word, i, pattern);
    }
}

// Test 5: block move.

pub fn block_move_init(region: &DeviceRegion, block: BlockRange) {
    for (k, i) in block.words().enumerate() {
        region.store(i, block_move_pattern(k));
    }
}

/// Copies the first half over the second, then rotates it back into the
/// first half shifted by eight words.
pub fn block_move_shift(region: &DeviceRegion, block: BlockRange) {
    let start = block.start_word;
    let half = block.len_words() / 2;
    let mid = start + half;

    for i in 0..half {
        region.store(mid + i, region.load(start + i));
    }
    for i in 0..half - BLOCK_MOVE_SHIFT {
        region.store(start + i + BLOCK_MOVE_SHIFT, region.load(mid + i));
    }
    for i in 0..BLOCK_MOVE_SHIFT {
        region.store(start + i, region.load(mid + half - BLOCK_MOVE_SHIFT + i));
    }
}

/// Verifies that each even word still equals its odd neighbour.
pub fn block_move_check(region: &DeviceRegion, ledger: &ErrorLedger, block: BlockRange) {
    for i in block.words().step_by(2) {
        let expected = region.load(i + 1);
        let observed = region.load(i);
        if observed != expected {
            record(region, ledger, block.start_word, i, expected, observed);
        }
    }
}

// Test 6: 32-bit rotating moving inversions.

pub fn movinv32_write(region: &DeviceRegion, block: BlockRange, seq: RotatingPattern) {
    for (i, pattern) in block.words().zip(seq) {
        region.store(i, pattern);
    }
}

/// Verifies the rotating pattern and overwrites each word with its complement.
pub fn movinv32_readwrite(
    region: &DeviceRegion,
    ledger: &ErrorLedger,
    block: BlockRange,
    seq: RotatingPattern,
) {
    for (i, pattern) in block.words().zip(seq) {
        check(region, ledger, block.start_word, i, pattern);
        region.store(i, !pattern);
    }
}

/// Verifies the complement of the rotating pattern.
pub fn movinv32_read(
    region: &DeviceRegion,
    ledger: &ErrorLedger,
    block: BlockRange,
    seq: RotatingPattern,
) {
    for (i, pattern) in block.words().zip(seq) {
        check(region, ledger, block.start_word, i, !pattern);
    }
}

// Test 7: random sequence, propagated from a seed block.

pub fn random_seq_write(region: &DeviceRegion, block: BlockRange, seed: BlockRange) {
    for (i, s) in block.words().zip(seed.words()) {
        region.store(i, region.load(s));
    }
}

/// Verifies the copy of the seed block and overwrites it with the complement.
pub fn random_seq_readwrite(
    region: &DeviceRegion,
    ledger: &ErrorLedger,
    block: BlockRange,
    seed: BlockRange,
) {
    for (i, s) in block.words().zip(seed.words()) {
        let expected = region.load(s);
        check(region, ledger, block.start_word, i, expected);
        region.store(i, !expected);
    }
}

pub fn random_seq_read(
    region: &DeviceRegion,
    ledger: &ErrorLedger,
    block: BlockRange,
    seed: BlockRange,
) {
    for (i, s) in block.words().zip(seed.words()) {
        check(region, ledger, block.start_word, i, !region.load(s));
    }
}

// Test 8: modulo-N.

/// Writes `p1` at every `MOD_SZ`-th word from `offset`, then `p2` everywhere else.
pub fn modulo_write(region: &DeviceRegion, block: BlockRange, offset: usize, p1: u32, p2: u32) {
    let start = block.start_word;
    for k in (offset..block.len_words()).step_by(MOD_SZ) {
        region.store(start + k, p1);
    }
    for k in 0..block.len_words() {
        if k % MOD_SZ != offset {
            region.store(start + k, p2);
        }
    }
}

/// Verifies only the `p1` positions of phase `offset`.
pub fn modulo_read(region: &DeviceRegion, ledger: &ErrorLedger, block: BlockRange, offset: usize, p1: u32) {
    let start = block.start_word;
    for k in (offset..block.len_words()).step_by(MOD_SZ) {
        check(region, ledger, start, start + k, p1);
    }
}

// Test 10: bandwidth stress over 64-bit words.

pub fn stress_write(region: &DeviceRegion, lane: StressLane, pattern: u64) {
    for i in lane.wide_words() {
        region.store_wide(i, pattern);
    }
}

/// Verifies `p1` and overwrites each word with `p2`.
pub fn stress_readwrite(region: &DeviceRegion, ledger: &ErrorLedger, lane: StressLane, p1: u64, p2: u64) {
    for i in lane.wide_words() {
        let observed = region.load_wide(i);
        if observed != p1 {
            record_wide(region, ledger, lane.chunk_start, i, p1, observed);
        }
        region.store_wide(i, p2);
    }
}
