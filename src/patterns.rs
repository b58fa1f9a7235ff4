//! Pattern generation for memory testing.
//!
//! Random patterns are seeded from the wall clock on every call, so two
//! runs never share a stream. Callers that need reproducibility pass an
//! explicit pattern through the configuration instead.

use crate::error::VramscanError;
use rand::{Rng, SeedableRng};
use std::ops::Not;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of rotation steps before a rotating pattern restarts.
pub const ROTATION_PERIOD: u32 = 32;

/// Word stride of the modulo-N test.
pub const MOD_SZ: usize = 20;

/// Words per shifted-pattern group in the block-move test.
pub const BLOCK_MOVE_GROUP: usize = 16;

fn time_seeded_rng() -> Result<rand::rngs::StdRng, VramscanError> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(rand::rngs::StdRng::seed_from_u64(now.as_nanos() as u64))
}

/// Returns a fresh 32-bit random pattern.
pub fn random_pattern32() -> Result<u32, VramscanError> {
    Ok(time_seeded_rng()?.gen())
}

/// Returns a fresh 64-bit random pattern.
pub fn random_pattern64() -> Result<u64, VramscanError> {
    Ok(time_seeded_rng()?.gen())
}

/// Fills `words` 32-bit words from a single time-seeded stream.
pub fn random_block(words: usize) -> Result<Vec<u32>, VramscanError> {
    let mut rng = time_seeded_rng()?;
    Ok((0..words).map(|_| rng.gen()).collect())
}

/// Bitwise complement of a pattern, same width.
pub fn complement<T: Not<Output = T>>(pattern: T) -> T {
    !pattern
}

/// Replicates an 8-bit value across every byte of a 32-bit word.
pub fn replicate_byte(byte: u8) -> u32 {
    u32::from_ne_bytes([byte; 4])
}

/// Per-word pattern sequence of the 32-bit moving-inversions test.
///
/// Each step shifts the pattern left by one and ORs in the carry bit.
/// After [`ROTATION_PERIOD`] steps, counted from the starting bit offset,
/// the sequence jumps back to the restart value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotatingPattern {
    current: u32,
    restart: u32,
    carry: u32,
    step: u32,
}

impl RotatingPattern {
    /// Creates a sequence starting at `pattern` with rotation counter `offset`.
    pub fn new(pattern: u32, restart: u32, carry: u32, offset: u32) -> Self {
        Self {
            current: pattern,
            restart,
            carry,
            step: offset % ROTATION_PERIOD,
        }
    }

    /// Sequence whose ones rotate through zeros: `1 << offset`, restarting at 1.
    pub fn ones(offset: u32) -> Self {
        Self::new(1u32 << (offset % ROTATION_PERIOD), 1, 0, offset)
    }

    /// Sequence whose zero rotates through ones: `!(1 << offset)`, restarting at `!1`.
    pub fn zeros(offset: u32) -> Self {
        Self::new(!(1u32 << (offset % ROTATION_PERIOD)), 0xFFFF_FFFE, 1, offset)
    }

    /// The pattern for the current word.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Advances to the next word's pattern.
    pub fn rotate_left_with_carry(&mut self) {
        self.step += 1;
        if self.step >= ROTATION_PERIOD {
            self.step = 0;
            self.current = self.restart;
        } else {
            self.current = (self.current << 1) | self.carry;
        }
    }
}

impl Iterator for RotatingPattern {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let value = self.current;
        self.rotate_left_with_carry();
        Some(value)
    }
}

/// Probe sequence of the address-line walk.
///
/// Yields `(byte_offset, pattern)` pairs: the root itself with pattern 1,
/// then `root | (4 << j)` for growing `j` while below `limit`, the pattern
/// shifting left once per probe. Offsets that collapse onto the root are
/// skipped without consuming a pattern bit.
#[derive(Debug, Clone)]
pub struct AddressWalk {
    root: u64,
    limit: u64,
    mask: u64,
    pattern: u32,
    root_emitted: bool,
}

impl AddressWalk {
    pub fn new(root: u64, limit: u64) -> Self {
        Self {
            root,
            limit,
            mask: 4,
            pattern: 1,
            root_emitted: false,
        }
    }
}

impl Iterator for AddressWalk {
    type Item = (u64, u32);

    fn next(&mut self) -> Option<(u64, u32)> {
        if !self.root_emitted {
            self.root_emitted = true;
            return (self.root < self.limit).then_some((self.root, self.pattern));
        }
        loop {
            if self.mask == 0 {
                return None;
            }
            let probe = self.root | self.mask;
            if probe == self.root {
                self.mask <<= 1;
                continue;
            }
            if probe >= self.limit {
                return None;
            }
            let pattern = self.pattern;
            self.pattern <<= 1;
            self.mask <<= 1;
            return Some((probe, pattern));
        }
    }
}

/// Initial content of word `index` in the block-move test.
///
/// Groups of 16 words hold `p, p, !p, !p` four times, where `p` is a single
/// bit that walks one position per group.
pub fn block_move_pattern(index: usize) -> u32 {
    let group = index / BLOCK_MOVE_GROUP;
    let p = 1u32 << (group as u32 % 32);
    if (index % BLOCK_MOVE_GROUP / 2) % 2 == 0 {
        p
    } else {
        !p
    }
}

/// Content of word `index` during modulo-N phase `offset`.
#[cfg(test)]
pub fn modulo_pattern(index: usize, offset: usize, p1: u32, p2: u32) -> u32 {
    if index % MOD_SZ == offset {
        p1
    } else {
        p2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complement_involution() {
        for p in [0u32, 1, 0x8080_8080, 0xDEAD_BEEF, u32::MAX] {
            assert_eq!(complement(complement(p)), p);
            assert_eq!(p ^ complement(p), u32::MAX);
        }
        for p in [0u64, 0x0123_4567_89AB_CDEF, u64::MAX] {
            assert_eq!(complement(complement(p)), p);
        }
    }

    #[test]
    fn test_random_patterns_generate() {
        assert!(random_pattern32().is_ok());
        assert!(random_pattern64().is_ok());
    }

    #[test]
    fn test_random_block_length() {
        let block = random_block(1024).unwrap();
        assert_eq!(block.len(), 1024);
        // A 1024-word stream of identical values would mean a broken generator.
        assert!(block.iter().any(|&w| w != block[0]));
    }

    #[test]
    fn test_replicate_byte() {
        assert_eq!(replicate_byte(0x80), 0x8080_8080);
        assert_eq!(replicate_byte(0x00), 0);
        assert_eq!(replicate_byte(0xFF), u32::MAX);
    }

    #[test]
    fn test_rotating_pattern_cycle_law() {
        for offset in 0..32 {
            let mut seq = RotatingPattern::ones(offset);
            // Run until the first restart, then one full period.
            let to_restart = ROTATION_PERIOD - offset;
            for _ in 0..to_restart {
                seq.rotate_left_with_carry();
            }
            assert_eq!(seq.current(), 1, "offset {offset}");
            let restart_state = seq;
            for _ in 0..ROTATION_PERIOD {
                seq.rotate_left_with_carry();
            }
            assert_eq!(seq, restart_state, "offset {offset}");
        }
    }

    #[test]
    fn test_rotating_pattern_ones_sequence() {
        let seq: Vec<u32> = RotatingPattern::ones(0).take(34).collect();
        for (i, &value) in seq.iter().take(32).enumerate() {
            assert_eq!(value, 1u32 << i);
        }
        assert_eq!(seq[32], 1);
        assert_eq!(seq[33], 2);
    }

    #[test]
    fn test_rotating_pattern_zeros_sequence() {
        let seq: Vec<u32> = RotatingPattern::zeros(30).take(4).collect();
        assert_eq!(seq[0], !(1u32 << 30));
        assert_eq!(seq[1], !(1u32 << 31));
        assert_eq!(seq[2], 0xFFFF_FFFE);
        assert_eq!(seq[3], 0xFFFF_FFFD);
    }

    #[test]
    fn test_address_walk_from_zero() {
        let probes: Vec<(u64, u32)> = AddressWalk::new(0, 64).collect();
        assert_eq!(probes, vec![(0, 1), (4, 1), (8, 2), (16, 4), (32, 8)]);
    }

    #[test]
    fn test_address_walk_block_root() {
        let root = 4096;
        let probes: Vec<(u64, u32)> = AddressWalk::new(root, root + 4096).collect();
        assert_eq!(probes.first(), Some(&(root, 1)));
        assert_eq!(probes.last(), Some(&(root + 2048, 1 << 9)));
        assert!(probes.iter().all(|&(off, _)| off >= root && off < root + 4096));
    }

    #[test]
    fn test_address_walk_skips_root_bits() {
        // Root already has bit 2 set: that probe collapses onto the root.
        let probes: Vec<(u64, u32)> = AddressWalk::new(4, 32).collect();
        assert_eq!(probes, vec![(4, 1), (12, 1), (20, 2)]);
    }

    #[test]
    fn test_address_walk_pattern_wraps_to_zero() {
        let probes: Vec<(u64, u32)> = AddressWalk::new(0, 1 << 40).collect();
        assert_eq!(probes.len(), 39);
        assert_eq!(probes.last().map(|p| p.1), Some(0));
    }

    #[test]
    fn test_block_move_pattern_pairs() {
        for i in (0..4096).step_by(2) {
            assert_eq!(block_move_pattern(i), block_move_pattern(i + 1));
        }
        assert_eq!(block_move_pattern(0), 1);
        assert_eq!(block_move_pattern(2), !1);
        assert_eq!(block_move_pattern(16), 2);
        assert_eq!(block_move_pattern(16 * 32), 1);
    }

    #[test]
    fn test_modulo_phase_coverage() {
        let words = 1000;
        let (p1, p2) = (0x1234_5678, !0x1234_5678);
        let mut p1_hits = vec![0u32; words];
        for offset in 0..MOD_SZ {
            for (i, hits) in p1_hits.iter_mut().enumerate() {
                if modulo_pattern(i, offset, p1, p2) == p1 {
                    *hits += 1;
                }
            }
        }
        assert!(p1_hits.iter().all(|&h| h == 1));
    }
}
