//! Bloom filter gating tombstone lookups.
//!
//! The filter is an approximate set over record keys: `lookup` may return
//! false positives at the configured rate but never false negatives, so a
//! negative probe lets callers skip the exact tombstone scan entirely.
//!
//! Bit state lives in `AtomicU64` words so the writer can insert while
//! sampler threads probe concurrently. Hash positions come from double
//! hashing over two seeded FNV-1a hashes; each filter instance draws its
//! own seed pair from a process-wide counter run through splitmix64, so
//! filters are independently seeded.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::record::Key;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

const GOLDEN_GAMMA: u64 = 0x9e3779b97f4a7c15;

static SEED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Approximate membership filter over record keys.
#[derive(Debug)]
pub struct BloomFilter {
    words: Vec<AtomicU64>,
    bit_count: usize,
    hash_count: u32,
    seeds: (u64, u64),
}

impl BloomFilter {
    /// Create a filter sized for `expected` keys at false positive rate
    /// `fpr`, probing with `hash_count` hash functions.
    pub fn new(fpr: f64, expected: usize, hash_count: u32) -> Self {
        let bit_count = Self::optimal_bit_count(expected, fpr);
        let word_count = (bit_count + 63) / 64;
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        let nonce = SEED_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            words,
            bit_count,
            hash_count: hash_count.max(1),
            seeds: (
                splitmix64(nonce.wrapping_mul(2).wrapping_add(1)),
                splitmix64(nonce.wrapping_mul(2).wrapping_add(2)),
            ),
        }
    }

    /// Optimal bit count `m = -n ln p / ln^2 2`, with a floor of one word.
    fn optimal_bit_count(expected: usize, fpr: f64) -> usize {
        if expected == 0 {
            return 64;
        }
        let n = expected as f64;
        let p = fpr.clamp(0.0001, 0.9999);
        let bits = (-n * p.ln() / 2.0_f64.ln().powi(2)).ceil() as usize;
        bits.max(64)
    }

    /// Insert a key.
    pub fn insert(&self, key: Key) {
        let (h1, h2) = self.hash_pair(key);
        for i in 0..self.hash_count {
            let bit = self.position(h1, h2, i);
            self.words[bit / 64].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    /// Probe for a key. False positives possible, false negatives not.
    pub fn lookup(&self, key: Key) -> bool {
        let (h1, h2) = self.hash_pair(key);
        for i in 0..self.hash_count {
            let bit = self.position(h1, h2, i);
            if self.words[bit / 64].load(Ordering::Relaxed) & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Reset the filter to empty.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Bytes of bit state held by the filter.
    pub fn memory_bytes(&self) -> usize {
        self.words.len() * 8
    }

    fn hash_pair(&self, key: Key) -> (u64, u64) {
        let bytes = key.to_be_bytes();
        (fnv1a(&bytes, self.seeds.0), fnv1a(&bytes, self.seeds.1))
    }

    // Double hashing: position_i = h1 + i * h2 (mod bit_count).
    fn position(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.bit_count as u64) as usize
    }
}

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    let mut state = FNV_OFFSET_BASIS ^ seed;
    for &byte in bytes {
        state ^= byte as u64;
        state = state.wrapping_mul(FNV_PRIME);
    }
    state
}

// Standard splitmix64 seed expansion.
fn splitmix64(input: u64) -> u64 {
    let mut z = input.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let filter = BloomFilter::new(0.01, 1000, 3);
        for key in 0..1000u64 {
            filter.insert(key);
        }
        for key in 0..1000u64 {
            assert!(filter.lookup(key), "false negative for key {key}");
        }
    }

    #[test]
    fn test_false_positive_rate() {
        let n = 10_000usize;
        let filter = BloomFilter::new(0.01, n, 3);
        for key in 0..n as u64 {
            filter.insert(key);
        }

        let mut false_positives = 0;
        for key in n as u64..(2 * n) as u64 {
            if filter.lookup(key) {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / n as f64;
        assert!(rate < 0.05, "false positive rate too high: {rate}");
    }

    #[test]
    fn test_clear() {
        let filter = BloomFilter::new(0.01, 100, 3);
        for key in 0..100u64 {
            filter.insert(key);
        }
        filter.clear();

        let hits = (0..100u64).filter(|&k| filter.lookup(k)).count();
        assert_eq!(hits, 0);
    }

    #[test]
    fn test_empty_filter_rejects() {
        let filter = BloomFilter::new(0.01, 0, 3);
        assert!(!filter.lookup(42));
        assert!(filter.memory_bytes() >= 8);
    }

    #[test]
    fn test_instances_are_independently_seeded() {
        let a = BloomFilter::new(0.01, 100, 3);
        let b = BloomFilter::new(0.01, 100, 3);
        assert_ne!(a.seeds, b.seeds);
    }
}
