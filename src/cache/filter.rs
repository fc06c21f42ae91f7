//! Existence Filter
//!
//! Bloom filter over cache keys. A negative answer is definitive, a positive
//! answer only means "possibly present". Keys are never removed.
//!
//! # Sizing
//!
//! For `n` expected insertions and a target false-positive rate `ε`:
//! - `m = -n ln ε / (ln 2)^2` bits (rounded up to whole 64-bit words)
//! - `k = (m / n) ln 2` probes
//!
//! Probes use double hashing, `g_i = h1 + i * h2`, so only two hashes are
//! computed per key.
//!
//! # Concurrency
//!
//! Bits live in `AtomicU64` words. Inserts are `fetch_or`, reads are plain
//! loads, so readers and writers never block each other.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use twox_hash::XxHash64;

use crate::error::{Error, Result};

const SEED_PRIMARY: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED_SECONDARY: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// Filter sizing
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    /// Expected number of distinct keys
    pub expected_insertions: u64,
    /// Target false-positive probability at `expected_insertions`
    pub false_positive_rate: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            expected_insertions: 1_000_000,
            false_positive_rate: 0.01,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.expected_insertions == 0 {
            return Err(Error::Config(
                "filter expected_insertions must be greater than 0".to_string(),
            ));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(Error::Config(format!(
                "filter false_positive_rate must be in (0, 1), got {}",
                self.false_positive_rate
            )));
        }
        Ok(())
    }

    /// Optimal number of bits, rounded up to a multiple of 64.
    pub fn optimal_bits(&self) -> u64 {
        let n = self.expected_insertions as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * self.false_positive_rate.ln() / (ln2 * ln2)).ceil() as u64;
        m.max(64).div_ceil(64) * 64
    }

    /// Optimal number of probes for `bits` bits.
    pub fn optimal_hashes(&self, bits: u64) -> u32 {
        let k = (bits as f64 / self.expected_insertions as f64) * std::f64::consts::LN_2;
        (k.round() as u32).max(1)
    }
}

/// Thread-safe, append-only existence filter.
pub struct ExistenceFilter {
    words: Box<[AtomicU64]>,
    bits: u64,
    hashes: u32,
    insertions: AtomicU64,
    config: FilterConfig,
}

impl ExistenceFilter {
    /// Create a filter with the default sizing (1,000,000 keys at 1%).
    pub fn new() -> Self {
        Self::build(FilterConfig::default())
    }

    /// Create a filter sized by `config`.
    pub fn with_config(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: FilterConfig) -> Self {
        let bits = config.optimal_bits();
        let hashes = config.optimal_hashes(bits);
        let words: Vec<AtomicU64> = (0..bits / 64).map(|_| AtomicU64::new(0)).collect();

        Self {
            words: words.into_boxed_slice(),
            bits,
            hashes,
            insertions: AtomicU64::new(0),
            config,
        }
    }

    /// `false` means the key was definitely never added.
    pub fn might_contain(&self, key: &str) -> bool {
        self.probes(key).all(|bit| {
            let word = self.words[(bit / 64) as usize].load(Ordering::Acquire);
            word & (1u64 << (bit % 64)) != 0
        })
    }

    /// Register a key. Idempotent.
    ///
    /// Returns `true` if at least one bit changed, i.e. the key was not
    /// already (possibly falsely) reported present.
    pub fn add(&self, key: &str) -> bool {
        let mut changed = false;
        for bit in self.probes(key) {
            let mask = 1u64 << (bit % 64);
            let previous = self.words[(bit / 64) as usize].fetch_or(mask, Ordering::AcqRel);
            changed |= previous & mask == 0;
        }
        if changed {
            self.insertions.fetch_add(1, Ordering::Relaxed);
        }
        changed
    }

    /// Number of adds that changed the filter. Undercounts keys that
    /// collided completely with earlier keys.
    pub fn approximate_len(&self) -> u64 {
        self.insertions.load(Ordering::Relaxed)
    }

    pub fn bit_count(&self) -> u64 {
        self.bits
    }

    pub fn hash_count(&self) -> u32 {
        self.hashes
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Estimated false-positive probability at the current fill level.
    pub fn expected_fpp(&self) -> f64 {
        let set_bits: u64 = self
            .words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum();
        (set_bits as f64 / self.bits as f64).powi(self.hashes as i32)
    }

    fn probes(&self, key: &str) -> impl Iterator<Item = u64> {
        let h1 = hash_with_seed(key, SEED_PRIMARY);
        let h2 = hash_with_seed(key, SEED_SECONDARY);
        let bits = self.bits;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(h2.wrapping_mul(i)) % bits)
    }
}

impl Default for ExistenceFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExistenceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExistenceFilter")
            .field("bits", &self.bits)
            .field("hashes", &self.hashes)
            .field("insertions", &self.approximate_len())
            .finish()
    }
}

fn hash_with_seed(key: &str, seed: u64) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    hasher.write(key.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_filter(n: u64, p: f64) -> ExistenceFilter {
        ExistenceFilter::with_config(FilterConfig {
            expected_insertions: n,
            false_positive_rate: p,
        })
        .unwrap()
    }

    #[test]
    fn test_default_sizing() {
        let filter = ExistenceFilter::new();
        // ~9.59M bits and 7 probes for 1M keys at 1%
        assert!(filter.bit_count() > 9_500_000 && filter.bit_count() < 9_700_000);
        assert_eq!(filter.bit_count() % 64, 0);
        assert_eq!(filter.hash_count(), 7);
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let filter = small_filter(1_000, 0.01);
        assert!(!filter.might_contain("cache:shop:1"));
        assert_eq!(filter.approximate_len(), 0);
        assert_eq!(filter.expected_fpp(), 0.0);
    }

    #[test]
    fn test_add_is_idempotent() {
        let filter = small_filter(1_000, 0.01);
        assert!(filter.add("cache:shop:1"));
        assert!(!filter.add("cache:shop:1"));
        assert!(filter.might_contain("cache:shop:1"));
        assert_eq!(filter.approximate_len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let zero = FilterConfig {
            expected_insertions: 0,
            false_positive_rate: 0.01,
        };
        assert!(ExistenceFilter::with_config(zero).is_err());

        let bad_rate = FilterConfig {
            expected_insertions: 10,
            false_positive_rate: 1.5,
        };
        assert!(ExistenceFilter::with_config(bad_rate).is_err());
    }

    #[test]
    fn test_false_positive_rate_within_bound() {
        let filter = small_filter(10_000, 0.01);
        for i in 0..10_000 {
            filter.add(&format!("cache:shop:{}", i));
        }

        let sample = 100_000;
        let false_positives = (10_000..10_000 + sample)
            .filter(|i| filter.might_contain(&format!("cache:shop:{}", i)))
            .count();
        let rate = false_positives as f64 / sample as f64;

        // Allow sampling slack over the configured 1%
        assert!(rate < 0.02, "false positive rate too high: {}", rate);
        assert!(filter.expected_fpp() < 0.02);
    }

    #[test]
    fn test_concurrent_inserts_have_no_false_negatives() {
        use std::sync::Arc;
        use std::thread;

        let filter = Arc::new(small_filter(40_000, 0.01));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let filter = Arc::clone(&filter);
                thread::spawn(move || {
                    for i in 0..5_000 {
                        filter.add(&format!("cache:shop:{}-{}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..8 {
            for i in 0..5_000 {
                assert!(filter.might_contain(&format!("cache:shop:{}-{}", t, i)));
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: every inserted key is reported present.
        #[test]
        fn prop_no_false_negatives(keys in prop::collection::vec("[a-z0-9:]{1,24}", 1..200)) {
            let filter = small_filter(1_000, 0.01);
            for key in &keys {
                filter.add(key);
            }
            for key in &keys {
                prop_assert!(filter.might_contain(key));
            }
        }
    }
}
