//! Deterministic key generation.
//!
//! Key `i` is always the same string: its length comes from the key-size
//! generator evaluated at a hash of `i`, and the key itself is `i`
//! zero-padded to that length. The loader and the issuing path therefore
//! agree on the key space without sharing any state.

use super::generator::Generator;

/// Maximum key length allowed by the memcached protocol.
pub const MAX_KEY_LENGTH: usize = 250;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Maps key indices in `[0, records)` to key strings.
pub struct KeyGenerator {
    keysize: Box<dyn Generator>,
}

impl KeyGenerator {
    pub fn new(keysize: Box<dyn Generator>) -> Self {
        Self { keysize }
    }

    /// Key string for index `index`.
    pub fn generate(&self, index: u64) -> String {
        let u = fnv1a_64(index) as f64 / u64::MAX as f64;
        let width = self.keysize.generate(u).round();
        let width = if width.is_finite() {
            (width as usize).clamp(1, MAX_KEY_LENGTH)
        } else {
            1
        };
        format!("{:0width$}", index, width = width)
    }
}

fn fnv1a_64(value: u64) -> u64 {
    value
        .to_le_bytes()
        .iter()
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::Distribution;

    #[test]
    fn test_fixed_width_keys() {
        let keygen = KeyGenerator::new(Box::new(Distribution::Fixed(8.0)));
        assert_eq!(keygen.generate(42), "00000042");
        assert_eq!(keygen.generate(0), "00000000");
    }

    #[test]
    fn test_keys_are_deterministic() {
        let keygen = KeyGenerator::new(Box::new(Distribution::facebook_key()));
        for i in 0..100 {
            assert_eq!(keygen.generate(i), keygen.generate(i));
        }
    }

    #[test]
    fn test_width_is_capped() {
        let keygen = KeyGenerator::new(Box::new(Distribution::Fixed(10_000.0)));
        assert_eq!(keygen.generate(7).len(), MAX_KEY_LENGTH);
    }

    #[test]
    fn test_index_wider_than_size() {
        let keygen = KeyGenerator::new(Box::new(Distribution::Fixed(2.0)));
        assert_eq!(keygen.generate(12345), "12345");
    }
}
