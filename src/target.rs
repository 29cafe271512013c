//! Target threshold and compact "bits" arithmetic
//!
//! A target is a 256-bit big-endian threshold. Nodes ship it in full, but
//! headers carry it in the 32-bit compact form: one exponent byte followed by
//! a 23-bit mantissa and a sign bit. Difficulty is derived from the target as
//! a floating-point ratio and is only ever used for reporting.

use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of a target in bytes
pub const TARGET_SIZE: usize = 32;

/// Numeric value of the maximum (all-0xff) target, i.e. difficulty 1
pub const DIFF_ONE: f64 =
    115792089237316195423570985008687907853269984665640564039457584007913129639936.0;

/// Mining target: a solution hash must be numerically <= this value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target([u8; TARGET_SIZE]);

impl Target {
    /// Create a target from big-endian bytes
    pub fn new(bytes: [u8; TARGET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a target from a big-endian slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; TARGET_SIZE] = bytes.try_into().map_err(|_| {
            Error::bad_target_size(format!("expected {} bytes, got {}", TARGET_SIZE, bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != TARGET_SIZE * 2 {
            return Err(Error::bad_target_size(format!(
                "expected {} hex chars, got {}",
                TARGET_SIZE * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| Error::bad_target_size(format!("invalid hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Decode a compact bits value
    pub fn from_bits(bits: u32) -> Result<Self> {
        to_target(bits).map(Self)
    }

    /// Maximum possible target (easiest difficulty)
    pub fn max() -> Self {
        Self([0xff; TARGET_SIZE])
    }

    /// Big-endian bytes
    pub fn as_bytes(&self) -> &[u8; TARGET_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compact encoding of this target
    pub fn to_bits(&self) -> u32 {
        to_bits(&self.0)
    }

    /// Check whether a big-endian hash satisfies this target
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        hash.as_slice() <= self.0.as_slice()
    }

    /// Approximate difficulty for reporting
    pub fn difficulty(&self) -> f64 {
        to_difficulty(&self.0)
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Target {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Target::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Encode a big-endian target as compact bits.
///
/// Compaction is lossy: only the three most significant bytes survive, or two
/// when the leading byte would set the sign bit.
pub fn to_bits(target: &[u8; TARGET_SIZE]) -> u32 {
    let first = match target.iter().position(|&b| b != 0) {
        Some(i) => i,
        None => return 0,
    };

    let mut exponent = (TARGET_SIZE - first) as u32;
    let end = (first + 3).min(TARGET_SIZE);

    let mut mantissa = target[first..end]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32);

    if exponent < 3 {
        mantissa <<= 8 * (3 - exponent);
    }

    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        exponent += 1;
    }

    (exponent << 24) | mantissa
}

/// Decode compact bits into a big-endian target
pub fn to_target(bits: u32) -> Result<[u8; TARGET_SIZE]> {
    if bits == 0 {
        return Err(Error::InvalidTarget);
    }

    if (bits >> 23) & 1 == 1 {
        return Err(Error::NegativeTarget);
    }

    let exponent = bits >> 24;
    let mut mantissa = bits & 0x007f_ffff;

    let shift = if exponent <= 3 {
        mantissa >>= 8 * (3 - exponent);
        0
    } else {
        (exponent - 3) as i64
    };

    let mut target = [0u8; TARGET_SIZE];
    let mut i = (TARGET_SIZE as i64 - 1) - shift;

    while mantissa != 0 && i >= 0 {
        target[i as usize] = (mantissa & 0xff) as u8;
        mantissa >>= 8;
        i -= 1;
    }

    if mantissa != 0 {
        return Err(Error::TargetOverflow);
    }

    Ok(target)
}

/// Approximate a 256-bit big-endian value as f64
pub fn to_double(target: &[u8; TARGET_SIZE]) -> f64 {
    target
        .chunks_exact(8)
        .enumerate()
        .map(|(i, word)| {
            let scale = 2f64.powi(64 * (3 - i as i32));
            BigEndian::read_u64(word) as f64 * scale
        })
        .sum()
}

/// Difficulty of a target relative to [`DIFF_ONE`]
pub fn to_difficulty(target: &[u8; TARGET_SIZE]) -> f64 {
    let n = to_double(target);

    if n == 0.0 {
        return DIFF_ONE;
    }

    (DIFF_ONE / n).floor()
}

/// Difficulty of a found hash, used for best-share reporting
pub fn to_share(hash: &[u8; 32]) -> f64 {
    to_difficulty(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn target_hex(s: &str) -> [u8; 32] {
        let mut padded = s.to_string();
        while padded.len() < 64 {
            padded.push('0');
        }
        hex::decode(padded).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_mainnet_limit_bits() {
        let target = to_target(0x1d00ffff).unwrap();
        assert_eq!(target, target_hex("00000000ffff"));
        assert_eq!(to_bits(&target), 0x1d00ffff);
    }

    #[test]
    fn test_regtest_limit_bits() {
        let target = to_target(0x207fffff).unwrap();
        assert_eq!(target, target_hex("7fffff"));
        assert_eq!(to_bits(&target), 0x207fffff);
    }

    #[test]
    fn test_sign_bit_moves_into_exponent() {
        assert_eq!(to_bits(&[0xff; 32]), 0x2100ffff);
        assert_eq!(to_bits(&target_hex("0030")), 0x1f300000);

        let mut low = [0u8; 32];
        low[31] = 0x80;
        assert_eq!(to_bits(&low), 0x02008000);
        assert_eq!(to_target(0x02008000).unwrap(), low);
    }

    #[test]
    fn test_small_exponents() {
        let mut t = [0u8; 32];
        t[30] = 0x12;
        t[31] = 0x34;
        assert_eq!(to_bits(&t), 0x02123400);
        assert_eq!(to_target(0x02123400).unwrap(), t);
        assert_eq!(to_bits(&[0u8; 32]), 0);
    }

    #[test]
    fn test_to_target_errors() {
        assert_matches!(to_target(0), Err(Error::InvalidTarget));
        assert_matches!(to_target(0x1d800000), Err(Error::NegativeTarget));
        assert_matches!(to_target(0x2200ffff), Err(Error::TargetOverflow));
        assert_matches!(to_target(0x23000001), Err(Error::TargetOverflow));
        assert_matches!(to_target(0xff000001), Err(Error::TargetOverflow));
    }

    #[test]
    fn test_zero_mantissa_decodes_to_zero() {
        assert_eq!(to_target(0x05000000).unwrap(), [0u8; 32]);
    }

    #[test]
    fn test_to_double() {
        assert_eq!(to_double(&[0u8; 32]), 0.0);

        let mut one = [0u8; 32];
        one[31] = 1;
        assert_eq!(to_double(&one), 1.0);

        let mut high = [0u8; 32];
        high[7] = 1;
        assert_eq!(to_double(&high), 2f64.powi(192));

        assert_eq!(to_double(&[0xff; 32]), DIFF_ONE);
    }

    #[test]
    fn test_difficulty() {
        assert_eq!(to_difficulty(&[0xff; 32]), 1.0);
        assert_eq!(to_difficulty(&[0u8; 32]), DIFF_ONE);

        // 0x0030.. is 2^256 * 48 / 65536 up to rounding
        let d = to_difficulty(&target_hex("0030"));
        assert_eq!(d, 1365.0);

        assert_eq!(to_share(&target_hex("0030")), d);
    }

    #[test]
    fn test_target_comparison() {
        let target = Target::new(target_hex("0030"));
        assert!(target.is_met_by(&target_hex("002fff")));
        assert!(target.is_met_by(&target_hex("0030")));
        assert!(!target.is_met_by(&target_hex("003001")));
        assert!(!target.is_met_by(&[0xff; 32]));
    }

    #[test]
    fn test_target_hex() {
        let hex = "0030000000000000000000000000000000000000000000000000000000000000";
        let target: Target = hex.parse().unwrap();
        assert_eq!(target.to_hex(), hex);
        assert_eq!(target.to_bits(), 0x1f300000);

        assert_matches!(Target::from_hex("00"), Err(Error::BadTargetSize { .. }));
        assert_matches!(Target::from_slice(&[0u8; 31]), Err(Error::BadTargetSize { .. }));
    }

    #[test]
    fn test_target_serde() {
        let target = Target::from_bits(0x1d00ffff).unwrap();
        let json = serde_json::to_string(&target).unwrap();
        let back: Target = serde_json::from_str(&json).unwrap();
        assert_eq!(back, target);
    }

    proptest! {
        #[test]
        fn prop_compact_form_is_fixed_point(bytes in any::<[u8; 32]>()) {
            let bits = to_bits(&bytes);
            prop_assume!(bits != 0);
            let target = to_target(bits).unwrap();
            prop_assert_eq!(to_bits(&target), bits);
        }

        #[test]
        fn prop_compaction_only_loses_low_bytes(bytes in any::<[u8; 32]>()) {
            let first = bytes.iter().position(|&b| b != 0);
            prop_assume!(first.is_some());
            let first = first.unwrap();

            let recovered = to_target(to_bits(&bytes)).unwrap();
            prop_assert!(recovered <= bytes);

            let kept = (first + 2).min(32);
            prop_assert_eq!(&recovered[..kept], &bytes[..kept]);
        }
    }
}
