//! Core types for round mining
//!
//! Fixed-size hashes, 64-bit targets, nonces and the per-round records that flow
//! between device workers and the round coordinator.

use crate::{Error, Result};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Length of a header hash in bytes
pub const HASH_LENGTH: usize = 32;

/// Copy `src` into `dst` right-aligned.
///
/// A longer source keeps only its trailing `dst.len()` bytes; a shorter one is
/// preceded by zero bytes. Both hashes and the verification table image follow
/// this rule, so numeric comparisons against targets line up.
pub fn copy_right_aligned(dst: &mut [u8], src: &[u8]) {
    let src = if src.len() > dst.len() {
        &src[src.len() - dst.len()..]
    } else {
        src
    };
    let offset = dst.len() - src.len();
    dst[..offset].fill(0);
    dst[offset..].copy_from_slice(src);
}

/// Fixed 32-byte hash value
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// Create a hash from exactly 32 bytes
    pub const fn new(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create a hash from a slice of any length using the right-aligned rule
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut hash = [0u8; HASH_LENGTH];
        copy_right_aligned(&mut hash, bytes);
        Self(hash)
    }

    /// Replace the value from a slice of any length using the right-aligned rule
    pub fn set_bytes(&mut self, bytes: &[u8]) {
        copy_right_aligned(&mut self.0, bytes);
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Convert to a lowercase hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a hexadecimal string, applying the right-aligned rule
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)
            .map_err(|e| Error::malformed_work(format!("Invalid hex in header hash: {}", e)))?;
        Ok(Self::from_slice(&bytes))
    }

    /// Interpret the hash as a big-endian unsigned integer
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Mining target: the largest search output that still qualifies
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(pub u64);

impl Target {
    /// Create a new target
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the target value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Easiest possible target: every output below 2^64 qualifies
    pub const fn max() -> Self {
        Self(u64::MAX)
    }

    /// Hardest possible target: only an all-zero output qualifies
    pub const fn min() -> Self {
        Self(0)
    }

    /// Check whether a search output meets this target
    ///
    /// The output is read as a 256-bit big-endian integer and must be less than
    /// or equal to the target. Any non-zero byte above the low 64 bits means the
    /// output is larger than every possible target.
    pub fn is_met_by(self, output: &Hash) -> bool {
        let bytes = output.as_bytes();
        let (high, low) = bytes.split_at(HASH_LENGTH - 8);
        if high.iter().any(|&b| b != 0) {
            return false;
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(low);
        u64::from_be_bytes(word) <= self.0
    }

    /// Build a target from big-endian bytes of arbitrary width
    ///
    /// Values wider than 64 bits saturate to `u64::MAX`; the second element of the
    /// returned pair reports whether saturation happened.
    pub fn from_be_bytes_saturating(bytes: &[u8]) -> (Self, bool) {
        let value = BigUint::from_bytes_be(bytes);
        match value.to_u64() {
            Some(v) => (Self(v), false),
            None => (Self(u64::MAX), true),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for Target {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Proof-of-work nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(pub u64);

impl Nonce {
    /// Create a new nonce
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the nonce value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Return the nonce advanced by `count`, wrapping at `u64::MAX`
    pub fn advanced(self, count: u64) -> Self {
        Self(self.0.wrapping_add(count))
    }

    /// Advance in place, wrapping at `u64::MAX`
    pub fn advance(&mut self, count: u64) {
        self.0 = self.0.wrapping_add(count);
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Nonce {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifier of a compute device as given on the command line
pub type DeviceId = usize;

/// One unit of work: a header hash to search against a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub header_hash: Hash,
    pub target: Target,
    /// Header hash exactly as the work source sent it, echoed back on submit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wire_hash: Option<String>,
}

impl Problem {
    /// Create a new problem
    pub fn new(header_hash: Hash, target: Target) -> Self {
        Self {
            header_hash,
            target,
            wire_hash: None,
        }
    }

    /// Remember the header hash as it appeared on the wire
    pub fn with_wire_hash(mut self, wire_hash: impl Into<String>) -> Self {
        self.wire_hash = Some(wire_hash.into());
        self
    }

    /// Header hash to hand back to the work source
    pub fn submission_hash(&self) -> String {
        self.wire_hash
            .clone()
            .unwrap_or_else(|| self.header_hash.to_hex())
    }
}

/// What a single device worker reports when its search stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchResult {
    /// Nonces tried since this search started
    pub hashes_attempted: u64,
    /// Winning nonce; only meaningful when `found` is set
    pub nonce: Nonce,
    pub found: bool,
}

impl SearchResult {
    /// A search that stopped without a qualifying nonce
    pub fn exhausted(hashes_attempted: u64) -> Self {
        Self {
            hashes_attempted,
            nonce: Nonce::default(),
            found: false,
        }
    }

    /// A search that found a qualifying nonce
    pub fn solved(hashes_attempted: u64, nonce: Nonce) -> Self {
        Self {
            hashes_attempted,
            nonce,
            found: true,
        }
    }

    /// The winning nonce, if any
    pub fn solution(&self) -> Option<Nonce> {
        self.found.then_some(self.nonce)
    }
}

/// Aggregate of one complete round, built only after the barrier
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    /// Sequence number of the round, starting at 1
    pub round: u64,
    pub problem: Problem,
    /// Sum of `hashes_attempted` over every dispatched worker
    pub total_hashes: u64,
    /// First qualifying nonce in arrival order
    pub winner: Option<Winner>,
    /// Number of workers dispatched this round
    pub workers: usize,
    /// Workers whose device reported an error
    pub failed_workers: usize,
    /// The round was cancelled because the work source moved on
    pub preempted: bool,
    pub elapsed: Duration,
}

impl RoundOutcome {
    /// Hashes per second over the round
    pub fn hash_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_hashes as f64 / secs
        } else {
            0.0
        }
    }
}

/// The device and nonce that won a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Winner {
    pub device: DeviceId,
    pub nonce: Nonce,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_left_truncation() {
        let mut long = vec![0xAAu8; 8];
        long.extend((0..32).map(|i| i as u8));
        let hash = Hash::from_slice(&long);
        let expected: Vec<u8> = (0..32).map(|i| i as u8).collect();
        assert_eq!(hash.as_bytes().as_slice(), expected.as_slice());
    }

    #[test]
    fn test_hash_right_alignment() {
        let hash = Hash::from_slice(&[0x01, 0x02]);
        let mut expected = [0u8; 32];
        expected[30] = 0x01;
        expected[31] = 0x02;
        assert_eq!(hash.as_bytes(), &expected);
    }

    #[test]
    fn test_set_bytes_clears_previous_value() {
        let mut hash = Hash::new([0xFF; 32]);
        hash.set_bytes(&[0x07]);
        let mut expected = [0u8; 32];
        expected[31] = 0x07;
        assert_eq!(hash.as_bytes(), &expected);
    }

    #[test]
    fn test_hash_hex() {
        let hex_str = "00000000000000000000000000000000000000000000000000000000deadbeef";
        let hash: Hash = hex_str.parse().unwrap();
        assert_eq!(hash.to_hex(), hex_str);
        assert_eq!(Hash::from_hex("0xdeadbeef").unwrap(), hash);
        assert!(Hash::from_hex("zz").is_err());
    }

    #[test]
    fn test_target_comparison_is_exact() {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&100u64.to_be_bytes());
        let output = Hash::new(bytes);

        assert!(Target::new(100).is_met_by(&output));
        assert!(Target::new(101).is_met_by(&output));
        assert!(!Target::new(99).is_met_by(&output));

        // A bit above the low 64 bits must never be truncated away.
        bytes[23] = 1;
        let output = Hash::new(bytes);
        assert!(!Target::max().is_met_by(&output));
    }

    #[test]
    fn test_target_extremes() {
        assert!(Target::min().is_met_by(&Hash::default()));
        assert!(!Target::min().is_met_by(&Hash::from_slice(&[1])));
        assert!(Target::max().is_met_by(&Hash::from_slice(&[0xFF; 8])));
    }

    #[test]
    fn test_target_saturation() {
        let (target, saturated) = Target::from_be_bytes_saturating(&[0x01, 0x00]);
        assert_eq!(target, Target::new(256));
        assert!(!saturated);

        let (target, saturated) = Target::from_be_bytes_saturating(&[0x01; 9]);
        assert_eq!(target, Target::max());
        assert!(saturated);

        let (target, saturated) = Target::from_be_bytes_saturating(&[]);
        assert_eq!(target, Target::min());
        assert!(!saturated);
    }

    #[test]
    fn test_nonce_advance_wraps() {
        let mut nonce = Nonce::new(u64::MAX - 1);
        nonce.advance(3);
        assert_eq!(nonce.value(), 1);
        assert_eq!(Nonce::new(5).advanced(5), Nonce::new(10));
    }

    #[test]
    fn test_search_result_solution() {
        assert_eq!(SearchResult::exhausted(10).solution(), None);
        assert_eq!(
            SearchResult::solved(1, Nonce::new(42)).solution(),
            Some(Nonce::new(42))
        );
    }

    #[test]
    fn test_submission_hash_prefers_wire_form() {
        let problem = Problem::new(Hash::from_slice(&[0xab, 0xcd]), Target::max());
        assert_eq!(problem.submission_hash(), problem.header_hash.to_hex());

        let problem = problem.with_wire_hash("0xABCD");
        assert_eq!(problem.submission_hash(), "0xABCD");
    }

    #[test]
    fn test_round_hash_rate() {
        let outcome = RoundOutcome {
            round: 1,
            problem: Problem::new(Hash::default(), Target::max()),
            total_hashes: 1000,
            winner: None,
            workers: 2,
            failed_workers: 0,
            preempted: false,
            elapsed: Duration::from_secs(10),
        };
        assert_eq!(outcome.hash_rate(), 100.0);
    }

    proptest! {
        #[test]
        fn prop_hash_keeps_trailing_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..96)) {
            let hash = Hash::from_slice(&bytes);
            let kept = bytes.len().min(HASH_LENGTH);
            prop_assert_eq!(&hash.as_bytes()[HASH_LENGTH - kept..], &bytes[bytes.len() - kept..]);
            prop_assert!(hash.as_bytes()[..HASH_LENGTH - kept].iter().all(|&b| b == 0));
        }

        #[test]
        fn prop_target_check_matches_bigint(bytes in any::<[u8; 32]>(), target in any::<u64>()) {
            let output = Hash::new(bytes);
            let expected = output.to_biguint() <= BigUint::from(target);
            prop_assert_eq!(Target::new(target).is_met_by(&output), expected);
        }
    }
}
