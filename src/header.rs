//! Miner serialization of the block header
//!
//! The node hands out a fixed 256-byte header laid out as follows (all
//! integers little-endian):
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 4    | nonce          |
//! | 4      | 8    | time (48 bits + zero guard) |
//! | 12     | 20   | padding        |
//! | 32     | 32   | prev block     |
//! | 64     | 32   | tree root      |
//! | 96     | 32   | mask hash      |
//! | 128    | 24   | extra nonce    |
//! | 152    | 32   | reserved root  |
//! | 184    | 32   | witness root   |
//! | 216    | 32   | merkle root    |
//! | 248    | 4    | version        |
//! | 252    | 4    | bits           |
//!
//! The mask hash is the work identity. Cycle-finding backends submit the
//! header followed by a one-byte word count and the proof itself.

use crate::types::{Hash, Network};
use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use rand::Rng;
use serde::Serialize;
use std::fmt;

pub const HDR_SIZE: usize = 256;

pub const NONCE_OFFSET: usize = 0;
pub const TIME_OFFSET: usize = 4;
pub const PADDING_OFFSET: usize = 12;
pub const PREV_BLOCK_OFFSET: usize = 32;
pub const TREE_ROOT_OFFSET: usize = 64;
pub const MASK_HASH_OFFSET: usize = 96;
pub const EXTRA_NONCE_START: usize = 128;
pub const EXTRA_NONCE_END: usize = 152;
pub const RESERVED_ROOT_OFFSET: usize = 152;
pub const WITNESS_ROOT_OFFSET: usize = 184;
pub const MERKLE_ROOT_OFFSET: usize = 216;
pub const VERSION_OFFSET: usize = 248;
pub const BITS_OFFSET: usize = 252;

pub const EXTRA_NONCE_SIZE: usize = EXTRA_NONCE_END - EXTRA_NONCE_START;

/// Tail of the extra nonce that each worker randomizes before a round
pub const RANDOM_NONCE_START: usize = EXTRA_NONCE_END - 12;

/// Largest time representable in the 48-bit field
pub const MAX_TIME: u64 = 0xffff_ffff_ffff;

/// Extra nonce value
pub type ExtraNonce = [u8; EXTRA_NONCE_SIZE];

/// What `advance` changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Header time was rolled forward
    Time,
    /// Extra nonce counter was incremented
    ExtraNonce,
}

/// Fixed-size miner header
#[derive(Clone, PartialEq, Eq)]
pub struct Header([u8; HDR_SIZE]);

impl Header {
    /// Decode a raw header, checking its size and time guard
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; HDR_SIZE] = bytes.try_into().map_err(|_| {
            Error::bad_header_size(format!("expected {} bytes, got {}", HDR_SIZE, bytes.len()))
        })?;

        let guard = LittleEndian::read_u16(&bytes[TIME_OFFSET + 6..TIME_OFFSET + 8]);
        if guard != 0 {
            return Err(Error::bad_time(format!(
                "header time guard is {:#06x}, expected zero",
                guard
            )));
        }

        Ok(Self(bytes))
    }

    /// Decode a hex-encoded header
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != HDR_SIZE * 2 {
            return Err(Error::bad_header_size(format!(
                "expected {} hex chars, got {}",
                HDR_SIZE * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| Error::bad_header_size(format!("invalid hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HDR_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn nonce(&self) -> u32 {
        LittleEndian::read_u32(&self.0[NONCE_OFFSET..])
    }

    pub fn set_nonce(&mut self, nonce: u32) {
        LittleEndian::write_u32(&mut self.0[NONCE_OFFSET..], nonce);
    }

    /// 48-bit header time
    pub fn time(&self) -> u64 {
        let lo = LittleEndian::read_u32(&self.0[TIME_OFFSET..]) as u64;
        let hi = LittleEndian::read_u16(&self.0[TIME_OFFSET + 4..]) as u64;
        (hi << 32) | lo
    }

    /// Write the 48-bit header time and clear the guard.
    ///
    /// Panics if `time` does not fit in 48 bits.
    pub fn set_time(&mut self, time: u64) {
        assert!(time <= MAX_TIME, "header time {} exceeds 48 bits", time);
        LittleEndian::write_u32(&mut self.0[TIME_OFFSET..], time as u32);
        LittleEndian::write_u16(&mut self.0[TIME_OFFSET + 4..], (time >> 32) as u16);
        LittleEndian::write_u16(&mut self.0[TIME_OFFSET + 6..], 0);
    }

    pub fn padding(&self) -> &[u8] {
        &self.0[PADDING_OFFSET..PREV_BLOCK_OFFSET]
    }

    pub fn prev_block(&self) -> Hash {
        self.hash_at(PREV_BLOCK_OFFSET)
    }

    pub fn tree_root(&self) -> Hash {
        self.hash_at(TREE_ROOT_OFFSET)
    }

    /// Identity commitment of the work this header belongs to
    pub fn mask_hash(&self) -> Hash {
        self.hash_at(MASK_HASH_OFFSET)
    }

    pub fn extra_nonce(&self) -> ExtraNonce {
        let mut out = [0u8; EXTRA_NONCE_SIZE];
        out.copy_from_slice(&self.0[EXTRA_NONCE_START..EXTRA_NONCE_END]);
        out
    }

    pub fn set_extra_nonce(&mut self, extra_nonce: &ExtraNonce) {
        self.0[EXTRA_NONCE_START..EXTRA_NONCE_END].copy_from_slice(extra_nonce);
    }

    pub fn reserved_root(&self) -> Hash {
        self.hash_at(RESERVED_ROOT_OFFSET)
    }

    pub fn witness_root(&self) -> Hash {
        self.hash_at(WITNESS_ROOT_OFFSET)
    }

    pub fn merkle_root(&self) -> Hash {
        self.hash_at(MERKLE_ROOT_OFFSET)
    }

    pub fn version(&self) -> u32 {
        LittleEndian::read_u32(&self.0[VERSION_OFFSET..])
    }

    pub fn bits(&self) -> u32 {
        LittleEndian::read_u32(&self.0[BITS_OFFSET..])
    }

    fn hash_at(&self, offset: usize) -> Hash {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0[offset..offset + 32]);
        out
    }

    /// Move the header to fresh search space.
    ///
    /// On networks that roll time, a clock ahead of the header time wins and
    /// only the time changes. Otherwise the extra nonce is bumped.
    pub fn advance(&mut self, now: u64, network: Network) -> Advance {
        if network.rolls_time() && now > self.time() {
            self.set_time(now);
            return Advance::Time;
        }

        self.increment_extra_nonce();
        Advance::ExtraNonce
    }

    /// Increment the extra nonce as a little-endian counter, wrapping to zero
    pub fn increment_extra_nonce(&mut self) {
        for byte in &mut self.0[EXTRA_NONCE_START..EXTRA_NONCE_END] {
            if *byte != 0xff {
                *byte += 1;
                return;
            }
            *byte = 0;
        }
    }

    /// Fill the per-worker tail of the extra nonce with random bytes
    pub fn randomize_extra_nonce<R: Rng>(&mut self, rng: &mut R) {
        rng.fill(&mut self.0[RANDOM_NONCE_START..EXTRA_NONCE_END]);
    }

    /// Header with the winning nonce and extra nonce written in
    pub fn finalize(&self, nonce: u32, extra_nonce: &ExtraNonce) -> Header {
        let mut out = self.clone();
        out.set_nonce(nonce);
        out.set_extra_nonce(extra_nonce);
        out
    }

    /// Field-by-field view for logging
    pub fn view(&self) -> HeaderView {
        HeaderView {
            nonce: self.nonce(),
            time: self.time(),
            padding: hex::encode(self.padding()),
            prev_block: hex::encode(self.prev_block()),
            tree_root: hex::encode(self.tree_root()),
            mask_hash: hex::encode(self.mask_hash()),
            extra_nonce: hex::encode(self.extra_nonce()),
            reserved_root: hex::encode(self.reserved_root()),
            witness_root: hex::encode(self.witness_root()),
            merkle_root: hex::encode(self.merkle_root()),
            version: self.version(),
            bits: self.bits(),
        }
    }

    /// Pretty JSON of [`Header::view`]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.view()).unwrap_or_else(|_| self.to_hex())
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Header").field(&self.to_hex()).finish()
    }
}

/// Decoded header fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderView {
    pub nonce: u32,
    pub time: u64,
    pub padding: String,
    pub prev_block: String,
    pub tree_root: String,
    pub mask_hash: String,
    pub extra_nonce: String,
    pub reserved_root: String,
    pub witness_root: String,
    pub merkle_root: String,
    pub version: u32,
    pub bits: u32,
}

/// Serialize a header plus a cycle proof for submission.
///
/// Panics if `raw` is not exactly one header or the proof is not a whole
/// number of 32-bit words that fits in the one-byte length prefix.
pub fn finalize_cycle(raw: &[u8], nonce: u32, solution: &[u8]) -> Vec<u8> {
    assert_eq!(raw.len(), HDR_SIZE, "pre-solution header must be {} bytes", HDR_SIZE);
    assert_eq!(solution.len() % 4, 0, "solution must be whole 32-bit words");
    assert!(solution.len() / 4 <= u8::MAX as usize, "solution too long");

    let mut out = Vec::with_capacity(HDR_SIZE + 1 + solution.len());
    out.extend_from_slice(raw);
    LittleEndian::write_u32(&mut out[NONCE_OFFSET..], nonce);
    out.push((solution.len() / 4) as u8);
    out.extend_from_slice(solution);
    out
}

/// Split a submitted cycle block back into header and proof
pub fn decode_cycle(bytes: &[u8]) -> Result<(Header, Vec<u8>)> {
    if bytes.len() <= HDR_SIZE {
        return Err(Error::bad_header_size(format!(
            "cycle block of {} bytes has no solution",
            bytes.len()
        )));
    }

    let header = Header::from_slice(&bytes[..HDR_SIZE])?;
    let declared = bytes[HDR_SIZE] as usize * 4;
    let tail = &bytes[HDR_SIZE + 1..];

    if tail.len() != declared {
        return Err(Error::bad_header_size(format!(
            "solution declares {} bytes, {} remain",
            declared,
            tail.len()
        )));
    }

    Ok((header, tail.to_vec()))
}
