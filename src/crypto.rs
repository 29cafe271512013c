//! Proof-of-work hashing
//!
//! The header hash mixes BLAKE2b-512 and SHA3-256 over the first 128 bytes of
//! the header (the "preheader") with a padding derived from the previous block
//! and tree root. Only the preheader is hashed, so the nonce is the sole field
//! a worker needs to change between attempts.

use crate::header::{Header, HDR_SIZE, NONCE_OFFSET, PREV_BLOCK_OFFSET, TREE_ROOT_OFFSET};
use crate::target::Target;
use crate::types::Hash;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2b512, Digest};
use byteorder::{ByteOrder, LittleEndian};
use sha3::Sha3_256;

type Blake2b256 = Blake2b<U32>;

/// Bytes of the header covered by the hash
pub const PREHEADER_SIZE: usize = 128;

/// Padding used by the header hash: `prev_block[i] ^ tree_root[i]`
pub fn padding(header: &[u8; HDR_SIZE]) -> [u8; 32] {
    let mut pad = [0u8; 32];
    for (i, byte) in pad.iter_mut().enumerate() {
        *byte = header[PREV_BLOCK_OFFSET + i] ^ header[TREE_ROOT_OFFSET + i];
    }
    pad
}

fn hash_preheader(pre: &[u8], pad: &[u8; 32]) -> Hash {
    let left = Blake2b512::digest(pre);

    let mut sha = Sha3_256::new();
    sha.update(pre);
    sha.update(&pad[..8]);
    let right = sha.finalize();

    let mut blake = Blake2b256::new();
    blake.update(left);
    blake.update(pad);
    blake.update(right);
    blake.finalize().into()
}

/// Proof-of-work hash of a header
pub fn pow_hash(header: &Header) -> Hash {
    let bytes = header.as_bytes();
    hash_preheader(&bytes[..PREHEADER_SIZE], &padding(bytes))
}

/// Check a header's proof of work against a target
pub fn verify(header: &Header, target: &Target) -> bool {
    target.is_met_by(&pow_hash(header))
}

/// Hash of a cycle proof, compared against the target by cycle backends
pub fn proof_hash(solution: &[u8]) -> Hash {
    Blake2b256::digest(solution).into()
}

/// Nonce grinder over a fixed header.
///
/// Keeps a private preheader and the padding so each attempt only rewrites
/// the nonce.
pub struct PowHasher {
    pre: [u8; PREHEADER_SIZE],
    pad: [u8; 32],
}

impl PowHasher {
    pub fn new(header: &Header) -> Self {
        let bytes = header.as_bytes();
        let mut pre = [0u8; PREHEADER_SIZE];
        pre.copy_from_slice(&bytes[..PREHEADER_SIZE]);
        Self {
            pre,
            pad: padding(bytes),
        }
    }

    /// Hash the header with `nonce` written in
    pub fn hash_nonce(&mut self, nonce: u32) -> Hash {
        LittleEndian::write_u32(&mut self.pre[NONCE_OFFSET..], nonce);
        hash_preheader(&self.pre, &self.pad)
    }
}
