//! Proof of work: scrypt summary hash, chain-sample construction, and
//! the BLAKE2b block-hash commitment.
//!
//! A block's hash is not simply a hash of its header. Three things are
//! combined:
//!
//!   1. `summary_hash = scrypt(summary.serialize(), height as 8-byte BE)`
//!      — memory-hard, ties the PoW to the exact summary fields.
//!   2. `chain_sample` — 8 slices of 4 bytes each, pulled out of blocks
//!      already on the chain the new block extends. Which blocks and
//!      which offsets are pulled from is itself derived from
//!      `summary_hash`, so a miner cannot precompute the sample without
//!      fixing the summary first, and a validator must have the
//!      referenced blocks on hand to check it.
//!   3. `block_hash = blake2b_256(summary_hash || chain_sample || serialize_list(transactions))`
//!
//! A block is valid proof-of-work iff `block_hash`, read as a 256-bit
//! big-endian unsigned integer, is less than `summary.target`.

use num_bigint::BigUint;

use crate::core::params::{CHAIN_SAMPLE_COUNT, CHAIN_SAMPLE_SIZE, CHAIN_SAMPLE_TOTAL_SIZE};
use crate::core::types::{serialize_transactions, BlockSummary, Hash256, PowEvidence, Transaction};
use crate::core::serialize::{read_u32_be, read_u64_be, Wire};
use crate::crypto;

#[derive(Debug)]
pub enum PowError {
    /// The chain sample needed a block at this height but the source
    /// could not supply one (pruned, unknown tip, or height 0 chain).
    MissingSampleBlock { tip: Hash256, height: u64 },
    /// A referenced block had zero serialized bytes, so no offset into
    /// it is well-defined.
    EmptySampleBlock { height: u64 },
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::MissingSampleBlock { tip, height } => write!(
                f,
                "no block at height {height} on chain ending at {}",
                hex::encode(tip)
            ),
            PowError::EmptySampleBlock { height } => {
                write!(f, "block at height {height} serialized to zero bytes")
            }
        }
    }
}

impl std::error::Error for PowError {}

/// Supplies the serialized bytes of a block at a given height, on the
/// chain that ends at a given tip hash. Implemented by the block store
/// / chain state engine; kept abstract here so `pow` does not depend on
/// `storage`.
pub trait ChainSampleSource {
    fn block_bytes_at_height(&self, tip: Hash256, height: u64) -> Result<Vec<u8>, PowError>;
}

/// `scrypt(summary.serialize(), height as 8-byte big-endian salt)`.
pub fn summary_hash(summary: &BlockSummary) -> Hash256 {
    let password = summary.serialize();
    let salt = summary.height.to_be_bytes();
    crypto::scrypt_hash(&password, &salt)
}

/// Pull `CHAIN_SAMPLE_SIZE` bytes out of `bytes` starting at `offset`,
/// wrapping around to the start if the read would run off the end.
fn read_wrapping(bytes: &[u8], offset: usize) -> [u8; CHAIN_SAMPLE_SIZE] {
    let mut out = [0u8; CHAIN_SAMPLE_SIZE];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = bytes[(offset + i) % bytes.len()];
    }
    out
}

/// Derive the 8 x 4-byte chain-sample slices that accompany
/// `summary_hash`. `previous_block_hash`/`height` identify the chain
/// tip the new block extends; each slice is drawn from a block already
/// on that chain, at a height and offset themselves derived from the
/// running hash state.
pub fn construct_chain_sample(
    summary_hash: Hash256,
    height: u64,
    previous_block_hash: Hash256,
    source: &dyn ChainSampleSource,
) -> Result<[u8; CHAIN_SAMPLE_TOTAL_SIZE], PowError> {
    // Genesis has no prior blocks to sample from; its chain sample is
    // defined as all zero bytes rather than an error.
    if height == 0 {
        return Ok([0u8; CHAIN_SAMPLE_TOTAL_SIZE]);
    }

    let mut chain_sample = [0u8; CHAIN_SAMPLE_TOTAL_SIZE];
    let mut current = summary_hash;

    for i in 0..CHAIN_SAMPLE_COUNT {
        let mut height_cursor = &current[0..8];
        let mut offset_cursor = &current[8..12];
        let sample_height = read_u64_be(&mut height_cursor).expect("fixed 8-byte slice") % height.max(1);
        let raw_offset = read_u32_be(&mut offset_cursor).expect("fixed 4-byte slice");

        let block_bytes = source.block_bytes_at_height(previous_block_hash, sample_height)?;
        if block_bytes.is_empty() {
            return Err(PowError::EmptySampleBlock { height: sample_height });
        }
        let offset = raw_offset as usize % block_bytes.len();
        let slice = read_wrapping(&block_bytes, offset);

        chain_sample[i * CHAIN_SAMPLE_SIZE..(i + 1) * CHAIN_SAMPLE_SIZE].copy_from_slice(&slice);

        let mut preimage = Vec::with_capacity(32 + CHAIN_SAMPLE_SIZE);
        preimage.extend_from_slice(&current);
        preimage.extend_from_slice(&slice);
        current = crypto::sha256d(&preimage);
    }

    Ok(chain_sample)
}

/// `blake2b_256(summary_hash || chain_sample || serialize_list(transactions))`.
pub fn compute_block_hash(
    summary_hash: Hash256,
    chain_sample: &[u8; CHAIN_SAMPLE_TOTAL_SIZE],
    transactions: &[Transaction],
) -> Hash256 {
    let mut preimage = Vec::with_capacity(32 + CHAIN_SAMPLE_TOTAL_SIZE + 256);
    preimage.extend_from_slice(&summary_hash);
    preimage.extend_from_slice(chain_sample);
    preimage.extend_from_slice(&serialize_transactions(transactions));
    crypto::blake2b_256(&preimage)
}

/// Build the full `PowEvidence` for `summary`/`transactions`, given
/// access to the chain the new block extends. This is what a validator
/// recomputes to check a block's proof of work, and what a miner
/// recomputes for every nonce it tries.
pub fn construct_pow_evidence(
    summary: &BlockSummary,
    transactions: &[Transaction],
    source: &dyn ChainSampleSource,
) -> Result<PowEvidence, PowError> {
    let summary_hash = summary_hash(summary);
    let chain_sample = construct_chain_sample(
        summary_hash,
        summary.height,
        summary.previous_block_hash,
        source,
    )?;
    let block_hash = compute_block_hash(summary_hash, &chain_sample, transactions);
    Ok(PowEvidence { summary_hash, chain_sample, block_hash })
}

/// A hash (as a 256-bit big-endian unsigned integer) is valid proof of
/// work iff it is strictly less than the target.
pub fn meets_target(hash: &Hash256, target: &[u8; 32]) -> bool {
    BigUint::from_bytes_be(hash) < BigUint::from_bytes_be(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeChain {
        blocks_by_height: HashMap<u64, Vec<u8>>,
    }

    impl ChainSampleSource for FakeChain {
        fn block_bytes_at_height(&self, _tip: Hash256, height: u64) -> Result<Vec<u8>, PowError> {
            self.blocks_by_height
                .get(&height)
                .cloned()
                .ok_or(PowError::MissingSampleBlock { tip: [0u8; 32], height })
        }
    }

    fn fake_chain(heights: u64) -> FakeChain {
        let mut blocks_by_height = HashMap::new();
        for h in 0..heights {
            blocks_by_height.insert(h, vec![h as u8; 64 + h as usize]);
        }
        FakeChain { blocks_by_height }
    }

    fn sample_summary(height: u64) -> BlockSummary {
        BlockSummary {
            height,
            previous_block_hash: [3u8; 32],
            merkle_root_hash: [4u8; 32],
            timestamp: 1_700_000_000,
            target: crate::core::params::INITIAL_TARGET,
            nonce: 0,
        }
    }

    #[test]
    fn summary_hash_is_deterministic_and_nonce_sensitive() {
        let s1 = sample_summary(10);
        let mut s2 = s1.clone();
        s2.nonce = 1;
        assert_eq!(summary_hash(&s1), summary_hash(&s1));
        assert_ne!(summary_hash(&s1), summary_hash(&s2));
    }

    #[test]
    fn chain_sample_is_deterministic_given_same_chain() {
        let chain = fake_chain(20);
        let summary = sample_summary(10);
        let h = summary_hash(&summary);
        let a = construct_chain_sample(h, 10, summary.previous_block_hash, &chain).unwrap();
        let b = construct_chain_sample(h, 10, summary.previous_block_hash, &chain).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn construct_pow_evidence_roundtrips_through_validation_inputs() {
        let chain = fake_chain(20);
        let summary = sample_summary(10);
        let txs = vec![];
        let evidence = construct_pow_evidence(&summary, &txs, &chain).unwrap();
        assert_eq!(evidence.summary_hash, summary_hash(&summary));
        let recomputed = compute_block_hash(evidence.summary_hash, &evidence.chain_sample, &txs);
        assert_eq!(recomputed, evidence.block_hash);
    }

    #[test]
    fn genesis_chain_sample_is_all_zero_without_touching_source() {
        let chain = fake_chain(0);
        let summary = sample_summary(0);
        let h = summary_hash(&summary);
        let sample = construct_chain_sample(h, 0, summary.previous_block_hash, &chain).unwrap();
        assert_eq!(sample, [0u8; CHAIN_SAMPLE_TOTAL_SIZE]);
    }

    #[test]
    fn missing_sample_block_is_an_error() {
        let chain = fake_chain(0);
        let summary = sample_summary(1);
        let h = summary_hash(&summary);
        let err = construct_chain_sample(h, 1, summary.previous_block_hash, &chain).unwrap_err();
        assert!(matches!(err, PowError::MissingSampleBlock { .. }));
    }

    #[test]
    fn meets_target_compares_as_big_endian_integer() {
        let low_hash = {
            let mut h = [0u8; 32];
            h[31] = 1;
            h
        };
        let high_target = crate::core::params::INITIAL_TARGET;
        assert!(meets_target(&low_hash, &high_target));

        let too_high_hash = [0xffu8; 32];
        assert!(!meets_target(&too_high_hash, &high_target));
    }
}
