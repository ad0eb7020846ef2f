//! Consensus data model: OutputReference, Signature, PublicKey, Input,
//! Output, Transaction, BlockSummary, PowEvidence, BlockHeader, Block.

use std::io::{Read, Write};

use crate::core::params::{CHAIN_SAMPLE_TOTAL_SIZE, MAX_COINBASE_RANDOM_DATA_SIZE};
use crate::core::serialize::{
    read_hash32, read_u32_be, read_u64_be, read_vlq, safe_read, serialize_list,
    stream_deserialize_list, stream_serialize_list, write_hash32, write_u32_be, write_u64_be,
    write_vlq, Result, SerializeError, Wire,
};
use crate::crypto;

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Refers to an output by the hash of the transaction that created it
/// and its index within that transaction's output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputReference {
    pub tx_hash: Hash256,
    pub index: u32,
}

impl OutputReference {
    pub fn thin_air() -> Self {
        Self { tx_hash: ZERO_HASH, index: 0 }
    }

    pub fn references_thin_air(&self) -> bool {
        self.tx_hash == ZERO_HASH && self.index == 0
    }
}

impl Wire for OutputReference {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        write_hash32(w, &self.tx_hash)?;
        write_u32_be(w, self.index)
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let tx_hash = read_hash32(r)?;
        let index = read_u32_be(r)?;
        Ok(Self { tx_hash, index })
    }
}

const TAG_SIGNABLE_EQUIVALENT: u8 = 0x00;
const TAG_COINBASE_DATA: u8 = 0x01;
const TAG_SECP256K1: u8 = 0x02;

/// Tagged union; the 1-byte discriminant is wire-stable and must never
/// be reassigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// Placeholder used when computing the pre-image of a signature.
    SignableEquivalent,
    /// Takes the place of a real signature in a coinbase transaction's
    /// sole input; carries the block height and arbitrary miner data.
    CoinbaseData { height: u32, data: Vec<u8> },
    Secp256k1([u8; 64]),
}

impl Signature {
    /// `SignableEquivalent` and `CoinbaseData` are not real signatures:
    /// they can never validate an output and must be rejected wherever
    /// a spend is expected to be authorized.
    pub fn is_not_signature(&self) -> bool {
        !matches!(self, Signature::Secp256k1(_))
    }
}

impl Wire for Signature {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            Signature::SignableEquivalent => {
                w.write_all(&[TAG_SIGNABLE_EQUIVALENT])?;
            }
            Signature::CoinbaseData { height, data } => {
                if data.len() > MAX_COINBASE_RANDOM_DATA_SIZE {
                    return Err(SerializeError::Invalid(
                        "CoinbaseData random data too long".into(),
                    ));
                }
                w.write_all(&[TAG_COINBASE_DATA])?;
                write_u32_be(w, *height)?;
                w.write_all(&[data.len() as u8])?;
                w.write_all(data)?;
            }
            Signature::Secp256k1(sig) => {
                w.write_all(&[TAG_SECP256K1])?;
                w.write_all(sig)?;
            }
        }
        Ok(())
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let tag = safe_read(r, 1)?[0];
        match tag {
            TAG_SIGNABLE_EQUIVALENT => Ok(Signature::SignableEquivalent),
            TAG_COINBASE_DATA => {
                let height = read_u32_be(r)?;
                let len = safe_read(r, 1)?[0] as usize;
                if len > MAX_COINBASE_RANDOM_DATA_SIZE {
                    return Err(SerializeError::Invalid(
                        "CoinbaseData random data too long".into(),
                    ));
                }
                let data = safe_read(r, len)?;
                Ok(Signature::CoinbaseData { height, data })
            }
            TAG_SECP256K1 => {
                let bytes = safe_read(r, 64)?;
                let mut sig = [0u8; 64];
                sig.copy_from_slice(&bytes);
                Ok(Signature::Secp256k1(sig))
            }
            other => Err(SerializeError::Invalid(format!(
                "unknown Signature type tag {other:#04x}"
            ))),
        }
    }
}

/// Tagged union; currently a single variant, matching the wire format's
/// reserved room for future key types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicKey {
    Secp256k1([u8; 64]),
}

impl PublicKey {
    pub fn bytes(&self) -> &[u8; 64] {
        match self {
            PublicKey::Secp256k1(b) => b,
        }
    }
}

impl Wire for PublicKey {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            PublicKey::Secp256k1(bytes) => {
                w.write_all(&[TAG_SECP256K1])?;
                w.write_all(bytes)?;
            }
        }
        Ok(())
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let tag = safe_read(r, 1)?[0];
        match tag {
            TAG_SECP256K1 => {
                let bytes = safe_read(r, 64)?;
                let mut out = [0u8; 64];
                out.copy_from_slice(&bytes);
                Ok(PublicKey::Secp256k1(out))
            }
            other => Err(SerializeError::Invalid(format!(
                "unsupported PublicKey type tag {other:#04x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub output_reference: OutputReference,
    pub signature: Signature,
}

impl Input {
    /// Replaces the signature with `SignableEquivalent`; this is what a
    /// transaction's inputs look like in the pre-image that signatures
    /// are computed and verified over (a signature cannot sign itself).
    pub fn signable_equivalent(&self) -> Input {
        Input {
            output_reference: self.output_reference,
            signature: Signature::SignableEquivalent,
        }
    }
}

impl Wire for Input {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        self.output_reference.stream_serialize(w)?;
        self.signature.stream_serialize(w)
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let output_reference = OutputReference::stream_deserialize(r)?;
        let signature = Signature::stream_deserialize(r)?;
        Ok(Self { output_reference, signature })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub value: u64,
    pub public_key: PublicKey,
}

impl Wire for Output {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64_be(w, self.value)?;
        self.public_key.stream_serialize(w)
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let value = read_u64_be(r)?;
        let public_key = PublicKey::stream_deserialize(r)?;
        Ok(Self { value, public_key })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u8,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl Transaction {
    pub fn new(inputs: Vec<Input>, outputs: Vec<Output>) -> Self {
        Self { version: 0, inputs, outputs }
    }

    pub fn new_coinbase(
        height: u32,
        reward_and_fees: u64,
        miner_public_key: PublicKey,
        random_data: Vec<u8>,
    ) -> Self {
        let input = Input {
            output_reference: OutputReference::thin_air(),
            signature: Signature::CoinbaseData { height, data: random_data },
        };
        let output = Output { value: reward_and_fees, public_key: miner_public_key };
        Self::new(vec![input], vec![output])
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].output_reference.references_thin_air()
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    pub fn hash(&self) -> Hash256 {
        crypto::sha256d(&self.serialize())
    }

    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    /// The pre-image transactions are signed and verified against: every
    /// input's signature is replaced with `SignableEquivalent`.
    pub fn signable_equivalent(&self) -> Transaction {
        Transaction {
            version: self.version,
            inputs: self.inputs.iter().map(Input::signable_equivalent).collect(),
            outputs: self.outputs.clone(),
        }
    }
}

impl Wire for Transaction {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&[self.version])?;
        stream_serialize_list(w, &self.inputs)?;
        stream_serialize_list(w, &self.outputs)
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let version = safe_read(r, 1)?[0];
        if version != 0 {
            return Err(SerializeError::Invalid(
                "only version 0 transactions are supported".into(),
            ));
        }
        let inputs = stream_deserialize_list(r)?;
        let outputs = stream_deserialize_list(r)?;
        Ok(Self { version, inputs, outputs })
    }
}

/// akin to Bitcoin's block header; `BlockHeader` wraps this together
/// with the `PowEvidence`, hence the extra layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub height: u64,
    pub previous_block_hash: Hash256,
    pub merkle_root_hash: Hash256,
    pub timestamp: u32,
    pub target: [u8; 32],
    pub nonce: u32,
}

impl BlockSummary {
    pub fn hash(&self) -> Hash256 {
        crypto::sha256d(&self.serialize())
    }
}

impl Wire for BlockSummary {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        write_vlq(w, self.height)?;
        write_hash32(w, &self.previous_block_hash)?;
        write_hash32(w, &self.merkle_root_hash)?;
        write_u32_be(w, self.timestamp)?;
        w.write_all(&self.target)?;
        write_u32_be(w, self.nonce)
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let height = read_vlq(r)?;
        let previous_block_hash = read_hash32(r)?;
        let merkle_root_hash = read_hash32(r)?;
        let timestamp = read_u32_be(r)?;
        let target_v = safe_read(r, 32)?;
        let mut target = [0u8; 32];
        target.copy_from_slice(&target_v);
        let nonce = read_u32_be(r)?;
        Ok(Self { height, previous_block_hash, merkle_root_hash, timestamp, target, nonce })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowEvidence {
    pub summary_hash: Hash256,
    pub chain_sample: [u8; CHAIN_SAMPLE_TOTAL_SIZE],
    pub block_hash: Hash256,
}

impl Wire for PowEvidence {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        write_hash32(w, &self.summary_hash)?;
        w.write_all(&self.chain_sample)?;
        write_hash32(w, &self.block_hash)
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let summary_hash = read_hash32(r)?;
        let sample_v = safe_read(r, CHAIN_SAMPLE_TOTAL_SIZE)?;
        let mut chain_sample = [0u8; CHAIN_SAMPLE_TOTAL_SIZE];
        chain_sample.copy_from_slice(&sample_v);
        let block_hash = read_hash32(r)?;
        Ok(Self { summary_hash, chain_sample, block_hash })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u8,
    pub summary: BlockSummary,
    pub pow_evidence: PowEvidence,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        crypto::sha256d(&self.serialize())
    }
}

impl Wire for BlockHeader {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&[self.version])?;
        self.summary.stream_serialize(w)?;
        self.pow_evidence.stream_serialize(w)
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let version = safe_read(r, 1)?[0];
        if version != 0 {
            return Err(SerializeError::Invalid(
                "only version 0 block headers are supported".into(),
            ));
        }
        let summary = BlockSummary::stream_deserialize(r)?;
        let pow_evidence = PowEvidence::stream_deserialize(r)?;
        Ok(Self { version, summary, pow_evidence })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.summary.height
    }

    pub fn previous_block_hash(&self) -> Hash256 {
        self.header.summary.previous_block_hash
    }

    pub fn timestamp(&self) -> u32 {
        self.header.summary.timestamp
    }

    pub fn target(&self) -> [u8; 32] {
        self.header.summary.target
    }

    pub fn coinbase(&self) -> &Transaction {
        &self.transactions[0]
    }

    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    /// Merkle root over `[tx.hash() for tx in transactions]`, sha256d
    /// pairwise concatenation. An odd trailing leaf at any level is
    /// promoted to the next level unchanged (NOT duplicated).
    pub fn compute_merkle_root(&self) -> Hash256 {
        let leaves: Vec<Hash256> = self.transactions.iter().map(Transaction::hash).collect();
        merkle_root(&leaves)
    }

    pub fn validate_merkle_root(&self) -> bool {
        self.header.summary.merkle_root_hash == self.compute_merkle_root()
    }
}

/// sha256d Merkle root, promoting an odd trailing leaf unchanged at
/// every level instead of duplicating it.
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return ZERO_HASH;
    }
    if hashes.len() == 1 {
        return hashes[0];
    }

    let mut level = Vec::with_capacity(hashes.len().div_ceil(2));
    let mut chunks = hashes.chunks(2);
    for chunk in &mut chunks {
        if chunk.len() == 2 {
            let mut buf = Vec::with_capacity(64);
            buf.extend_from_slice(&chunk[0]);
            buf.extend_from_slice(&chunk[1]);
            level.push(crypto::sha256d(&buf));
        } else {
            level.push(chunk[0]);
        }
    }
    merkle_root(&level)
}

impl Wire for Block {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        self.header.stream_serialize(w)?;
        stream_serialize_list(w, &self.transactions)
    }

    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let header = BlockHeader::stream_deserialize(r)?;
        let transactions = stream_deserialize_list(r)?;
        if transactions.is_empty() {
            return Err(SerializeError::Invalid("block has no transactions".into()));
        }
        Ok(Self { header, transactions })
    }
}

pub fn serialize_transactions(txs: &[Transaction]) -> Vec<u8> {
    serialize_list(txs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keypair() -> crypto::Keypair {
        crypto::Keypair::generate()
    }

    fn sample_output(value: u64, kp: &crypto::Keypair) -> Output {
        Output { value, public_key: PublicKey::Secp256k1(kp.public_key_bytes()) }
    }

    #[test]
    fn output_reference_roundtrip() {
        let r = OutputReference { tx_hash: [7u8; 32], index: 42 };
        let bytes = r.serialize();
        assert_eq!(OutputReference::deserialize(&bytes).unwrap(), r);
    }

    #[test]
    fn thin_air_reference_is_recognized() {
        assert!(OutputReference::thin_air().references_thin_air());
        assert!(!OutputReference { tx_hash: [1u8; 32], index: 0 }.references_thin_air());
    }

    #[test]
    fn signature_variants_roundtrip() {
        for sig in [
            Signature::SignableEquivalent,
            Signature::CoinbaseData { height: 5, data: vec![1, 2, 3] },
            Signature::Secp256k1([9u8; 64]),
        ] {
            let bytes = sig.serialize();
            assert_eq!(Signature::deserialize(&bytes).unwrap(), sig);
        }
    }

    #[test]
    fn non_signature_kinds_are_flagged() {
        assert!(Signature::SignableEquivalent.is_not_signature());
        assert!(Signature::CoinbaseData { height: 0, data: vec![] }.is_not_signature());
        assert!(!Signature::Secp256k1([0u8; 64]).is_not_signature());
    }

    #[test]
    fn coinbase_transaction_roundtrip_and_flags() {
        let kp = sample_keypair();
        let tx = Transaction::new_coinbase(
            10,
            5_000_000_000,
            PublicKey::Secp256k1(kp.public_key_bytes()),
            vec![1, 2, 3],
        );
        assert!(tx.is_coinbase());
        let bytes = tx.serialize();
        assert_eq!(Transaction::deserialize(&bytes).unwrap(), tx);
    }

    #[test]
    fn transaction_hash_changes_with_outputs() {
        let kp = sample_keypair();
        let tx1 = Transaction::new(vec![], vec![sample_output(1, &kp)]);
        let tx2 = Transaction::new(vec![], vec![sample_output(2, &kp)]);
        assert_ne!(tx1.hash(), tx2.hash());
    }

    #[test]
    fn signable_equivalent_strips_signatures_only() {
        let kp = sample_keypair();
        let input = Input {
            output_reference: OutputReference { tx_hash: [3u8; 32], index: 0 },
            signature: Signature::Secp256k1([9u8; 64]),
        };
        let tx = Transaction::new(vec![input], vec![sample_output(10, &kp)]);
        let signable = tx.signable_equivalent();
        assert_eq!(signable.inputs[0].signature, Signature::SignableEquivalent);
        assert_eq!(signable.outputs, tx.outputs);
    }

    #[test]
    fn merkle_root_single_leaf_is_itself() {
        let h = [1u8; 32];
        assert_eq!(merkle_root(&[h]), h);
    }

    #[test]
    fn merkle_root_odd_leaf_is_promoted_not_duplicated() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let ab = crypto::sha256d(&[a, b].concat());
        let expected = crypto::sha256d(&[ab, c].concat());
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn merkle_root_differs_from_naive_duplication() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let ab = crypto::sha256d(&[a, b].concat());
        let duplicated_cc = crypto::sha256d(&[c, c].concat());
        let duplicate_based = crypto::sha256d(&[ab, duplicated_cc].concat());
        assert_ne!(merkle_root(&[a, b, c]), duplicate_based);
    }

    #[test]
    fn block_header_hash_changes_with_nonce() {
        let summary = BlockSummary {
            height: 1,
            previous_block_hash: ZERO_HASH,
            merkle_root_hash: ZERO_HASH,
            timestamp: 0,
            target: crate::core::params::INITIAL_TARGET,
            nonce: 0,
        };
        let evidence = PowEvidence {
            summary_hash: ZERO_HASH,
            chain_sample: [0u8; CHAIN_SAMPLE_TOTAL_SIZE],
            block_hash: ZERO_HASH,
        };
        let h1 = BlockHeader { version: 0, summary: summary.clone(), pow_evidence: evidence.clone() };
        let mut summary2 = summary;
        summary2.nonce = 1;
        let h2 = BlockHeader { version: 0, summary: summary2, pow_evidence: evidence };
        assert_ne!(h1.hash(), h2.hash());
    }
}
