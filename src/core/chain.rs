//! Consensus validation and the chain state engine.
//!
//! Validation is split the way the rules themselves are split: checks
//! that need only the block/transaction in isolation ("by itself") and
//! checks that need the state of the chain it would extend ("in
//! coinstate"). `Chain` is the state engine: it owns a `Storage` handle,
//! decides which branch is canonical, and answers UTXO queries.

use std::collections::HashSet;

use crate::core::params::*;
use crate::core::serialize::Wire;
use crate::core::types::*;
use crate::crypto;
use crate::pow;
use crate::storage::Storage;

#[derive(Debug)]
pub enum ValidationError {
    EmptyBlock,
    BlockTooLarge { size: usize, max: usize },
    FirstTransactionNotCoinbase,
    MultipleCoinbaseTransactions,
    NonCoinbaseHasThinAirInput,
    DuplicateTransaction(Hash256),
    DuplicateOutputReference(OutputReference),
    BadMerkleRoot,
    CoinbaseWrongHeight { expected: u64, found: u32 },
    CoinbaseDataTooLong,
    CoinbaseMissingCoinbaseData,
    CoinbaseRewardMismatch { expected: u64, found: u64 },
    TimestampTooFarInFuture { timestamp: u32, now: u32 },
    TimestampNotAfterParent { timestamp: u32, parent: u32 },
    UnknownPreviousBlock(Hash256),
    HeightMismatch { expected: u64, found: u64 },
    TargetMismatch,
    ProofOfWorkMismatch,
    ProofOfWorkAboveTarget,
    Pow(pow::PowError),
    OutputNotFound(OutputReference),
    OutputAlreadySpent(OutputReference),
    BadSignature(OutputReference),
    NotASignature(OutputReference),
    OutputsExceedInputs { inputs: u64, outputs: u64 },
    OutputValueOutOfRange(u64),
    Storage(crate::storage::StorageError),
    UnknownHeight(u64),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for ValidationError {}

impl From<pow::PowError> for ValidationError {
    fn from(e: pow::PowError) -> Self {
        ValidationError::Pow(e)
    }
}

impl From<crate::storage::StorageError> for ValidationError {
    fn from(e: crate::storage::StorageError) -> Self {
        ValidationError::Storage(e)
    }
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Checks that require nothing but the block's own bytes: structure,
/// merkle root, size, no internal double-spends.
pub fn validate_block_by_itself(block: &Block) -> Result<()> {
    if block.transactions.is_empty() {
        return Err(ValidationError::EmptyBlock);
    }
    let size = block.size();
    if size > MAX_BLOCK_SIZE {
        return Err(ValidationError::BlockTooLarge { size, max: MAX_BLOCK_SIZE });
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::FirstTransactionNotCoinbase);
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::MultipleCoinbaseTransactions);
    }
    for tx in &block.transactions[1..] {
        if tx.inputs.iter().any(|i| i.output_reference.references_thin_air()) {
            return Err(ValidationError::NonCoinbaseHasThinAirInput);
        }
    }

    validate_no_duplicate_transactions(block)?;
    validate_no_duplicate_output_references(block)?;

    match &block.transactions[0].inputs[0].signature {
        Signature::CoinbaseData { height, data } => {
            if *height as u64 != block.height() {
                return Err(ValidationError::CoinbaseWrongHeight { expected: block.height(), found: *height });
            }
            if data.len() > MAX_COINBASE_RANDOM_DATA_SIZE {
                return Err(ValidationError::CoinbaseDataTooLong);
            }
        }
        _ => return Err(ValidationError::CoinbaseMissingCoinbaseData),
    }

    if !block.validate_merkle_root() {
        return Err(ValidationError::BadMerkleRoot);
    }

    for tx in &block.transactions[1..] {
        validate_non_coinbase_transaction_by_itself(tx)?;
    }

    Ok(())
}

fn validate_no_duplicate_transactions(block: &Block) -> Result<()> {
    let mut seen = HashSet::new();
    for tx in &block.transactions {
        let hash = tx.hash();
        if !seen.insert(hash) {
            return Err(ValidationError::DuplicateTransaction(hash));
        }
    }
    Ok(())
}

fn validate_no_duplicate_output_references(block: &Block) -> Result<()> {
    let mut seen = HashSet::new();
    for tx in &block.transactions {
        for input in &tx.inputs {
            if !seen.insert(input.output_reference) {
                return Err(ValidationError::DuplicateOutputReference(input.output_reference));
            }
        }
    }
    Ok(())
}

/// A non-coinbase transaction's structural rules, independent of chain
/// state: every input carries a real signature, outputs are in range,
/// and it has no internal double-spends.
pub fn validate_non_coinbase_transaction_by_itself(tx: &Transaction) -> Result<()> {
    for input in &tx.inputs {
        if input.signature.is_not_signature() {
            return Err(ValidationError::NotASignature(input.output_reference));
        }
    }
    let mut seen = HashSet::new();
    for input in &tx.inputs {
        if !seen.insert(input.output_reference) {
            return Err(ValidationError::DuplicateOutputReference(input.output_reference));
        }
    }
    let total = tx.total_output();
    if total > MAX_SASHIMI {
        return Err(ValidationError::OutputValueOutOfRange(total));
    }
    for output in &tx.outputs {
        if output.value > MAX_SASHIMI {
            return Err(ValidationError::OutputValueOutOfRange(output.value));
        }
    }
    Ok(())
}

/// Verify that `signature` authorizes spending `output` as part of `tx`.
/// The message signed is the transaction's signable-equivalent
/// encoding, matching how the signature was produced.
pub fn validate_signature_for_spend(tx: &Transaction, output: &Output) -> bool {
    let preimage = tx.signable_equivalent().serialize();
    match &output.public_key {
        PublicKey::Secp256k1(pubkey_bytes) => tx.inputs.iter().any(|input| match &input.signature {
            Signature::Secp256k1(sig) => crypto::verify_signature(pubkey_bytes, &preimage, sig),
            _ => false,
        }),
    }
}

/// Subsidy plus the sum of all non-coinbase transactions' fees
/// (inputs minus outputs) in `block`. Inputs are resolved against the
/// path `block` itself extends, not the whole store.
pub fn block_reward(storage: &Storage, block: &Block) -> Result<u64> {
    let tip = block.previous_block_hash();
    let subsidy = block_subsidy(block.height());
    let mut fees: u64 = 0;
    for tx in &block.transactions[1..] {
        let mut input_total: u64 = 0;
        for input in &tx.inputs {
            let output = storage
                .fetch_output_on_path(&tip, &input.output_reference)?
                .ok_or(ValidationError::OutputNotFound(input.output_reference))?;
            input_total += output.value;
        }
        fees += input_total.saturating_sub(tx.total_output());
    }
    Ok(subsidy + fees)
}

/// Stateful checks for a non-coinbase transaction: every input exists,
/// is unspent, and is correctly signed; outputs never exceed inputs.
/// `tip` scopes the UTXO lookups to the branch `tx` is being validated
/// against, so a rival fork's spends can't shadow this one's outputs.
pub fn validate_non_coinbase_transaction_in_coinstate(
    storage: &Storage,
    tx: &Transaction,
    tip: &Hash256,
) -> Result<()> {
    let mut input_total: u64 = 0;
    for input in &tx.inputs {
        let output = storage
            .fetch_output_on_path(tip, &input.output_reference)?
            .ok_or(ValidationError::OutputNotFound(input.output_reference))?;
        if !storage.is_unspent_on_path(tip, &input.output_reference)? {
            return Err(ValidationError::OutputAlreadySpent(input.output_reference));
        }
        if !validate_signature_for_spend(tx, &output) {
            return Err(ValidationError::BadSignature(input.output_reference));
        }
        input_total += output.value;
    }
    if tx.total_output() > input_total {
        return Err(ValidationError::OutputsExceedInputs { inputs: input_total, outputs: tx.total_output() });
    }
    Ok(())
}

pub fn validate_coinbase_transaction_in_coinstate(storage: &Storage, block: &Block) -> Result<()> {
    let expected = block_reward(storage, block)?;
    let found = block.coinbase().total_output();
    if found > expected {
        return Err(ValidationError::CoinbaseRewardMismatch { expected, found });
    }
    Ok(())
}

/// `new_target = previous_target * elapsed_seconds / DESIRED_TARGET_READJUSTMENT_TIMESPAN`,
/// saturating at the 32-byte maximum (never retargets to an
/// unreachable, too-low target).
pub fn calculate_new_target(previous_target: &[u8; 32], elapsed_seconds: u64) -> [u8; 32] {
    use num_bigint::BigUint;

    let prev = BigUint::from_bytes_be(previous_target);
    let scaled = prev * BigUint::from(elapsed_seconds.max(1));
    let new = scaled / BigUint::from(DESIRED_TARGET_READJUSTMENT_TIMESPAN);

    let max = BigUint::from_bytes_be(&[0xffu8; 32]);
    let clamped = if new > max { max } else { new };

    let bytes = clamped.to_bytes_be();
    let mut out = [0u8; 32];
    let start = 32 - bytes.len();
    out[start..].copy_from_slice(&bytes);
    out
}

/// The target a block at `height` extending `parent` must meet: equal
/// to the parent's target except every `BLOCKS_BETWEEN_TARGET_READJUSTMENT`
/// blocks, when it is recalculated from the actual time the interval took.
pub fn expected_target(storage: &Storage, parent: &ChainBlockInfo, height: u64) -> Result<[u8; 32]> {
    if height % BLOCKS_BETWEEN_TARGET_READJUSTMENT != 0 || height < BLOCKS_BETWEEN_TARGET_READJUSTMENT {
        return Ok(parent.target);
    }
    let interval_start_height = height - BLOCKS_BETWEEN_TARGET_READJUSTMENT;
    let interval_start = storage
        .block_at_height_on_chain(parent.block_hash, interval_start_height)?
        .ok_or(ValidationError::UnknownPreviousBlock(parent.block_hash))?;
    let elapsed = (parent.timestamp as u64).saturating_sub(interval_start.timestamp() as u64);
    Ok(calculate_new_target(&parent.target, elapsed))
}

/// Structural checks on the header alone, plus recomputing and checking
/// the proof of work (which does require the chain, to rebuild the
/// chain sample).
pub fn validate_block_header_by_itself(
    storage: &Storage,
    block: &Block,
    now: u32,
) -> Result<()> {
    let summary = &block.header.summary;
    if summary.timestamp > now + MAX_FUTURE_BLOCK_TIME as u32 {
        return Err(ValidationError::TimestampTooFarInFuture { timestamp: summary.timestamp, now });
    }

    let evidence = pow::construct_pow_evidence(summary, &block.transactions, storage)?;
    if evidence != block.header.pow_evidence {
        return Err(ValidationError::ProofOfWorkMismatch);
    }
    if !pow::meets_target(&evidence.block_hash, &summary.target) {
        return Err(ValidationError::ProofOfWorkAboveTarget);
    }
    Ok(())
}

/// Everything that requires knowing which chain a block extends:
/// height and target continuity, timestamp monotonicity, and every
/// transaction's in-coinstate validity.
pub fn validate_block_in_coinstate(
    storage: &Storage,
    block: &Block,
    parent: &ChainBlockInfo,
    now: u32,
) -> Result<()> {
    if block.height() != parent.height + 1 {
        return Err(ValidationError::HeightMismatch { expected: parent.height + 1, found: block.height() });
    }
    if block.timestamp() <= parent.timestamp {
        return Err(ValidationError::TimestampNotAfterParent {
            timestamp: block.timestamp(),
            parent: parent.timestamp,
        });
    }
    let target = expected_target(storage, parent, block.height())?;
    if block.target() != target {
        return Err(ValidationError::TargetMismatch);
    }

    validate_block_header_by_itself(storage, block, now)?;
    validate_coinbase_transaction_in_coinstate(storage, block)?;
    for tx in &block.transactions[1..] {
        validate_non_coinbase_transaction_in_coinstate(storage, tx, &block.previous_block_hash())?;
    }
    Ok(())
}

/// Checkpointed heights (`height <= MAX_KNOWN_HASH_HEIGHT`) skip the
/// expensive validation above entirely; their hash is simply compared
/// against the compiled-in table.
pub fn validate_checkpoint(height: u64, block_hash: &Hash256) -> Option<Result<()>> {
    if height > MAX_KNOWN_HASH_HEIGHT {
        return None;
    }
    for (known_height, known_hex) in KNOWN_HASHES {
        if *known_height == height {
            let expected = hex::decode(known_hex).ok()?;
            return Some(if expected == block_hash.to_vec() {
                Ok(())
            } else {
                Err(ValidationError::TargetMismatch)
            });
        }
    }
    None
}

/// The pieces of an ancestor block needed to validate the next one,
/// without re-deserializing its full transaction list each time.
#[derive(Debug, Clone, Copy)]
pub struct ChainBlockInfo {
    pub block_hash: Hash256,
    pub height: u64,
    pub timestamp: u32,
    pub target: [u8; 32],
}

/// One entry of `Chain::forks`: a known chain-tip candidate and where
/// its branch last agreed with the canonical chain.
#[derive(Debug, Clone, Copy)]
pub struct ForkInfo {
    pub head: ChainBlockInfo,
    pub common_ancestor_height: u64,
    pub is_canonical: bool,
}

/// Chain state engine: owns the block store, decides which branch is
/// canonical, and serves UTXO queries against the canonical branch.
///
/// Fork-choice: highest height wins; ties are broken by the
/// lexicographically lowest block hash. Cumulative proof-of-work is
/// deliberately not used as a tiebreak (see DESIGN.md).
///
/// `heads` tracks every known chain-tip candidate (a block with no
/// known child yet), not just the canonical one, so a losing fork is
/// never forgotten and a later block extending it can still be
/// recognized as a reorg rather than an orphan.
pub struct Chain {
    storage: Storage,
    tip: ChainBlockInfo,
    heads: std::collections::HashMap<Hash256, ChainBlockInfo>,
}

impl Chain {
    /// Open (or initialize) a chain backed by `storage`, seeded with the
    /// genesis block if the store is empty.
    pub fn open(storage: Storage, genesis: &Block) -> Result<Self> {
        let tip = match storage.canonical_hash_at_height(0)? {
            Some(hash) => storage
                .fetch_chain_row(&hash)?
                .map(|row| ChainBlockInfo {
                    block_hash: row.block_hash,
                    height: row.height,
                    timestamp: row.timestamp,
                    target: row.target,
                })
                .ok_or(ValidationError::UnknownPreviousBlock(hash))?,
            None => {
                storage.write_block(genesis)?;
                storage.set_canonical_at_height(0, &genesis.hash())?;
                ChainBlockInfo {
                    block_hash: genesis.hash(),
                    height: genesis.height(),
                    timestamp: genesis.timestamp(),
                    target: genesis.target(),
                }
            }
        };
        let heads = storage
            .leaf_blocks()?
            .into_iter()
            .map(|row| {
                (
                    row.block_hash,
                    ChainBlockInfo {
                        block_hash: row.block_hash,
                        height: row.height,
                        timestamp: row.timestamp,
                        target: row.target,
                    },
                )
            })
            .collect();
        // Re-walk to find the actual best tip recorded (in case of prior runs
        // that advanced past height 0).
        let mut chain = Chain { storage, tip, heads };
        chain.recompute_tip_from_height(0)?;
        Ok(chain)
    }

    fn recompute_tip_from_height(&mut self, from: u64) -> Result<()> {
        let mut height = from;
        let mut best = self.tip;
        loop {
            match self.storage.canonical_hash_at_height(height + 1)? {
                Some(hash) => {
                    let row = self
                        .storage
                        .fetch_chain_row(&hash)?
                        .ok_or(ValidationError::UnknownPreviousBlock(hash))?;
                    best = ChainBlockInfo {
                        block_hash: row.block_hash,
                        height: row.height,
                        timestamp: row.timestamp,
                        target: row.target,
                    };
                    height += 1;
                }
                None => break,
            }
        }
        self.tip = best;
        Ok(())
    }

    pub fn tip(&self) -> ChainBlockInfo {
        self.tip
    }

    pub fn height(&self) -> u64 {
        self.tip.height
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Validate and, if it extends or beats the current tip, adopt
    /// `block` as part of the canonical chain.
    pub fn add_block(&mut self, block: &Block, now: u32) -> Result<()> {
        let block_hash = block.hash();

        if let Some(result) = validate_checkpoint(block.height(), &block_hash) {
            result?;
        } else {
            validate_block_by_itself(block)?;
            let parent = self
                .storage
                .fetch_chain_row(&block.previous_block_hash())?
                .map(|row| ChainBlockInfo {
                    block_hash: row.block_hash,
                    height: row.height,
                    timestamp: row.timestamp,
                    target: row.target,
                })
                .ok_or(ValidationError::UnknownPreviousBlock(block.previous_block_hash()))?;
            validate_block_in_coinstate(&self.storage, block, &parent, now)?;
        }

        self.storage.write_block(block)?;

        self.heads.remove(&block.previous_block_hash());
        let block_info = ChainBlockInfo {
            block_hash,
            height: block.height(),
            timestamp: block.timestamp(),
            target: block.target(),
        };
        self.heads.insert(block_hash, block_info);

        if self.beats_tip(block.height(), &block_hash) {
            self.reorganize_to(block_info)?;
        }

        Ok(())
    }

    /// Fork-choice comparison: strictly greater height wins; on a tie,
    /// the lexicographically smaller hash wins.
    fn beats_tip(&self, height: u64, hash: &Hash256) -> bool {
        match height.cmp(&self.tip.height) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => hash < &self.tip.block_hash,
            std::cmp::Ordering::Less => false,
        }
    }

    /// Rewrite `canonical_height_index` along `new_tip`'s ancestry until
    /// it reaches a height that is already canonically this block (the
    /// fork point with the previously canonical chain), then adopt
    /// `new_tip`. A direct extension of the old tip stops after one
    /// iteration; a deep reorg rewrites every height back to the point
    /// the two branches diverge.
    fn reorganize_to(&mut self, new_tip: ChainBlockInfo) -> Result<()> {
        let mut current_hash = new_tip.block_hash;
        let mut current_height = new_tip.height;
        loop {
            if self.storage.canonical_hash_at_height(current_height)? == Some(current_hash) {
                break;
            }
            self.storage.set_canonical_at_height(current_height, &current_hash)?;
            if current_height == 0 {
                break;
            }
            let row = self
                .storage
                .fetch_chain_row(&current_hash)?
                .ok_or(ValidationError::UnknownPreviousBlock(current_hash))?;
            current_hash = row.previous_block_hash;
            current_height -= 1;
        }
        self.tip = new_tip;
        Ok(())
    }

    pub fn unspent_outputs_for(&self, public_key: &PublicKey) -> Result<Vec<(OutputReference, Output)>> {
        Ok(self.storage.unspent_outputs_for_public_key_on_path(&self.tip.block_hash, public_key)?)
    }

    pub fn balance_of(&self, public_key: &PublicKey) -> Result<u64> {
        Ok(self
            .storage
            .unspent_outputs_for_public_key_on_path(&self.tip.block_hash, public_key)?
            .into_iter()
            .map(|(_, o)| o.value)
            .sum())
    }

    /// The height at which `head`'s branch and the canonical tip's
    /// branch share a common ancestor: walk the higher one down to
    /// equal height, then walk both down together until their hashes
    /// match.
    fn common_ancestor_height(&self, head: ChainBlockInfo) -> Result<u64> {
        let mut a_hash = head.block_hash;
        let mut a_height = head.height;
        let mut b_hash = self.tip.block_hash;
        let mut b_height = self.tip.height;

        while a_height > b_height {
            a_hash = self
                .storage
                .fetch_chain_row(&a_hash)?
                .ok_or(ValidationError::UnknownPreviousBlock(a_hash))?
                .previous_block_hash;
            a_height -= 1;
        }
        while b_height > a_height {
            b_hash = self
                .storage
                .fetch_chain_row(&b_hash)?
                .ok_or(ValidationError::UnknownPreviousBlock(b_hash))?
                .previous_block_hash;
            b_height -= 1;
        }
        while a_hash != b_hash && a_height > 0 {
            a_hash = self
                .storage
                .fetch_chain_row(&a_hash)?
                .ok_or(ValidationError::UnknownPreviousBlock(a_hash))?
                .previous_block_hash;
            b_hash = self
                .storage
                .fetch_chain_row(&b_hash)?
                .ok_or(ValidationError::UnknownPreviousBlock(b_hash))?
                .previous_block_hash;
            a_height -= 1;
        }
        Ok(a_height)
    }

    /// Every known chain-tip candidate at or above `min_height`, each
    /// paired with the height it last shared with the canonical chain.
    /// Not authoritative over `beats_tip`; purely for operator
    /// visibility into competing branches.
    pub fn forks(&self, min_height: u64) -> Result<Vec<ForkInfo>> {
        let mut out = Vec::new();
        for head in self.heads.values() {
            if head.height < min_height {
                continue;
            }
            let common_ancestor_height = self.common_ancestor_height(*head)?;
            out.push(ForkInfo {
                head: *head,
                common_ancestor_height,
                is_canonical: head.block_hash == self.tip.block_hash,
            });
        }
        out.sort_by(|a, b| b.head.height.cmp(&a.head.height));
        Ok(out)
    }

    /// Diagnostic only, never used for fork-choice (see the §9 Open
    /// Question resolution: height + hash tiebreak, not work). Sums
    /// `2^256 / target` for every canonical block from genesis to the
    /// tip, for operator-facing info output.
    pub fn cumulative_work_estimate(&self) -> Result<num_bigint::BigUint> {
        use num_bigint::BigUint;

        let two_pow_256 = BigUint::from(2u32).pow(256);
        let mut total = BigUint::from(0u32);
        for height in 0..=self.tip.height {
            let hash = self
                .storage
                .canonical_hash_at_height(height)?
                .ok_or(ValidationError::UnknownHeight(height))?;
            let row = self
                .storage
                .fetch_chain_row(&hash)?
                .ok_or(ValidationError::UnknownHeight(height))?;
            let target = BigUint::from_bytes_be(&row.target);
            if target > BigUint::from(0u32) {
                total += &two_pow_256 / &target;
            }
        }
        Ok(total)
    }
}

/// Construct the height-0 block that seeds a brand new chain: a single
/// coinbase transaction paying the height-0 subsidy to `miner_public_key`,
/// mined against `INITIAL_TARGET` at `nonce = 0`. Genesis's chain sample
/// is defined as all-zero (see `pow::construct_chain_sample`), so no
/// block store is consulted while building it.
pub fn genesis_block(miner_public_key: PublicKey, timestamp: u32) -> Block {
    let coinbase = Transaction::new_coinbase(0, block_subsidy(0), miner_public_key, Vec::new());
    let transactions = vec![coinbase];
    let merkle_root_hash = merkle_root(&[transactions[0].hash()]);

    let summary = BlockSummary {
        height: 0,
        previous_block_hash: ZERO_HASH,
        merkle_root_hash,
        timestamp,
        target: INITIAL_TARGET,
        nonce: 0,
    };

    // Height 0 never touches the source; an empty store stands in.
    let scratch = Storage::open_in_memory().expect("in-memory sqlite connection");
    let pow_evidence = pow::construct_pow_evidence(&summary, &transactions, &scratch)
        .expect("genesis chain sample needs no block store");

    Block { header: BlockHeader { version: 0, summary, pow_evidence }, transactions }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> crypto::Keypair {
        crypto::Keypair::generate()
    }

    fn genesis_block(miner: &crypto::Keypair) -> Block {
        super::genesis_block(PublicKey::Secp256k1(miner.public_key_bytes()), 1_700_000_000)
    }

    #[test]
    fn genesis_block_has_single_coinbase_paying_miner() {
        let miner = keypair();
        let block = super::genesis_block(PublicKey::Secp256k1(miner.public_key_bytes()), 1_700_000_000);
        assert_eq!(block.height(), 0);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.transactions[0].total_output(), block_subsidy(0));
        assert!(block.validate_merkle_root());
    }

    #[test]
    fn validate_block_by_itself_accepts_well_formed_genesis() {
        let miner = keypair();
        let block = genesis_block(&miner);
        assert!(validate_block_by_itself(&block).is_ok());
    }

    #[test]
    fn validate_block_by_itself_rejects_bad_merkle_root() {
        let miner = keypair();
        let mut block = genesis_block(&miner);
        block.header.summary.merkle_root_hash = [9u8; 32];
        assert!(matches!(validate_block_by_itself(&block), Err(ValidationError::BadMerkleRoot)));
    }

    #[test]
    fn chain_open_seeds_genesis_and_reports_tip() {
        let storage = Storage::open_in_memory().unwrap();
        let miner = keypair();
        let genesis = genesis_block(&miner);
        let chain = Chain::open(storage, &genesis).unwrap();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.tip().block_hash, genesis.hash());
    }

    #[test]
    fn cumulative_work_estimate_is_positive_at_genesis() {
        let storage = Storage::open_in_memory().unwrap();
        let miner = keypair();
        let genesis = genesis_block(&miner);
        let chain = Chain::open(storage, &genesis).unwrap();
        let work = chain.cumulative_work_estimate().unwrap();
        assert!(work > num_bigint::BigUint::from(0u32));
    }

    #[test]
    fn calculate_new_target_scales_with_elapsed_time() {
        let base = INITIAL_TARGET;
        let on_schedule = calculate_new_target(&base, DESIRED_TARGET_READJUSTMENT_TIMESPAN);
        assert_eq!(on_schedule, base);

        let slower = calculate_new_target(&base, DESIRED_TARGET_READJUSTMENT_TIMESPAN * 2);
        let faster = calculate_new_target(&base, DESIRED_TARGET_READJUSTMENT_TIMESPAN / 2);
        assert!(num_bigint::BigUint::from_bytes_be(&slower) > num_bigint::BigUint::from_bytes_be(&base));
        assert!(num_bigint::BigUint::from_bytes_be(&faster) < num_bigint::BigUint::from_bytes_be(&base));
    }

    #[test]
    fn balance_of_reflects_unspent_coinbase_output() {
        let storage = Storage::open_in_memory().unwrap();
        let miner = keypair();
        let genesis = genesis_block(&miner);
        let chain = Chain::open(storage, &genesis).unwrap();
        let pk = PublicKey::Secp256k1(miner.public_key_bytes());
        assert_eq!(chain.balance_of(&pk).unwrap(), block_subsidy(0));
    }

    /// Mines a block extending `parent_hash` with an easy target, tagging
    /// its coinbase with `salt` so two blocks at the same height never
    /// collide on hash.
    fn mine_child(chain: &Chain, miner: &crypto::Keypair, parent_hash: Hash256, salt: Vec<u8>) -> Block {
        let parent = chain.storage().fetch_chain_row(&parent_hash).unwrap().unwrap();
        let height = parent.height + 1;
        let coinbase = Transaction::new_coinbase(
            height as u32,
            block_subsidy(height),
            PublicKey::Secp256k1(miner.public_key_bytes()),
            salt,
        );
        let transactions = vec![coinbase];
        let merkle_root_hash = merkle_root(&[transactions[0].hash()]);
        let mut summary = BlockSummary {
            height,
            previous_block_hash: parent_hash,
            merkle_root_hash,
            timestamp: parent.timestamp + 1,
            target: [0xffu8; 32],
            nonce: 0,
        };
        let mut nonce: u32 = 0;
        loop {
            summary.nonce = nonce;
            let evidence = pow::construct_pow_evidence(&summary, &transactions, chain.storage()).unwrap();
            if pow::meets_target(&evidence.block_hash, &summary.target) {
                let header = BlockHeader { version: 0, summary, pow_evidence: evidence };
                return Block { header, transactions };
            }
            nonce += 1;
        }
    }

    #[test]
    fn add_block_tracks_heads_and_reorganizes_across_a_fork() {
        let storage = Storage::open_in_memory().unwrap();
        let miner = keypair();
        let genesis = genesis_block(&miner);
        let mut chain = Chain::open(storage, &genesis).unwrap();

        let block_a1 = mine_child(&chain, &miner, genesis.hash(), vec![1]);
        chain.add_block(&block_a1, 1_700_000_100).unwrap();

        let block_b1 = mine_child(&chain, &miner, genesis.hash(), vec![2]);
        chain.add_block(&block_b1, 1_700_000_100).unwrap();

        // Both height-1 blocks are known heads regardless of which one the
        // tiebreak picked as canonical.
        let forks = chain.forks(0).unwrap();
        assert_eq!(forks.len(), 2);
        assert!(forks.iter().all(|f| f.common_ancestor_height == 0));

        // Extend whichever of the two lost the tiebreak; this must win on
        // height and trigger a reorg that rewrites canonical_height_index
        // at height 1 too, not just at the new block's own height.
        let loser = if chain.tip().block_hash == block_a1.hash() { &block_b1 } else { &block_a1 };
        let winner_child = mine_child(&chain, &miner, loser.hash(), vec![3]);
        chain.add_block(&winner_child, 1_700_000_200).unwrap();

        assert_eq!(chain.tip().block_hash, winner_child.hash());
        assert_eq!(chain.height(), 2);

        let pk = PublicKey::Secp256k1(miner.public_key_bytes());
        let expected_balance = block_subsidy(0) + block_subsidy(1) + block_subsidy(2);
        assert_eq!(
            chain.balance_of(&pk).unwrap(),
            expected_balance,
            "the orphaned height-1 block's coinbase must not count twice"
        );

        let forks = chain.forks(0).unwrap();
        assert_eq!(forks.len(), 2);
        assert!(forks.iter().any(|f| f.is_canonical && f.head.block_hash == winner_child.hash()));
    }
}
