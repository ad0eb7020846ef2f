//! Block template construction and the nonce search.
//!
//! Mining a block means picking a summary (previous hash, merkle root,
//! timestamp, target) and then searching nonces until the scrypt +
//! chain-sample + BLAKE2b construction in `pow` produces a hash below
//! target. Checking a candidate nonce needs the blocks the chain sample
//! draws from, so each worker holds its own read connection to the
//! block store — sqlite connections are `Send` but not `Sync`, and the
//! workers run on separate OS threads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::chain::{self, Chain, ValidationError};
use crate::core::params::{block_subsidy, MAX_BLOCK_SIZE};
use crate::core::types::{Block, BlockHeader, BlockSummary, PublicKey, Transaction};
use crate::pow::{self, PowError};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub miner_public_key: PublicKey,
    pub threads: usize,
    pub db_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub summary: BlockSummary,
    pub transactions: Vec<Transaction>,
}

fn now_secs() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32
}

/// Assemble a block template extending `chain`'s tip: picks a target
/// via `chain::expected_target`, greedily includes mempool transactions
/// that fit within `MAX_BLOCK_SIZE` and whose inputs are currently
/// spendable, and builds a coinbase paying the subsidy plus their fees
/// to `config.miner_public_key`.
pub fn create_block_template(
    chain: &Chain,
    pending_txs: &[Transaction],
    config: &MinerConfig,
) -> Result<BlockTemplate, ValidationError> {
    let parent = chain.tip();
    let height = parent.height + 1;
    let target = chain::expected_target(chain.storage(), &parent, height)?;

    let now = now_secs();
    let timestamp = now.max(parent.timestamp.saturating_add(1));

    let mut total_fees: u64 = 0;
    let mut included = Vec::new();
    // reserve headroom for the coinbase itself; exact size is checked again below
    let mut block_size: usize = 0;

    for tx in pending_txs {
        if tx.is_coinbase() {
            continue;
        }
        let tx_bytes_len = tx.size();
        if block_size + tx_bytes_len > MAX_BLOCK_SIZE {
            break;
        }

        let mut input_total: u64 = 0;
        let mut spendable = true;
        for input in &tx.inputs {
            match chain.storage().fetch_output_on_path(&parent.block_hash, &input.output_reference) {
                Ok(Some(output)) => {
                    if !chain
                        .storage()
                        .is_unspent_on_path(&parent.block_hash, &input.output_reference)
                        .unwrap_or(false)
                    {
                        spendable = false;
                        break;
                    }
                    input_total += output.value;
                }
                _ => {
                    spendable = false;
                    break;
                }
            }
        }
        if !spendable {
            continue;
        }
        let output_total = tx.total_output();
        if output_total > input_total {
            continue;
        }

        total_fees += input_total - output_total;
        block_size += tx_bytes_len;
        included.push(tx.clone());
    }

    let subsidy = block_subsidy(height);
    let coinbase = Transaction::new_coinbase(
        height as u32,
        subsidy + total_fees,
        config.miner_public_key.clone(),
        Vec::new(),
    );

    let mut transactions = vec![coinbase];
    transactions.extend(included);

    let hashes: Vec<_> = transactions.iter().map(Transaction::hash).collect();
    let merkle_root_hash = crate::core::types::merkle_root(&hashes);

    let summary = BlockSummary {
        height,
        previous_block_hash: parent.block_hash,
        merkle_root_hash,
        timestamp,
        target,
        nonce: 0,
    };

    Ok(BlockTemplate { summary, transactions })
}

pub enum MineOutcome {
    Found(Block),
    Cancelled,
}

/// Search nonces for `template`, using `source` to answer chain-sample
/// lookups. Runs until a valid block is found or `stop` is set; refreshes
/// the timestamp (and so the search space) on nonce-space exhaustion.
pub fn mine_template(
    source: &dyn pow::ChainSampleSource,
    template: &BlockTemplate,
    stop: &AtomicBool,
) -> Result<MineOutcome, PowError> {
    let mut summary = template.summary.clone();
    let mut nonce: u32 = 0;

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(MineOutcome::Cancelled);
        }

        summary.nonce = nonce;
        let evidence = pow::construct_pow_evidence(&summary, &template.transactions, source)?;

        if pow::meets_target(&evidence.block_hash, &summary.target) {
            let header = BlockHeader { version: 0, summary: summary.clone(), pow_evidence: evidence };
            let block = Block { header, transactions: template.transactions.clone() };
            return Ok(MineOutcome::Found(block));
        }

        nonce = nonce.wrapping_add(1);
        if nonce == 0 {
            summary.timestamp = now_secs().max(summary.timestamp.saturating_add(1));
        }
    }
}

/// Split the nonce space across `threads` workers, each with its own
/// storage connection to `db_path`. The first worker to find a valid
/// nonce wins; the rest are signalled to stop.
pub fn mine_template_parallel(
    template: &BlockTemplate,
    config: &MinerConfig,
    stop: Arc<AtomicBool>,
) -> std::io::Result<MineOutcome> {
    if config.threads <= 1 {
        let storage = Storage::open(&config.db_path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        return mine_template(&storage, template, &stop)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
    }

    let threads = config.threads;
    let nonce_range_size = u32::MAX / threads as u32;
    let (tx, rx) = std::sync::mpsc::channel();

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let db_path = config.db_path.clone();
            let template = template.clone();
            let stop = stop.clone();
            let tx = tx.clone();
            let start_nonce = i as u32 * nonce_range_size;
            let end_nonce = if i as u32 + 1 == threads as u32 {
                u32::MAX
            } else {
                start_nonce + nonce_range_size
            };

            std::thread::spawn(move || {
                let storage = match Storage::open(&db_path) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let mut summary = template.summary.clone();
                let mut nonce = start_nonce;
                while nonce < end_nonce {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    summary.nonce = nonce;
                    if let Ok(evidence) =
                        pow::construct_pow_evidence(&summary, &template.transactions, &storage)
                    {
                        if pow::meets_target(&evidence.block_hash, &summary.target) {
                            let header =
                                BlockHeader { version: 0, summary: summary.clone(), pow_evidence: evidence };
                            let block = Block { header, transactions: template.transactions.clone() };
                            let _ = tx.send(block);
                            stop.store(true, Ordering::Relaxed);
                            return;
                        }
                    }
                    nonce = nonce.wrapping_add(1);
                }
            })
        })
        .collect();

    drop(tx);

    let outcome = match rx.recv() {
        Ok(block) => {
            stop.store(true, Ordering::Relaxed);
            MineOutcome::Found(block)
        }
        Err(_) => MineOutcome::Cancelled,
    };

    for handle in handles {
        let _ = handle.join();
    }

    Ok(outcome)
}

/// Continuously build and mine templates, adding each found block to
/// `chain`. Intended to run on the node's mining thread when `--mine`
/// is passed; `pending_txs` is typically the mempool's current FIFO
/// snapshot.
pub fn mining_loop(
    chain: &mut Chain,
    pending_txs_source: impl Fn() -> Vec<Transaction>,
    config: &MinerConfig,
    stop: Arc<AtomicBool>,
) {
    tracing::info!(threads = config.threads, "starting mining loop");

    while !stop.load(Ordering::Relaxed) {
        let pending_txs = pending_txs_source();
        let template = match create_block_template(chain, &pending_txs, config) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "failed to build block template");
                break;
            }
        };

        let mine_stop = Arc::new(AtomicBool::new(false));
        let result = mine_template_parallel(&template, config, mine_stop);

        match result {
            Ok(MineOutcome::Found(block)) => {
                let hash = block.hash();
                match chain.add_block(&block, now_secs()) {
                    Ok(()) => {
                        tracing::info!(height = block.height(), hash = %hex::encode(hash), "mined block");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "mined block rejected by own chain");
                    }
                }
            }
            Ok(MineOutcome::Cancelled) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "mining error");
                break;
            }
        }
    }

    tracing::info!("mining loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Output;
    use crate::crypto;
    use crate::storage::Storage;

    fn genesis_block(miner: &crypto::Keypair) -> Block {
        let coinbase = Transaction::new_coinbase(0, block_subsidy(0), PublicKey::Secp256k1(miner.public_key_bytes()), Vec::new());
        let transactions = vec![coinbase];
        let hashes: Vec<_> = transactions.iter().map(Transaction::hash).collect();
        let merkle_root_hash = crate::core::types::merkle_root(&hashes);
        let summary = BlockSummary {
            height: 0,
            previous_block_hash: crate::core::types::ZERO_HASH,
            merkle_root_hash,
            timestamp: 1_700_000_000,
            target: crate::core::params::INITIAL_TARGET,
            nonce: 0,
        };
        let storage = Storage::open_in_memory().unwrap();
        let evidence = pow::construct_pow_evidence(&summary, &transactions, &storage).unwrap();
        let header = BlockHeader { version: 0, summary, pow_evidence: evidence };
        Block { header, transactions }
    }

    #[test]
    fn create_block_template_pays_subsidy_to_miner() {
        let miner = crypto::Keypair::generate();
        let genesis = genesis_block(&miner);
        let storage = Storage::open_in_memory().unwrap();
        let chain = Chain::open(storage, &genesis).unwrap();

        let config = MinerConfig {
            miner_public_key: PublicKey::Secp256k1(miner.public_key_bytes()),
            threads: 1,
            db_path: PathBuf::new(),
        };
        let template = create_block_template(&chain, &[], &config).unwrap();

        assert_eq!(template.summary.height, 1);
        assert_eq!(template.summary.previous_block_hash, genesis.hash());
        assert_eq!(template.transactions.len(), 1);
        assert!(template.transactions[0].is_coinbase());
        assert_eq!(template.transactions[0].total_output(), block_subsidy(1));
    }

    #[test]
    fn mine_template_single_threaded_finds_block_meeting_target() {
        let miner = crypto::Keypair::generate();
        let genesis = genesis_block(&miner);
        let storage = Storage::open_in_memory().unwrap();
        let chain = Chain::open(storage, &genesis).unwrap();

        let config = MinerConfig {
            miner_public_key: PublicKey::Secp256k1(miner.public_key_bytes()),
            threads: 1,
            db_path: PathBuf::new(),
        };
        let mut template = create_block_template(&chain, &[], &config).unwrap();
        // easy target so the test terminates quickly
        template.summary.target = [0xffu8; 32];

        let stop = AtomicBool::new(false);
        match mine_template(chain.storage(), &template, &stop).unwrap() {
            MineOutcome::Found(block) => {
                assert!(pow::meets_target(&block.header.pow_evidence.block_hash, &block.header.summary.target));
            }
            MineOutcome::Cancelled => panic!("should not be cancelled"),
        }
    }

    #[test]
    fn excludes_transaction_with_unknown_input() {
        let miner = crypto::Keypair::generate();
        let genesis = genesis_block(&miner);
        let storage = Storage::open_in_memory().unwrap();
        let chain = Chain::open(storage, &genesis).unwrap();

        let bogus_tx = Transaction::new(
            vec![crate::core::types::Input {
                output_reference: crate::core::types::OutputReference { tx_hash: [9u8; 32], index: 0 },
                signature: crate::core::types::Signature::Secp256k1([0u8; 64]),
            }],
            vec![Output { value: 1, public_key: PublicKey::Secp256k1(miner.public_key_bytes()) }],
        );

        let config = MinerConfig {
            miner_public_key: PublicKey::Secp256k1(miner.public_key_bytes()),
            threads: 1,
            db_path: PathBuf::new(),
        };
        let template = create_block_template(&chain, &[bogus_tx], &config).unwrap();
        assert_eq!(template.transactions.len(), 1);
    }
}
