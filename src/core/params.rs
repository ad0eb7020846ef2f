//! Chain parameters. All consensus-critical constants are defined here.

/// Smallest indivisible unit of the currency; 10^8 sashimi = 1 coin.
pub const SASHIMI_PER_COIN: u64 = 100_000_000;

/// Upper bound (inclusive) for any single output value or the sum of a
/// transaction's output values.
pub const MAX_SASHIMI: u64 = 2_099_999_986_350_000;

/// Initial block subsidy: 10 coins.
pub const INITIAL_SUBSIDY: u64 = 10 * SASHIMI_PER_COIN;

/// Subsidy halves every 1,050,000 blocks; after 64 halvings it is zero.
pub const SUBSIDY_HALVING_INTERVAL: u64 = 1_050_000;

/// Desired average seconds between blocks.
pub const DESIRED_BLOCK_TIMESPAN: u64 = 120;

/// Blocks between difficulty retargets.
pub const BLOCKS_BETWEEN_TARGET_READJUSTMENT: u64 = 2016 * 5;

/// Desired real-world duration of one retarget interval.
pub const DESIRED_TARGET_READJUSTMENT_TIMESPAN: u64 =
    DESIRED_BLOCK_TIMESPAN * BLOCKS_BETWEEN_TARGET_READJUSTMENT;

/// Genesis / pre-retarget target: 2^248, i.e. one 0x01 byte followed by
/// 31 zero bytes in big-endian 32-byte form.
pub const INITIAL_TARGET: [u8; 32] = {
    let mut t = [0u8; 32];
    t[0] = 0x01;
    t
};

/// Maximum serialized block size in bytes. Also the implicit upper
/// bound on any single transaction's serialized size.
pub const MAX_BLOCK_SIZE: usize = 200_000;

/// Maximum length of the miner-supplied random data in `CoinbaseData`.
pub const MAX_COINBASE_RANDOM_DATA_SIZE: usize = 200;

/// A block's timestamp may not exceed `now + MAX_FUTURE_BLOCK_TIME`.
pub const MAX_FUTURE_BLOCK_TIME: u64 = 30;

/// Number of chain-sample slices drawn per block.
pub const CHAIN_SAMPLE_COUNT: usize = 8;
/// Size in bytes of each chain-sample slice.
pub const CHAIN_SAMPLE_SIZE: usize = 4;
/// Total chain-sample size: `CHAIN_SAMPLE_COUNT * CHAIN_SAMPLE_SIZE`.
pub const CHAIN_SAMPLE_TOTAL_SIZE: usize = CHAIN_SAMPLE_COUNT * CHAIN_SAMPLE_SIZE;

/// scrypt cost parameters for the proof-of-work summary hash.
pub const SCRYPT_LOG2_N: u8 = 15;
pub const SCRYPT_R: u32 = 8;
pub const SCRYPT_P: u32 = 1;

/// Default P2P listening port.
pub const DEFAULT_P2P_PORT: u16 = 2412;

/// Wire protocol magic bytes, ASCII "MAJI".
pub const MAGIC: [u8; 4] = *b"MAJI";

/// Maximum on-wire message size (magic + length prefix excluded).
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Height below which the hard-coded checkpoint table is authoritative.
pub const MAX_KNOWN_HASH_HEIGHT: u64 = 0;

/// Hard-coded checkpoint table: height -> block hash (hex). Compile-time
/// constant; must never be extended at runtime.
pub const KNOWN_HASHES: &[(u64, &str)] = &[(
    0,
    "00c4ff1d0788c7058f3d8388d77b2feda0921fa141078fb895871634e0c36780",
)];

pub const GET_PEERS_INTERVAL: u64 = 30 * 60;
pub const MAX_PEER_LIST_RECORDS: usize = 100;
pub const GET_BLOCKS_INVENTORY_SIZE: usize = 500;
pub const SWITCH_TO_ACTIVE_MODE_TIMEOUT: u64 = 300;
pub const IBD_PEER_ACTIVITY_TIMEOUT: u64 = 60;
pub const IBD_REQUEST_LIFETIME: u64 = 1800;
pub const MAX_LOCATOR_STEPS: u32 = 22; // k = 0..21

/// Subsidy (block reward before fees) at a given height.
pub fn block_subsidy(height: u64) -> u64 {
    let halvings = height / SUBSIDY_HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsidy_schedule_matches_spec_examples() {
        assert_eq!(block_subsidy(0), 10 * SASHIMI_PER_COIN);
        assert_eq!(block_subsidy(1_049_999), 10 * SASHIMI_PER_COIN);
        assert_eq!(block_subsidy(1_050_000), 5 * SASHIMI_PER_COIN);
        assert_eq!(block_subsidy(31_499_999), 1);
        assert_eq!(block_subsidy(31_500_000), 0);
    }

    #[test]
    fn initial_target_is_two_pow_248() {
        assert_eq!(INITIAL_TARGET[0], 0x01);
        assert!(INITIAL_TARGET[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn chain_sample_total_size_is_32_bytes() {
        assert_eq!(CHAIN_SAMPLE_TOTAL_SIZE, 32);
    }
}
