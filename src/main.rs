use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use majichain::config::NodeConfig;
use majichain::core::chain::{self, Chain};
use majichain::core::params::{DEFAULT_P2P_PORT, SASHIMI_PER_COIN};
use majichain::miner::{self, MinerConfig};
use majichain::network::{self, NodeState};
use majichain::storage::Storage;
use majichain::wallet::{self, Wallet};

const DEFAULT_DATA_DIR: &str = "majichain_data";
/// Fixed timestamp baked into every freshly bootstrapped chain's
/// genesis block, so two independently initialized nodes agree on it.
const GENESIS_TIMESTAMP: u32 = 1_700_000_000;

#[derive(Parser)]
#[command(name = "majichain", version)]
#[command(about = "Majichain - a fair, accessible proof-of-work blockchain node")]
struct Cli {
    #[arg(long, default_value = DEFAULT_DATA_DIR, global = true)]
    data_dir: String,
    #[arg(long, default_value_t = DEFAULT_P2P_PORT, global = true)]
    port: u16,
    /// Wallet password (for encrypted wallets)
    #[arg(long, global = true)]
    password: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new node: create the data directory, seed the
    /// chain with a genesis block, and create a wallet.
    Init,
    /// Run a full node.
    Node {
        #[arg(short, long)]
        connect: Vec<String>,
        #[arg(short, long)]
        mine: bool,
        #[arg(short, long, default_value_t = 0)]
        threads: usize,
    },
    /// Send coins to an address.
    Send {
        #[arg(short, long)]
        to: String,
        #[arg(short, long)]
        amount: f64,
        #[arg(short, long, default_value_t = 0.0001)]
        fee: f64,
    },
    /// Show wallet balance.
    Balance,
    /// Wallet management.
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },
    /// Show local chain info.
    Info,
}

#[derive(Subcommand)]
enum WalletAction {
    /// Show wallet addresses.
    Show,
    /// Generate a new receiving address.
    NewAddress,
    /// Encrypt the wallet with a password.
    Encrypt {
        #[arg(short, long)]
        password: String,
    },
    /// Remove wallet encryption.
    Decrypt {
        #[arg(short, long)]
        password: String,
    },
}

fn format_coins(sashimi: u64) -> String {
    let whole = sashimi / SASHIMI_PER_COIN;
    let frac = sashimi % SASHIMI_PER_COIN;
    if frac == 0 {
        format!("{whole}")
    } else {
        format!("{whole}.{frac:08}").trim_end_matches('0').to_string()
    }
}

fn parse_coins(amount: f64) -> u64 {
    (amount * SASHIMI_PER_COIN as f64).round() as u64
}

fn load_wallet(config: &NodeConfig) -> Wallet {
    Wallet::load_or_create_with_password(&config.wallet_path(), "node", config.wallet_password.as_deref())
}

/// Open the chain, seeding a fresh genesis block (paying the wallet's
/// primary address) if the store is empty.
fn open_chain(config: &NodeConfig, wallet: &Wallet) -> Chain {
    config.ensure_data_dir().unwrap_or_else(|e| {
        eprintln!("failed to create data directory: {e}");
        std::process::exit(1);
    });
    let storage = Storage::open(config.db_path()).unwrap_or_else(|e| {
        eprintln!("failed to open block store: {e}");
        std::process::exit(1);
    });
    let genesis = chain::genesis_block(wallet.primary_public_key(), GENESIS_TIMESTAMP);
    Chain::open(storage, &genesis).unwrap_or_else(|e| {
        eprintln!("failed to open chain: {e}");
        std::process::exit(1);
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("majichain=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = NodeConfig::new(PathBuf::from(&cli.data_dir));
    config.p2p_port = cli.port;
    config.wallet_password = cli.password.clone();

    match cli.command {
        Commands::Init => {
            let wallet = load_wallet(&config);
            let chain = open_chain(&config, &wallet);
            println!("Majichain node initialized.");
            println!("  Data:      {}", config.data_dir.display());
            println!("  Height:    {}", chain.height());
            println!("  Tip:       {}", hex::encode(chain.tip().block_hash));
            println!("  Wallet:    {}", wallet.primary_address());
            println!("  Encrypted: {}", wallet.is_encrypted());
            println!("\n  Run: majichain node --mine");
        }

        Commands::Node { connect, mine, threads } => {
            config.connect = connect;
            config.mine = mine;
            config.mining_threads = threads;
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(run_node(config));
        }

        Commands::Info => {
            let wallet = load_wallet(&config);
            let chain = open_chain(&config, &wallet);
            println!("Majichain (local store)");
            println!("  Height: {}", chain.height());
            println!("  Tip:    {}", hex::encode(chain.tip().block_hash));
            println!("  Target: {}", hex::encode(chain.tip().target));
            if let Ok(work) = chain.cumulative_work_estimate() {
                println!("  Work:   {work} (diagnostic only, not used for fork-choice)");
            }
        }

        Commands::Balance => {
            let wallet = load_wallet(&config);
            let chain = open_chain(&config, &wallet);
            let mut total = 0u64;
            for (i, addr) in wallet.addresses().iter().enumerate() {
                let public_key = wallet::address_to_public_key(addr).expect("wallet produced its own address");
                let bal = chain.balance_of(&public_key).unwrap_or(0);
                total += bal;
                if bal > 0 || i == 0 {
                    println!("  {addr} {}{}", format_coins(bal), if i == 0 { " (primary)" } else { "" });
                }
            }
            println!("  Total: {}", format_coins(total));
        }

        Commands::Send { to, amount, fee } => {
            let recipient = match wallet::address_to_public_key(&to) {
                Some(pk) => pk,
                None => {
                    eprintln!("Invalid address: {to}");
                    std::process::exit(1);
                }
            };
            let wallet = load_wallet(&config);
            let chain = open_chain(&config, &wallet);
            let amount_base = parse_coins(amount);
            let fee_base = parse_coins(fee);

            let tx = match wallet.create_send_tx(&chain, recipient, amount_base, fee_base) {
                Ok(tx) => tx,
                Err(e) => {
                    eprintln!("Insufficient balance: {e}");
                    std::process::exit(1);
                }
            };
            drop(chain);

            let pending_path = config.data_dir.join("pending_tx.bin");
            if let Err(e) = std::fs::write(&pending_path, majichain::core::serialize::Wire::serialize(&tx)) {
                eprintln!("failed to save pending transaction: {e}");
                std::process::exit(1);
            }
            println!(
                "Prepared send of {} to {to} (fee {}). Start the node to broadcast it.",
                format_coins(amount_base),
                format_coins(fee_base)
            );
        }

        Commands::Wallet { action } => match action {
            WalletAction::Show => {
                let wallet = load_wallet(&config);
                println!("Wallet: {}", config.wallet_path().display());
                println!("  Encrypted: {}", wallet.is_encrypted());
                for (i, addr) in wallet.addresses().iter().enumerate() {
                    println!("  [{i}] {addr}{}", if i == 0 { " (primary)" } else { "" });
                }
            }
            WalletAction::NewAddress => {
                let mut wallet = load_wallet(&config);
                println!("New address: {}", wallet.new_address());
            }
            WalletAction::Encrypt { password } => {
                let mut wallet = load_wallet(&config);
                if wallet.is_encrypted() {
                    eprintln!("Wallet is already encrypted; decrypt first to change password.");
                    std::process::exit(1);
                }
                wallet.set_password(&password);
                println!("Wallet encrypted. Pass --password to access it from now on.");
            }
            WalletAction::Decrypt { password } => {
                let mut config_with_password = config.clone();
                config_with_password.wallet_password = Some(password);
                let mut wallet = load_wallet(&config_with_password);
                wallet.remove_password();
                println!("Wallet decrypted. Keys are now stored in plaintext.");
            }
        },
    }
}

async fn run_node(config: NodeConfig) {
    config.ensure_data_dir().expect("create data directory");
    let wallet = load_wallet(&config);
    let chain = open_chain(&config, &wallet);

    tracing::info!(
        data_dir = %config.data_dir.display(),
        port = config.p2p_port,
        height = chain.height(),
        tip = %hex::encode(chain.tip().block_hash),
        wallet = %wallet.primary_address(),
        mining = config.mine,
        "starting node",
    );

    let state = NodeState::with_peer_list_path(chain, config.p2p_port, Some(config.peer_list_path()));

    let pending_path = config.data_dir.join("pending_tx.bin");
    if let Ok(bytes) = std::fs::read(&pending_path) {
        match <majichain::core::types::Transaction as majichain::core::serialize::Wire>::deserialize(&bytes) {
            Ok(tx) => {
                state.mempool.lock().await.insert(tx);
                let _ = std::fs::remove_file(&pending_path);
                tracing::info!("loaded previously prepared transaction into the mempool");
            }
            Err(e) => tracing::warn!(error = %e, "failed to load pending transaction"),
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down");
            stop.store(true, Ordering::SeqCst);
        })
        .expect("installing Ctrl-C handler");
    }

    {
        let state = state.clone();
        let bind_addr = config.bind_addr();
        tokio::spawn(async move {
            if let Err(e) = network::run_listener(state, bind_addr).await {
                tracing::error!(error = %e, "listener stopped");
            }
        });
    }

    for addr in &config.connect {
        let state = state.clone();
        let addr = addr.clone();
        tokio::spawn(async move {
            if let Err(e) = network::connect_to_peer(state, addr.clone()).await {
                tracing::debug!(%addr, error = %e, "could not connect to peer");
            }
        });
    }

    if config.mine {
        let state = state.clone();
        let miner_config = MinerConfig {
            miner_public_key: wallet.primary_public_key(),
            threads: config.resolved_threads(),
            db_path: config.db_path(),
        };
        let stop = stop.clone();
        tracing::info!(threads = miner_config.threads, "mining enabled");
        tokio::spawn(async move { mining_task(state, miner_config, stop).await });
    }

    {
        let state = state.clone();
        let stop = stop.clone();
        tokio::spawn(async move { status_task(state, stop).await });
    }

    {
        let state = state.clone();
        let stop = stop.clone();
        tokio::spawn(async move { network::peer_discovery_task(state, stop).await });
    }

    while !stop.load(Ordering::Relaxed) {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
    tracing::info!("node stopped");
}

/// Builds a template against the current tip, hands the CPU-bound
/// nonce search to a blocking thread, then re-locks the chain just
/// long enough to apply the result and broadcast it. The chain lock is
/// never held during the search, so incoming peer blocks and
/// transactions are still processed while this node mines.
async fn mining_task(state: Arc<NodeState>, config: MinerConfig, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        let pending = state.mempool.lock().await.pending();
        let template = {
            let chain = state.chain.lock().await;
            miner::create_block_template(&chain, &pending, &config)
        };
        let template = match template {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "failed to build block template");
                break;
            }
        };

        let mine_stop = Arc::new(AtomicBool::new(false));
        let outer_stop = stop.clone();
        let watcher_stop = mine_stop.clone();
        let watcher = tokio::spawn(async move {
            while !outer_stop.load(Ordering::Relaxed) {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            watcher_stop.store(true, Ordering::Relaxed);
        });

        let config_clone = config.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            miner::mine_template_parallel(&template, &config_clone, mine_stop)
        })
        .await;
        watcher.abort();

        let block = match outcome {
            Ok(Ok(miner::MineOutcome::Found(block))) => block,
            Ok(Ok(miner::MineOutcome::Cancelled)) => continue,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "mining error");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "mining task panicked");
                break;
            }
        };

        let hash = block.hash();
        let height = block.height();
        let mut chain = state.chain.lock().await;
        match chain.add_block(&block, now_secs()) {
            Ok(()) => {
                drop(chain);
                state.mempool.lock().await.remove_confirmed(&block);
                network::broadcast_mined_block(&state, block).await;
                tracing::info!(height, hash = %hex::encode(hash), "mined block");
            }
            Err(e) => {
                tracing::error!(error = %e, "mined block rejected by own chain");
            }
        }
    }
}

fn now_secs() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32
}

async fn status_task(state: Arc<NodeState>, stop: Arc<AtomicBool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        interval.tick().await;
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let chain = state.chain.lock().await;
        let tip = chain.tip();
        drop(chain);
        let mempool_len = state.mempool.lock().await.len();
        let peer_count = state.peers.lock().await.len();
        tracing::info!(
            height = tip.height,
            tip = %hex::encode(tip.block_hash),
            mempool = mempool_len,
            peers = peer_count,
            "status",
        );
    }
}
