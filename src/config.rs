//! Node configuration assembled from CLI flags.
//!
//! Kept as a plain struct independent of `clap` so it can be
//! constructed by tests or other front-ends without going through
//! argument parsing.

use std::path::PathBuf;

use crate::core::params::DEFAULT_P2P_PORT;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub p2p_port: u16,
    pub connect: Vec<String>,
    pub mine: bool,
    pub mining_threads: usize,
    pub wallet_password: Option<String>,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        NodeConfig {
            data_dir: data_dir.into(),
            p2p_port: DEFAULT_P2P_PORT,
            connect: Vec::new(),
            mine: false,
            mining_threads: 0,
            wallet_password: None,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chain.sqlite3")
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join("wallet.json")
    }

    pub fn peer_list_path(&self) -> PathBuf {
        self.data_dir.join("peers.json")
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.p2p_port)
    }

    pub fn resolved_threads(&self) -> usize {
        if self.mining_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.mining_threads
        }
    }

    pub fn ensure_data_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}
