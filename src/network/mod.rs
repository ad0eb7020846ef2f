//! Wire protocol, peer connection state machine, and the local peer's
//! event loop.
//!
//! The reactor model is a single-threaded cooperative I/O multiplexer
//! in the system this was distilled from; here that is realized as a
//! `tokio` current-thread runtime with one task per peer connection and
//! one supervisory task — tokio's reactor stands in for the
//! select/epoll loop directly.

use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::core::chain::Chain;
use crate::core::params::*;
use crate::core::serialize::{
    read_u32_be, read_u64_be, read_vlq, safe_read, write_u32_be, write_u64_be, write_vlq,
    SerializeError, Wire,
};
use crate::core::types::{Block, BlockHeader, Hash256, Transaction};

// ─── Wire messages ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Block,
    Header,
    Transaction,
}

impl DataType {
    fn code(self) -> u16 {
        match self {
            DataType::Block => 0x0000,
            DataType::Header => 0x0001,
            DataType::Transaction => 0x0002,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(DataType::Block),
            0x0001 => Some(DataType::Header),
            0x0002 => Some(DataType::Transaction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DataItem {
    Block(Block),
    Header(BlockHeader),
    Transaction(Transaction),
}

/// Fixed-layout envelope carried by every message.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub version: u8,
    pub timestamp: u32,
    pub id: u32,
    pub in_response_to: u32,
    pub context: u64,
}

impl MessageHeader {
    fn new(id: u32, in_response_to: u32) -> Self {
        MessageHeader { version: 0, timestamp: now_secs(), id, in_response_to, context: 0 }
    }

    fn write<W: std::io::Write>(&self, w: &mut W) -> Result<(), SerializeError> {
        w.write_all(&[self.version])?;
        write_u32_be(w, self.timestamp)?;
        write_u32_be(w, self.id)?;
        write_u32_be(w, self.in_response_to)?;
        write_u64_be(w, self.context)?;
        w.write_all(&[0u8; 32])?;
        Ok(())
    }

    fn read<R: std::io::Read>(r: &mut R) -> Result<Self, SerializeError> {
        let version = safe_read(r, 1)?[0];
        let timestamp = read_u32_be(r)?;
        let id = read_u32_be(r)?;
        let in_response_to = read_u32_be(r)?;
        let context = read_u64_be(r)?;
        let _reserved = safe_read(r, 32)?;
        Ok(MessageHeader { version, timestamp, id, in_response_to, context })
    }
}

/// Reserved bytes trailing the `Hello` payload, per the wire format;
/// always zero on write, discarded on read.
const HELLO_RESERVED_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub enum MessageBody {
    Hello {
        supported_versions: Vec<u8>,
        your_ip: [u8; 16],
        your_port: u16,
        my_ip: [u8; 16],
        my_port: u16,
        nonce: u32,
        user_agent: String,
    },
    GetBlocks {
        locator: Vec<Hash256>,
    },
    Inventory {
        hashes: Vec<Hash256>,
    },
    GetData {
        items: Vec<(DataType, Hash256)>,
    },
    Data {
        item: DataItem,
    },
    GetPeers,
    Peers {
        addrs: Vec<String>,
    },
}

impl MessageBody {
    fn type_code(&self) -> u16 {
        match self {
            MessageBody::Hello { .. } => 0x0000,
            MessageBody::GetBlocks { .. } => 0x0001,
            MessageBody::Inventory { .. } => 0x0002,
            MessageBody::GetData { .. } => 0x0003,
            MessageBody::Data { .. } => 0x0004,
            MessageBody::GetPeers => 0x0005,
            MessageBody::Peers { .. } => 0x0006,
        }
    }
}

pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

fn write_hashes<W: std::io::Write>(w: &mut W, hashes: &[Hash256]) -> Result<(), SerializeError> {
    write_vlq(w, hashes.len() as u64)?;
    for h in hashes {
        w.write_all(h)?;
    }
    Ok(())
}

fn read_hashes<R: std::io::Read>(r: &mut R) -> Result<Vec<Hash256>, SerializeError> {
    let len = read_vlq(r)?;
    let mut out = Vec::with_capacity(len.min(1 << 16) as usize);
    for _ in 0..len {
        let bytes = safe_read(r, 32)?;
        let mut h = [0u8; 32];
        h.copy_from_slice(&bytes);
        out.push(h);
    }
    Ok(out)
}

fn write_string<W: std::io::Write>(w: &mut W, s: &str) -> Result<(), SerializeError> {
    let bytes = s.as_bytes();
    write_vlq(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

fn read_string<R: std::io::Read>(r: &mut R) -> Result<String, SerializeError> {
    let len = read_vlq(r)?;
    let bytes = safe_read(r, len as usize)?;
    String::from_utf8(bytes).map_err(|e| SerializeError::Invalid(e.to_string()))
}

pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut payload = Vec::new();
    msg.header.write(&mut payload).expect("writing to Vec never fails");
    write_u32_be(&mut payload, msg.body.type_code() as u32).expect("writing to Vec never fails");

    match &msg.body {
        MessageBody::Hello { supported_versions, your_ip, your_port, my_ip, my_port, nonce, user_agent } => {
            write_vlq(&mut payload, supported_versions.len() as u64).unwrap();
            payload.write_all(supported_versions).unwrap();
            payload.write_all(your_ip).unwrap();
            write_u32_be(&mut payload, *your_port as u32).unwrap();
            payload.write_all(my_ip).unwrap();
            write_u32_be(&mut payload, *my_port as u32).unwrap();
            write_u32_be(&mut payload, *nonce).unwrap();
            write_string(&mut payload, user_agent).unwrap();
            payload.write_all(&[0u8; HELLO_RESERVED_SIZE]).unwrap();
        }
        MessageBody::GetBlocks { locator } => write_hashes(&mut payload, locator).unwrap(),
        MessageBody::Inventory { hashes } => write_hashes(&mut payload, hashes).unwrap(),
        MessageBody::GetData { items } => {
            write_vlq(&mut payload, items.len() as u64).unwrap();
            for (dt, hash) in items {
                write_u32_be(&mut payload, dt.code() as u32).unwrap();
                payload.write_all(hash).unwrap();
            }
        }
        MessageBody::Data { item } => match item {
            DataItem::Block(b) => {
                write_u32_be(&mut payload, DataType::Block.code() as u32).unwrap();
                payload.extend_from_slice(&b.serialize());
            }
            DataItem::Header(h) => {
                write_u32_be(&mut payload, DataType::Header.code() as u32).unwrap();
                payload.extend_from_slice(&h.serialize());
            }
            DataItem::Transaction(t) => {
                write_u32_be(&mut payload, DataType::Transaction.code() as u32).unwrap();
                payload.extend_from_slice(&t.serialize());
            }
        },
        MessageBody::GetPeers => {}
        MessageBody::Peers { addrs } => {
            write_vlq(&mut payload, addrs.len() as u64).unwrap();
            for addr in addrs {
                write_string(&mut payload, addr).unwrap();
            }
        }
    }

    let mut framed = Vec::with_capacity(MAGIC.len() + 4 + payload.len());
    framed.extend_from_slice(&MAGIC);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);
    framed
}

pub fn decode_message_body(bytes: &[u8]) -> Result<Message, SerializeError> {
    let mut cursor = bytes;
    let header = MessageHeader::read(&mut cursor)?;
    let type_code = read_u32_be(&mut cursor)? as u16;

    let body = match type_code {
        0x0000 => {
            let versions_len = read_vlq(&mut cursor)?;
            let supported_versions = safe_read(&mut cursor, versions_len as usize)?;
            let your_ip_bytes = safe_read(&mut cursor, 16)?;
            let mut your_ip = [0u8; 16];
            your_ip.copy_from_slice(&your_ip_bytes);
            let your_port = read_u32_be(&mut cursor)? as u16;
            let my_ip_bytes = safe_read(&mut cursor, 16)?;
            let mut my_ip = [0u8; 16];
            my_ip.copy_from_slice(&my_ip_bytes);
            let my_port = read_u32_be(&mut cursor)? as u16;
            let nonce = read_u32_be(&mut cursor)?;
            let user_agent = read_string(&mut cursor)?;
            let _reserved = safe_read(&mut cursor, HELLO_RESERVED_SIZE)?;
            MessageBody::Hello { supported_versions, your_ip, your_port, my_ip, my_port, nonce, user_agent }
        }
        0x0001 => MessageBody::GetBlocks { locator: read_hashes(&mut cursor)? },
        0x0002 => MessageBody::Inventory { hashes: read_hashes(&mut cursor)? },
        0x0003 => {
            let len = read_vlq(&mut cursor)?;
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                let code = read_u32_be(&mut cursor)? as u16;
                let dt = DataType::from_code(code)
                    .ok_or_else(|| SerializeError::Invalid("unknown data type".into()))?;
                let bytes = safe_read(&mut cursor, 32)?;
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                items.push((dt, hash));
            }
            MessageBody::GetData { items }
        }
        0x0004 => {
            let code = read_u32_be(&mut cursor)? as u16;
            let dt = DataType::from_code(code)
                .ok_or_else(|| SerializeError::Invalid("unknown data type".into()))?;
            let item = match dt {
                DataType::Block => DataItem::Block(Block::stream_deserialize(&mut cursor)?),
                DataType::Header => DataItem::Header(BlockHeader::stream_deserialize(&mut cursor)?),
                DataType::Transaction => {
                    DataItem::Transaction(Transaction::stream_deserialize(&mut cursor)?)
                }
            };
            MessageBody::Data { item }
        }
        0x0005 => MessageBody::GetPeers,
        0x0006 => {
            let len = read_vlq(&mut cursor)?;
            let mut addrs = Vec::with_capacity(len as usize);
            for _ in 0..len {
                addrs.push(read_string(&mut cursor)?);
            }
            MessageBody::Peers { addrs }
        }
        other => return Err(SerializeError::Invalid(format!("unknown message type {other:#06x}"))),
    };

    Ok(Message { header, body })
}

async fn read_framed_message<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad magic"));
    }
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "message too large"));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

fn now_secs() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32
}

/// Sparse block locator: the head, then head - 2^k for k = 0..21. Lets a
/// peer find the fork point in O(log height) round trips.
pub fn build_locator(chain: &Chain) -> Vec<Hash256> {
    let tip = chain.tip();
    let mut locator = Vec::new();
    let mut k: u32 = 0;
    loop {
        let step = if k == 0 { 0 } else { 1u64 << (k - 1) };
        if step > tip.height {
            break;
        }
        let height = tip.height - step;
        if let Ok(Some(block)) = chain.storage().block_at_height_on_chain(tip.block_hash, height) {
            locator.push(block.hash());
        }
        if height == 0 || k >= MAX_LOCATOR_STEPS {
            break;
        }
        k += 1;
    }
    locator
}

/// The height `GetBlocks` inventory should start at: one past the
/// deepest locator hash that is actually on our canonical chain, or
/// height 1 (genesis + 1) if none of them are. Locator entries are
/// walked in order since the requesting peer lists them from its own
/// head backwards, so the first match is the deepest one we can serve.
fn inventory_start_height(chain: &Chain, locator: &[Hash256]) -> u64 {
    for hash in locator {
        let Some(row) = chain.storage().fetch_chain_row(hash).ok().flatten() else { continue };
        let on_canonical_chain = chain
            .storage()
            .block_at_height_on_chain(chain.tip().block_hash, row.height)
            .ok()
            .flatten()
            .map(|b| b.hash())
            == Some(*hash);
        if on_canonical_chain {
            return row.height + 1;
        }
    }
    1
}

// ─── Peer connection state machine ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    Incoming,
    Outgoing,
}

impl PeerDirection {
    fn as_str(self) -> &'static str {
        match self {
            PeerDirection::Incoming => "INCOMING",
            PeerDirection::Outgoing => "OUTGOING",
        }
    }
}

pub struct PeerHandle {
    pub addr: String,
    pub phase: PeerPhase,
    pub direction: PeerDirection,
    pub ban_score: u32,
    pub last_activity: u32,
    pub outbound: mpsc::UnboundedSender<Message>,
}

/// Exponential backoff before the next reconnect attempt, capped at 30
/// minutes, scaled by the peer's accumulated ban score.
pub fn reconnect_backoff_seconds(ban_score: u32) -> u64 {
    (TIME_BETWEEN_CONNECTION_ATTEMPTS * 2u64.saturating_pow(ban_score.min(10))).min(1800)
}

const TIME_BETWEEN_CONNECTION_ATTEMPTS: u64 = 10;

/// A known peer address the node has learned of (via its own `connect`
/// list or a `Peers` response) but may or may not currently be
/// connected to. Persisted to `peers.json` so a restart doesn't forget
/// the network it already found.
#[derive(Debug, Clone)]
pub struct KnownPeerRecord {
    pub host: String,
    pub port: u16,
    pub direction: PeerDirection,
    pub last_seen: u32,
}

/// Insert or refresh `record` at the front of `known`, most-recent-first,
/// capped at `MAX_PEER_LIST_RECORDS`.
fn merge_known_peer(known: &mut Vec<KnownPeerRecord>, record: KnownPeerRecord) {
    known.retain(|p| !(p.host == record.host && p.port == record.port));
    known.insert(0, record);
    known.truncate(MAX_PEER_LIST_RECORDS);
}

/// Days-since-epoch civil calendar conversion (Howard Hinnant's
/// `civil_from_days`), used only to render peer-list timestamps without
/// pulling in a date/time crate for one field.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Renders a unix timestamp as `YYYY-MM-DDTHH:MM:SSZ`.
fn iso8601(timestamp: u32) -> String {
    let days = timestamp as i64 / 86400;
    let secs_of_day = timestamp as i64 % 86400;
    let (year, month, day) = civil_from_days(days);
    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;
    let second = secs_of_day % 60;
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

fn persist_peer_list(path: &std::path::Path, known: &[KnownPeerRecord]) -> std::io::Result<()> {
    let records: Vec<(String, u16, String, String)> = known
        .iter()
        .map(|p| (p.host.clone(), p.port, p.direction.as_str().to_string(), iso8601(p.last_seen)))
        .collect();
    let bytes = serde_json::to_vec_pretty(&records)?;
    std::fs::write(path, bytes)
}

/// Parse a socket address string into its 16-byte IPv6-mapped form and
/// port, as the wire format requires. Unparseable addresses (shouldn't
/// occur; every caller passes through `SocketAddr`) map to all-zero.
fn socket_addr_bytes(addr: &str) -> ([u8; 16], u16) {
    match addr.parse::<SocketAddr>() {
        Ok(sock) => {
            let ip = match sock.ip() {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            (ip.octets(), sock.port())
        }
        Err(_) => ([0u8; 16], 0),
    }
}

fn host_only(addr: &str) -> String {
    match addr.parse::<SocketAddr>() {
        Ok(sock) => sock.ip().to_string(),
        Err(_) => addr.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| addr.to_string()),
    }
}

// ─── Mempool ───────────────────────────────────────────────────────────

/// First-come-first-served mempool: transactions are relayed and mined
/// in the order they were accepted, with no fee-based reordering.
pub struct Mempool {
    order: VecDeque<Hash256>,
    by_hash: HashMap<Hash256, Transaction>,
    max_size: usize,
}

impl Mempool {
    pub fn new(max_size: usize) -> Self {
        Mempool { order: VecDeque::new(), by_hash: HashMap::new(), max_size }
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn insert(&mut self, tx: Transaction) -> bool {
        let hash = tx.hash();
        if self.by_hash.contains_key(&hash) || self.order.len() >= self.max_size {
            return false;
        }
        self.order.push_back(hash);
        self.by_hash.insert(hash, tx);
        true
    }

    pub fn remove_confirmed(&mut self, block: &Block) {
        for tx in &block.transactions[1..] {
            let hash = tx.hash();
            self.by_hash.remove(&hash);
            self.order.retain(|h| *h != hash);
        }
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.order.iter().filter_map(|h| self.by_hash.get(h).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ─── Local peer / event loop ───────────────────────────────────────────

pub struct NodeState {
    pub chain: Mutex<Chain>,
    pub mempool: Mutex<Mempool>,
    pub peers: Mutex<HashMap<String, PeerHandle>>,
    pub known_peers: Mutex<Vec<KnownPeerRecord>>,
    pub listen_port: u16,
    /// Random per-process identity sent in every `Hello`; a peer that
    /// echoes it back is this same process, reached through a loop in
    /// routing or a self-dial.
    pub local_nonce: u32,
    pub peer_list_path: Option<PathBuf>,
}

impl NodeState {
    pub fn new(chain: Chain, listen_port: u16) -> Arc<Self> {
        Self::with_peer_list_path(chain, listen_port, None)
    }

    pub fn with_peer_list_path(chain: Chain, listen_port: u16, peer_list_path: Option<PathBuf>) -> Arc<Self> {
        let known_peers = peer_list_path
            .as_deref()
            .and_then(|path| std::fs::read(path).ok())
            .and_then(|bytes| serde_json::from_slice::<Vec<(String, u16, String, String)>>(&bytes).ok())
            .map(|records| {
                records
                    .into_iter()
                    .map(|(host, port, direction, _last_seen)| KnownPeerRecord {
                        host,
                        port,
                        direction: if direction == "INCOMING" { PeerDirection::Incoming } else { PeerDirection::Outgoing },
                        last_seen: now_secs(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Arc::new(NodeState {
            chain: Mutex::new(chain),
            mempool: Mutex::new(Mempool::new(10_000)),
            peers: Mutex::new(HashMap::new()),
            known_peers: Mutex::new(known_peers),
            listen_port,
            local_nonce: rand::thread_rng().next_u32(),
            peer_list_path,
        })
    }

    async fn persist_known_peers(&self) {
        let Some(path) = &self.peer_list_path else { return };
        let known = self.known_peers.lock().await;
        if let Err(e) = persist_peer_list(path, &known) {
            tracing::warn!(error = %e, "failed to persist peer list");
        }
    }
}

/// Announce a block this node just mined to every connected peer.
pub async fn broadcast_mined_block(state: &Arc<NodeState>, block: Block) {
    broadcast(state, None, MessageBody::Data { item: DataItem::Block(block) }).await;
}

/// Send `body` to every currently connected peer except `exclude_addr`
/// (the peer it arrived from, if any). Used for block and transaction
/// broadcast/re-broadcast.
async fn broadcast(state: &Arc<NodeState>, exclude_addr: Option<&str>, body: MessageBody) {
    let peers = state.peers.lock().await;
    for (addr, handle) in peers.iter() {
        if handle.phase != PeerPhase::Connected {
            continue;
        }
        if exclude_addr == Some(addr.as_str()) {
            continue;
        }
        let msg = Message { header: MessageHeader::new(0, 0), body: body.clone() };
        let _ = handle.outbound.send(msg);
    }
}

pub async fn run_listener(state: Arc<NodeState>, bind_addr: String) -> std::io::Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "listening for peers");
    loop {
        let (stream, addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state, addr.to_string(), PeerDirection::Incoming).await {
                tracing::debug!(%addr, error = %e, "peer connection ended");
            }
        });
    }
}

pub async fn connect_to_peer(state: Arc<NodeState>, addr: String) -> std::io::Result<()> {
    let stream = TcpStream::connect(&addr).await?;
    handle_connection(stream, state, addr, PeerDirection::Outgoing).await
}

/// Periodically asks every connected peer for its peer list and dials
/// any known-but-unconnected address, per GET_PEERS_INTERVAL.
pub async fn peer_discovery_task(state: Arc<NodeState>, stop: Arc<std::sync::atomic::AtomicBool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(GET_PEERS_INTERVAL));
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        interval.tick().await;
        if stop.load(std::sync::atomic::Ordering::Relaxed) {
            break;
        }
        broadcast(&state, None, MessageBody::GetPeers).await;

        let connected: std::collections::HashSet<String> = state.peers.lock().await.keys().cloned().collect();
        let candidates: Vec<(String, u16)> = state
            .known_peers
            .lock()
            .await
            .iter()
            .map(|p| (p.host.clone(), p.port))
            .filter(|(host, port)| !connected.contains(&format!("{host}:{port}")))
            .collect();
        for (host, port) in candidates {
            let addr = format!("{host}:{port}");
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = connect_to_peer(state, addr.clone()).await {
                    tracing::debug!(%addr, error = %e, "could not reconnect to known peer");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<NodeState>,
    addr: String,
    direction: PeerDirection,
) -> std::io::Result<()> {
    let (mut read_half, write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        let mut write_half: OwnedWriteHalf = write_half;
        while let Some(msg) = rx.recv().await {
            if write_half.write_all(&encode_message(&msg)).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });

    {
        let mut peers = state.peers.lock().await;
        peers.insert(
            addr.clone(),
            PeerHandle {
                addr: addr.clone(),
                phase: PeerPhase::Connected,
                direction,
                ban_score: 0,
                last_activity: now_secs(),
                outbound: tx.clone(),
            },
        );
    }

    let (your_ip, your_port) = socket_addr_bytes(&addr);
    let hello = Message {
        header: MessageHeader::new(0, 0),
        body: MessageBody::Hello {
            supported_versions: vec![0],
            your_ip,
            your_port,
            my_ip: [0u8; 16],
            my_port: state.listen_port,
            nonce: state.local_nonce,
            user_agent: format!("majichain/{}", env!("CARGO_PKG_VERSION")),
        },
    };
    let _ = tx.send(hello);

    loop {
        let payload = match read_framed_message(&mut read_half).await {
            Ok(p) => p,
            Err(_) => break,
        };
        let message = match decode_message_body(&payload) {
            Ok(m) => m,
            Err(_) => {
                bump_ban_score(&state, &addr).await;
                continue;
            }
        };
        if let Err(e) = handle_message(&tx, &state, &addr, direction, message).await {
            tracing::debug!(%addr, error = %e, "error handling message");
            break;
        }
    }

    let mut peers = state.peers.lock().await;
    if let Some(p) = peers.get_mut(&addr) {
        p.phase = PeerPhase::Disconnected;
    }
    Ok(())
}

async fn bump_ban_score(state: &Arc<NodeState>, addr: &str) {
    let mut peers = state.peers.lock().await;
    if let Some(p) = peers.get_mut(addr) {
        p.ban_score += 1;
    }
}

async fn handle_message(
    tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<NodeState>,
    addr: &str,
    direction: PeerDirection,
    message: Message,
) -> std::io::Result<()> {
    match message.body {
        MessageBody::Hello { nonce, my_port, .. } => {
            if nonce == state.local_nonce {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "self-connection"));
            }

            {
                let mut peers = state.peers.lock().await;
                if let Some(p) = peers.get_mut(addr) {
                    p.ban_score = 0;
                    p.last_activity = now_secs();
                }
            }

            if direction == PeerDirection::Incoming {
                let candidate_host = host_only(addr);
                let mut known = state.known_peers.lock().await;
                merge_known_peer(
                    &mut known,
                    KnownPeerRecord { host: candidate_host, port: my_port, direction: PeerDirection::Outgoing, last_seen: now_secs() },
                );
                drop(known);
                state.persist_known_peers().await;
            }

            // Immediately attempt IBD against the new peer; the peer
            // side walks the whole locator for the deepest match.
            let locator = {
                let chain = state.chain.lock().await;
                build_locator(&chain)
            };
            let get_blocks = Message {
                header: MessageHeader::new(0, 0),
                body: MessageBody::GetBlocks { locator },
            };
            let _ = tx.send(get_blocks);
        }
        MessageBody::GetBlocks { locator } => {
            let chain = state.chain.lock().await;
            let tip = chain.tip();
            let start = inventory_start_height(&chain, &locator);
            let mut hashes = Vec::new();
            let mut h = start;
            while h <= tip.height && hashes.len() < GET_BLOCKS_INVENTORY_SIZE {
                if let Ok(Some(b)) = chain.storage().block_at_height_on_chain(tip.block_hash, h) {
                    hashes.push(b.hash());
                }
                h += 1;
            }
            drop(chain);
            let msg = Message {
                header: MessageHeader::new(0, message.header.id),
                body: MessageBody::Inventory { hashes },
            };
            let _ = tx.send(msg);
        }
        MessageBody::Inventory { hashes } => {
            let chain = state.chain.lock().await;
            let mut items = Vec::new();
            for h in hashes {
                if chain.storage().fetch_chain_row(&h).ok().flatten().is_none() {
                    items.push((DataType::Block, h));
                }
            }
            drop(chain);
            if !items.is_empty() {
                let msg = Message {
                    header: MessageHeader::new(0, message.header.id),
                    body: MessageBody::GetData { items },
                };
                let _ = tx.send(msg);
            }
        }
        MessageBody::GetData { items } => {
            let chain = state.chain.lock().await;
            for (dt, hash) in items {
                if dt != DataType::Block {
                    continue;
                }
                if let Ok(Some(block)) = chain.storage().fetch_block_by_hash(&hash) {
                    let msg = Message {
                        header: MessageHeader::new(0, message.header.id),
                        body: MessageBody::Data { item: DataItem::Block(block) },
                    };
                    let _ = tx.send(msg);
                }
            }
        }
        MessageBody::Data { item } => match item {
            DataItem::Block(block) => {
                let mut chain = state.chain.lock().await;
                let now = now_secs();
                let was_tip = chain.tip().block_hash;
                match chain.add_block(&block, now) {
                    Ok(()) => {
                        let became_tip = chain.tip().block_hash == block.hash() && chain.tip().block_hash != was_tip;
                        drop(chain);
                        state.mempool.lock().await.remove_confirmed(&block);
                        if became_tip && message.header.in_response_to == 0 {
                            broadcast(state, Some(addr), MessageBody::Data { item: DataItem::Block(block) }).await;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%addr, error = %e, "rejected block from peer");
                        drop(chain);
                        bump_ban_score(state, addr).await;
                    }
                }
            }
            DataItem::Transaction(tx_item) => {
                let is_new = state.mempool.lock().await.insert(tx_item.clone());
                if is_new {
                    broadcast(state, Some(addr), MessageBody::Data { item: DataItem::Transaction(tx_item) }).await;
                }
            }
            DataItem::Header(_) => {}
        },
        MessageBody::GetPeers => {
            let peers = state.peers.lock().await;
            let addrs: Vec<String> = peers.keys().take(MAX_PEER_LIST_RECORDS).cloned().collect();
            drop(peers);
            let msg = Message {
                header: MessageHeader::new(0, message.header.id),
                body: MessageBody::Peers { addrs },
            };
            let _ = tx.send(msg);
        }
        MessageBody::Peers { addrs } => {
            let mut known = state.known_peers.lock().await;
            for addr in addrs {
                let (host, port) = match addr.parse::<SocketAddr>() {
                    Ok(sock) => (sock.ip().to_string(), sock.port()),
                    Err(_) => continue,
                };
                merge_known_peer(&mut known, KnownPeerRecord { host, port, direction: PeerDirection::Outgoing, last_seen: now_secs() });
            }
            drop(known);
            state.persist_known_peers().await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_message_roundtrips() {
        let msg = Message {
            header: MessageHeader::new(7, 0),
            body: MessageBody::Hello {
                supported_versions: vec![0],
                your_ip: [1u8; 16],
                your_port: 9000,
                my_ip: [2u8; 16],
                my_port: 2412,
                nonce: 0xdead_beef,
                user_agent: "majichain/test".to_string(),
            },
        };
        let framed = encode_message(&msg);
        assert_eq!(&framed[0..4], &MAGIC);
        let len = u32::from_be_bytes(framed[4..8].try_into().unwrap()) as usize;
        let decoded = decode_message_body(&framed[8..8 + len]).unwrap();
        assert_eq!(decoded.header.id, 7);
        match decoded.body {
            MessageBody::Hello { supported_versions, your_ip, your_port, my_ip, my_port, nonce, user_agent } => {
                assert_eq!(supported_versions, vec![0]);
                assert_eq!(your_ip, [1u8; 16]);
                assert_eq!(your_port, 9000);
                assert_eq!(my_ip, [2u8; 16]);
                assert_eq!(my_port, 2412);
                assert_eq!(nonce, 0xdead_beef);
                assert_eq!(user_agent, "majichain/test");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn inventory_message_roundtrips() {
        let msg = Message {
            header: MessageHeader::new(1, 0),
            body: MessageBody::Inventory { hashes: vec![[1u8; 32], [2u8; 32]] },
        };
        let framed = encode_message(&msg);
        let len = u32::from_be_bytes(framed[4..8].try_into().unwrap()) as usize;
        let decoded = decode_message_body(&framed[8..8 + len]).unwrap();
        match decoded.body {
            MessageBody::Inventory { hashes } => assert_eq!(hashes, vec![[1u8; 32], [2u8; 32]]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn reconnect_backoff_grows_and_caps() {
        assert_eq!(reconnect_backoff_seconds(0), 10);
        assert_eq!(reconnect_backoff_seconds(1), 20);
        assert!(reconnect_backoff_seconds(10) <= 1800);
    }

    #[test]
    fn mempool_is_fifo_not_fee_sorted() {
        let mut mempool = Mempool::new(10);
        let kp = crate::crypto::Keypair::generate();
        let tx_a = Transaction::new(
            vec![],
            vec![crate::core::types::Output { value: 1, public_key: crate::core::types::PublicKey::Secp256k1(kp.public_key_bytes()) }],
        );
        let tx_b = Transaction::new(
            vec![],
            vec![crate::core::types::Output { value: 2, public_key: crate::core::types::PublicKey::Secp256k1(kp.public_key_bytes()) }],
        );
        mempool.insert(tx_a.clone());
        mempool.insert(tx_b.clone());
        let pending = mempool.pending();
        assert_eq!(pending[0].hash(), tx_a.hash());
        assert_eq!(pending[1].hash(), tx_b.hash());
    }

    #[test]
    fn merge_known_peer_dedupes_and_caps() {
        let mut known = Vec::new();
        for i in 0..5 {
            merge_known_peer(
                &mut known,
                KnownPeerRecord { host: format!("10.0.0.{i}"), port: 2412, direction: PeerDirection::Outgoing, last_seen: i },
            );
        }
        assert_eq!(known.len(), 5);
        // re-seeing the first host refreshes it to the front instead of duplicating
        merge_known_peer(
            &mut known,
            KnownPeerRecord { host: "10.0.0.0".to_string(), port: 2412, direction: PeerDirection::Outgoing, last_seen: 99 },
        );
        assert_eq!(known.len(), 5);
        assert_eq!(known[0].host, "10.0.0.0");
        assert_eq!(known[0].last_seen, 99);
    }

    #[test]
    fn iso8601_renders_known_epoch() {
        assert_eq!(iso8601(0), "1970-01-01T00:00:00Z");
        assert_eq!(iso8601(1_700_000_000), "2023-11-14T22:13:20Z");
    }

    fn mined_chain(miner: &crate::crypto::Keypair, blocks: u64) -> Chain {
        use crate::core::params::{block_subsidy, INITIAL_TARGET};
        use crate::core::types::{BlockSummary, PublicKey, Transaction};
        use crate::pow;
        use crate::storage::Storage;

        let coinbase = Transaction::new_coinbase(0, block_subsidy(0), PublicKey::Secp256k1(miner.public_key_bytes()), Vec::new());
        let genesis_txs = vec![coinbase];
        let merkle_root_hash = crate::core::types::merkle_root(&[genesis_txs[0].hash()]);
        let genesis_summary = BlockSummary {
            height: 0,
            previous_block_hash: crate::core::types::ZERO_HASH,
            merkle_root_hash,
            timestamp: 1_700_000_000,
            target: INITIAL_TARGET,
            nonce: 0,
        };
        let scratch = Storage::open_in_memory().unwrap();
        let genesis_evidence = pow::construct_pow_evidence(&genesis_summary, &genesis_txs, &scratch).unwrap();
        let genesis = Block {
            header: BlockHeader { version: 0, summary: genesis_summary, pow_evidence: genesis_evidence },
            transactions: genesis_txs,
        };

        let storage = Storage::open_in_memory().unwrap();
        let mut chain = Chain::open(storage, &genesis).unwrap();

        let mut parent_hash = genesis.hash();
        let mut parent_timestamp = genesis.timestamp();
        for height in 1..=blocks {
            let coinbase = Transaction::new_coinbase(
                height as u32,
                block_subsidy(height),
                PublicKey::Secp256k1(miner.public_key_bytes()),
                Vec::new(),
            );
            let transactions = vec![coinbase];
            let merkle_root_hash = crate::core::types::merkle_root(&[transactions[0].hash()]);
            let mut summary = BlockSummary {
                height,
                previous_block_hash: parent_hash,
                merkle_root_hash,
                timestamp: parent_timestamp + 1,
                target: [0xffu8; 32],
                nonce: 0,
            };
            let mut nonce = 0u32;
            let block = loop {
                summary.nonce = nonce;
                let evidence = pow::construct_pow_evidence(&summary, &transactions, chain.storage()).unwrap();
                if pow::meets_target(&evidence.block_hash, &summary.target) {
                    break Block {
                        header: BlockHeader { version: 0, summary: summary.clone(), pow_evidence: evidence },
                        transactions: transactions.clone(),
                    };
                }
                nonce += 1;
            };
            chain.add_block(&block, block.timestamp() + 1).unwrap();
            parent_hash = block.hash();
            parent_timestamp = block.timestamp();
        }
        chain
    }

    #[test]
    fn inventory_start_height_matches_deepest_locator_hash() {
        let miner = crate::crypto::Keypair::generate();
        let chain = mined_chain(&miner, 5);

        let tip = chain.tip();
        let height_3 = chain.storage().block_at_height_on_chain(tip.block_hash, 3).unwrap().unwrap().hash();
        let height_1 = chain.storage().block_at_height_on_chain(tip.block_hash, 1).unwrap().unwrap().hash();

        // locator lists the peer's claimed chain newest-first; the
        // deepest entry actually on our chain should win, not the first.
        let locator = vec![[0xabu8; 32], height_3, height_1];
        assert_eq!(inventory_start_height(&chain, &locator), 4);
    }

    #[test]
    fn inventory_start_height_falls_back_to_genesis_plus_one() {
        let miner = crate::crypto::Keypair::generate();
        let chain = mined_chain(&miner, 2);
        let locator = vec![[0xabu8; 32], [0xcdu8; 32]];
        assert_eq!(inventory_start_height(&chain, &locator), 1);
    }
}
