//! Keypairs, addresses, and UTXO-selecting transaction construction.
//!
//! Addresses are not derived by hashing the public key (there is no
//! pay-to-pubkey-hash scripting here, see `DESIGN.md`): an address is
//! just the literal hex public key wrapped in a fixed prefix/suffix, so
//! `Output.public_key` can be recovered from it directly.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::core::chain::Chain;
use crate::core::types::{Input, Output, OutputReference, PublicKey, Signature, Transaction};
use crate::crypto;

const ADDRESS_PREFIX: &str = "SKE";
const ADDRESS_SUFFIX: &str = "PTI";

/// A SECP256k1 keypair plus its wire-format address.
#[derive(Clone)]
pub struct Keypair {
    inner: crypto::Keypair,
}

impl Keypair {
    pub fn generate() -> Self {
        Keypair { inner: crypto::Keypair::generate() }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, secp256k1::Error> {
        Ok(Keypair { inner: crypto::Keypair::from_secret_bytes(bytes)? })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::Secp256k1(self.inner.public_key_bytes())
    }

    pub fn address(&self) -> String {
        public_key_to_address(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.inner.sign(message)
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.inner.secret_bytes()
    }
}

pub fn public_key_to_address(public_key: &PublicKey) -> String {
    let PublicKey::Secp256k1(bytes) = public_key;
    format!("{ADDRESS_PREFIX}{}{ADDRESS_SUFFIX}", hex::encode(bytes))
}

pub fn address_to_public_key(address: &str) -> Option<PublicKey> {
    let body = address.strip_prefix(ADDRESS_PREFIX)?.strip_suffix(ADDRESS_SUFFIX)?;
    let bytes = hex::decode(body).ok()?;
    if bytes.len() != 64 {
        return None;
    }
    let mut pubkey = [0u8; 64];
    pubkey.copy_from_slice(&bytes);
    Some(PublicKey::Secp256k1(pubkey))
}

// ─── Wallet file ────────────────────────────────────────────────────

const WALLET_VERSION: u32 = 1;
const KDF_ITERATIONS: u32 = 100_000;

#[derive(Serialize, Deserialize)]
pub struct WalletFile {
    pub version: u32,
    pub encrypted: bool,
    #[serde(default)]
    pub keys: Vec<[u8; 32]>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub ciphertext: Option<String>,
}

/// Derive a 32-byte encryption key from password + salt using iterated
/// SHA-256.
fn derive_key(password: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(password.len() + salt.len());
    data.extend_from_slice(password);
    data.extend_from_slice(salt);
    let mut hash = Sha256::digest(&data);
    for _ in 0..KDF_ITERATIONS {
        hash = Sha256::digest(&hash);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash);
    key
}

/// SHA-256-counter-mode keystream XOR, with a trailing SHA-256 MAC over
/// key||ciphertext for integrity.
fn encrypt_data(plaintext: &[u8], key: &[u8; 32], nonce: &[u8; 12]) -> Vec<u8> {
    let mut ciphertext = Vec::with_capacity(plaintext.len() + 32);
    let mut keystream_pos = 32;
    let mut block_counter = 0u64;
    let mut keystream_block = [0u8; 32];

    for &byte in plaintext {
        if keystream_pos >= 32 {
            let mut input = Vec::with_capacity(32 + 12 + 8);
            input.extend_from_slice(key);
            input.extend_from_slice(nonce);
            input.extend_from_slice(&block_counter.to_le_bytes());
            keystream_block.copy_from_slice(&Sha256::digest(&input));
            block_counter += 1;
            keystream_pos = 0;
        }
        ciphertext.push(byte ^ keystream_block[keystream_pos]);
        keystream_pos += 1;
    }

    let mut mac_input = Vec::with_capacity(32 + ciphertext.len());
    mac_input.extend_from_slice(key);
    mac_input.extend_from_slice(&ciphertext);
    ciphertext.extend_from_slice(&Sha256::digest(&mac_input));
    ciphertext
}

fn decrypt_data(ciphertext_with_mac: &[u8], key: &[u8; 32], nonce: &[u8; 12]) -> Result<Vec<u8>, String> {
    if ciphertext_with_mac.len() < 32 {
        return Err("ciphertext too short".into());
    }
    let (ciphertext, mac) = ciphertext_with_mac.split_at(ciphertext_with_mac.len() - 32);

    let mut mac_input = Vec::with_capacity(32 + ciphertext.len());
    mac_input.extend_from_slice(key);
    mac_input.extend_from_slice(ciphertext);
    if mac != Sha256::digest(&mac_input).as_slice() {
        return Err("wrong password or corrupted wallet".into());
    }

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    let mut keystream_pos = 32;
    let mut block_counter = 0u64;
    let mut keystream_block = [0u8; 32];
    for &byte in ciphertext {
        if keystream_pos >= 32 {
            let mut input = Vec::with_capacity(32 + 12 + 8);
            input.extend_from_slice(key);
            input.extend_from_slice(nonce);
            input.extend_from_slice(&block_counter.to_le_bytes());
            keystream_block.copy_from_slice(&Sha256::digest(&input));
            block_counter += 1;
            keystream_pos = 0;
        }
        plaintext.push(byte ^ keystream_block[keystream_pos]);
        keystream_pos += 1;
    }
    Ok(plaintext)
}

pub struct Wallet {
    pub keypairs: Vec<Keypair>,
    pub label: String,
    pub path: Option<PathBuf>,
    password: Option<String>,
}

impl Wallet {
    pub fn new(label: &str) -> Self {
        Wallet { keypairs: vec![Keypair::generate()], label: label.to_string(), path: None, password: None }
    }

    pub fn load_or_create(path: &Path, label: &str) -> Self {
        Self::load_or_create_with_password(path, label, None)
    }

    pub fn load_or_create_with_password(path: &Path, label: &str, password: Option<&str>) -> Self {
        if path.exists() {
            if let Ok(json) = std::fs::read_to_string(path) {
                if let Ok(wf) = serde_json::from_str::<WalletFile>(&json) {
                    match Self::from_wallet_file(wf, password) {
                        Ok(mut wallet) => {
                            wallet.path = Some(path.to_path_buf());
                            wallet.password = password.map(str::to_string);
                            tracing::info!(path = %path.display(), encrypted = wallet.password.is_some(), "loaded wallet");
                            return wallet;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to decrypt wallet");
                            std::process::exit(1);
                        }
                    }
                }
            }
        }

        let mut wallet = Wallet::new(label);
        wallet.path = Some(path.to_path_buf());
        wallet.password = password.map(str::to_string);
        wallet.save();
        tracing::info!(path = %path.display(), "created new wallet");
        wallet
    }

    pub fn save(&self) {
        let Some(path) = &self.path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let wf = self.to_wallet_file();
        if let Ok(json) = serde_json::to_string_pretty(&wf) {
            if let Err(e) = std::fs::write(path, &json) {
                tracing::error!(error = %e, "failed to save wallet");
            }
        }
    }

    fn to_wallet_file(&self) -> WalletFile {
        let keys: Vec<[u8; 32]> = self.keypairs.iter().map(Keypair::secret_bytes).collect();

        let Some(password) = &self.password else {
            return WalletFile {
                version: WALLET_VERSION,
                encrypted: false,
                keys,
                label: self.label.clone(),
                salt: None,
                nonce: None,
                ciphertext: None,
            };
        };

        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let key = derive_key(password.as_bytes(), &salt);

        let plaintext = serde_json::to_vec(&(&keys, &self.label)).expect("serializing keys never fails");
        let ciphertext = encrypt_data(&plaintext, &key, &nonce);

        WalletFile {
            version: WALLET_VERSION,
            encrypted: true,
            keys: vec![],
            label: String::new(),
            salt: Some(hex::encode(salt)),
            nonce: Some(hex::encode(nonce)),
            ciphertext: Some(hex::encode(ciphertext)),
        }
    }

    fn from_wallet_file(wf: WalletFile, password: Option<&str>) -> Result<Self, String> {
        if wf.encrypted {
            let password = password.ok_or("wallet is encrypted, password required")?;
            let salt = hex::decode(wf.salt.ok_or("missing salt")?).map_err(|e| format!("bad salt: {e}"))?;
            let nonce_bytes = hex::decode(wf.nonce.ok_or("missing nonce")?).map_err(|e| format!("bad nonce: {e}"))?;
            let ciphertext = hex::decode(wf.ciphertext.ok_or("missing ciphertext")?)
                .map_err(|e| format!("bad ciphertext: {e}"))?;
            if nonce_bytes.len() != 12 {
                return Err("invalid nonce length".into());
            }
            let mut nonce = [0u8; 12];
            nonce.copy_from_slice(&nonce_bytes);

            let key = derive_key(password.as_bytes(), &salt);
            let plaintext = decrypt_data(&ciphertext, &key, &nonce)?;
            let (keys, label): (Vec<[u8; 32]>, String) =
                serde_json::from_slice(&plaintext).map_err(|e| format!("corrupt wallet data: {e}"))?;

            Ok(Wallet {
                keypairs: keys
                    .iter()
                    .map(|b| Keypair::from_secret_bytes(b).map_err(|e| e.to_string()))
                    .collect::<Result<_, _>>()?,
                label,
                path: None,
                password: Some(password.to_string()),
            })
        } else {
            if wf.keys.is_empty() {
                return Err("no keys in wallet file".into());
            }
            Ok(Wallet {
                keypairs: wf
                    .keys
                    .iter()
                    .map(|b| Keypair::from_secret_bytes(b).map_err(|e| e.to_string()))
                    .collect::<Result<_, _>>()?,
                label: wf.label,
                path: None,
                password: None,
            })
        }
    }

    pub fn set_password(&mut self, password: &str) {
        self.password = Some(password.to_string());
        self.save();
    }

    pub fn remove_password(&mut self) {
        self.password = None;
        self.save();
    }

    pub fn is_encrypted(&self) -> bool {
        self.password.is_some()
    }

    pub fn new_address(&mut self) -> String {
        let kp = Keypair::generate();
        let addr = kp.address();
        self.keypairs.push(kp);
        self.save();
        addr
    }

    pub fn primary_address(&self) -> String {
        self.keypairs[0].address()
    }

    pub fn primary_public_key(&self) -> PublicKey {
        self.keypairs[0].public_key()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.keypairs.iter().map(Keypair::address).collect()
    }

    pub fn keypair_for(&self, public_key: &PublicKey) -> Option<&Keypair> {
        self.keypairs.iter().find(|kp| &kp.public_key() == public_key)
    }

    pub fn balance(&self, chain: &Chain) -> u64 {
        self.keypairs
            .iter()
            .map(|kp| chain.balance_of(&kp.public_key()).unwrap_or(0))
            .sum()
    }

    /// Gather this wallet's unspent outputs until `target_amount + fee`
    /// is covered, largest-first so fewer inputs are needed.
    pub fn select_outputs(
        &self,
        chain: &Chain,
        target_amount: u64,
        fee: u64,
    ) -> Result<Vec<(OutputReference, Output)>, String> {
        let needed = target_amount + fee;
        let mut candidates: Vec<(OutputReference, Output)> = Vec::new();
        for kp in &self.keypairs {
            let owned = chain.unspent_outputs_for(&kp.public_key()).map_err(|e| e.to_string())?;
            candidates.extend(owned);
        }
        candidates.sort_by(|a, b| b.1.value.cmp(&a.1.value));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for (reference, output) in candidates {
            total += output.value;
            selected.push((reference, output));
            if total >= needed {
                return Ok(selected);
            }
        }
        Err(format!("insufficient funds: have {total}, need {needed} ({target_amount} + {fee} fee)"))
    }

    /// Build and sign a transaction paying `amount` to `recipient`, with
    /// any leftover input value returned to this wallet's primary
    /// address as a change output.
    pub fn create_send_tx(&self, chain: &Chain, recipient: PublicKey, amount: u64, fee: u64) -> Result<Transaction, String> {
        let selected = self.select_outputs(chain, amount, fee)?;
        let total_input: u64 = selected.iter().map(|(_, o)| o.value).sum();
        let change = total_input - amount - fee;

        let mut outputs = vec![Output { value: amount, public_key: recipient }];
        if change > 0 {
            outputs.push(Output { value: change, public_key: self.primary_public_key() });
        }

        let inputs: Vec<Input> = selected
            .iter()
            .map(|(reference, _)| Input { output_reference: *reference, signature: Signature::SignableEquivalent })
            .collect();

        let mut tx = Transaction::new(inputs, outputs);
        let preimage = tx.signable_equivalent().serialize();

        for (input, (_, output)) in tx.inputs.iter_mut().zip(selected.iter()) {
            let kp = self.keypair_for(&output.public_key).ok_or("UTXO not owned by this wallet")?;
            input.signature = Signature::Secp256k1(kp.sign(&preimage));
        }

        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrips_through_public_key() {
        let kp = Keypair::generate();
        let addr = kp.address();
        assert!(addr.starts_with(ADDRESS_PREFIX));
        assert!(addr.ends_with(ADDRESS_SUFFIX));
        assert_eq!(address_to_public_key(&addr), Some(kp.public_key()));
    }

    #[test]
    fn keypair_roundtrips_through_secret_bytes() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::from_secret_bytes(&kp1.secret_bytes()).unwrap();
        assert_eq!(kp1.public_key(), kp2.public_key());
    }

    #[test]
    fn encrypt_decrypt_roundtrips() {
        let key = [42u8; 32];
        let nonce = [7u8; 12];
        let plaintext = b"secret wallet keys here";
        let encrypted = encrypt_data(plaintext, &key, &nonce);
        let decrypted = decrypt_data(&encrypted, &key, &nonce).unwrap();
        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let nonce = [7u8; 12];
        let encrypted = encrypt_data(b"secret", &[42u8; 32], &nonce);
        assert!(decrypt_data(&encrypted, &[99u8; 32], &nonce).is_err());
    }

    #[test]
    fn encrypted_wallet_file_roundtrips() {
        let wallet = Wallet {
            keypairs: vec![Keypair::generate(), Keypair::generate()],
            label: "test".to_string(),
            path: None,
            password: Some("hunter2".to_string()),
        };
        let wf = wallet.to_wallet_file();
        assert!(wf.encrypted);
        assert!(wf.keys.is_empty());

        let loaded = Wallet::from_wallet_file(wf, Some("hunter2")).unwrap();
        assert_eq!(loaded.keypairs.len(), 2);
        assert_eq!(loaded.primary_address(), wallet.primary_address());
    }

    #[test]
    fn unencrypted_wallet_file_roundtrips() {
        let wallet = Wallet { keypairs: vec![Keypair::generate()], label: "test".to_string(), path: None, password: None };
        let wf = wallet.to_wallet_file();
        assert!(!wf.encrypted);
        let loaded = Wallet::from_wallet_file(wf, None).unwrap();
        assert_eq!(loaded.primary_address(), wallet.primary_address());
    }
}
