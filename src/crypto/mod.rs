//! Cryptographic primitives.
//!
//! Hashing uses sha256d (double SHA-256) for transaction/block/summary
//! identity and BLAKE2b-256 for the proof-of-work commitment. Signing
//! uses SECP256k1 (same curve as Bitcoin), with raw 64-byte uncompressed
//! public keys (X||Y, no 0x04 prefix) and 64-byte compact signatures.

use blake2::{Blake2b, Digest as Blake2Digest};
use blake2::digest::consts::U32;
use secp256k1::ecdsa::Signature as Secp256k1Signature;
use secp256k1::{Message, PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::core::types::Hash256;

type Blake2b256 = Blake2b<U32>;

/// `sha256d(x) = SHA256(SHA256(x))`.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// 32-byte BLAKE2b digest, used for the block-hash commitment.
pub fn blake2b_256(data: &[u8]) -> Hash256 {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Holds a SECP256k1 signing key and its 64-byte raw (uncompressed, no
/// prefix) public key.
#[derive(Clone)]
pub struct Keypair {
    secret_key: SecretKey,
    public_key_bytes: [u8; 64],
}

impl Keypair {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::rngs::OsRng;
        let (secret_key, pubkey) = secp.generate_keypair(&mut rng);
        Self {
            secret_key,
            public_key_bytes: uncompressed_xy(&pubkey),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, secp256k1::Error> {
        let secret_key = SecretKey::from_slice(bytes)?;
        let secp = Secp256k1::new();
        let pubkey = Secp256k1PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self {
            secret_key,
            public_key_bytes: uncompressed_xy(&pubkey),
        })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    /// 64-byte uncompressed public key (X||Y), matching `PublicKey::SECP256k1PublicKey`.
    pub fn public_key_bytes(&self) -> [u8; 64] {
        self.public_key_bytes
    }

    /// Sign an arbitrary message, returning the 64-byte compact signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let secp = Secp256k1::new();
        let digest: [u8; 32] = Sha256::digest(msg).into();
        let message = Message::from_digest(digest);
        let sig = secp.sign_ecdsa(&message, &self.secret_key);
        sig.serialize_compact()
    }
}

fn uncompressed_xy(pubkey: &Secp256k1PublicKey) -> [u8; 64] {
    let full = pubkey.serialize_uncompressed();
    let mut out = [0u8; 64];
    out.copy_from_slice(&full[1..]); // drop the leading 0x04 prefix
    out
}

/// Verify a SECP256k1 signature. `pubkey` must be 64 raw bytes (X||Y),
/// `signature` must be 64 compact bytes.
pub fn verify_signature(pubkey: &[u8; 64], msg: &[u8], signature: &[u8; 64]) -> bool {
    let mut prefixed = [0u8; 65];
    prefixed[0] = 0x04;
    prefixed[1..].copy_from_slice(pubkey);

    let Ok(pk) = Secp256k1PublicKey::from_slice(&prefixed) else {
        return false;
    };
    let Ok(sig) = Secp256k1Signature::from_compact(signature) else {
        return false;
    };

    let secp = Secp256k1::new();
    let digest: [u8; 32] = Sha256::digest(msg).into();
    let message = Message::from_digest(digest);
    secp.verify_ecdsa(&message, &sig, &pk).is_ok()
}

/// scrypt summary-hash, fixed cost params N=2^15, r=8, p=1, output length 32.
pub fn scrypt_hash(password: &[u8], salt: &[u8]) -> Hash256 {
    let params = scrypt::Params::new(15, 8, 1, 32).expect("fixed scrypt params are valid");
    let mut out = [0u8; 32];
    scrypt::scrypt(password, salt, &params, &mut out).expect("fixed-size scrypt output");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_is_deterministic() {
        assert_eq!(sha256d(b"abc"), sha256d(b"abc"));
        assert_ne!(sha256d(b"abc"), sha256d(b"abd"));
    }

    #[test]
    fn blake2b_256_is_32_bytes_and_deterministic() {
        let a = blake2b_256(b"hello world");
        let b = blake2b_256(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn scrypt_hash_is_deterministic() {
        let a = scrypt_hash(b"summary-bytes", b"\x00\x00\x00\x00\x00\x00\x00\x01");
        let b = scrypt_hash(b"summary-bytes", b"\x00\x00\x00\x00\x00\x00\x00\x01");
        assert_eq!(a, b);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = Keypair::generate();
        let msg = b"spend this output";
        let sig = kp.sign(msg);
        assert!(verify_signature(&kp.public_key_bytes(), msg, &sig));
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"original message");
        assert!(!verify_signature(&kp.public_key_bytes(), b"tampered message", &sig));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();
        let sig = kp1.sign(b"message");
        assert!(!verify_signature(&kp2.public_key_bytes(), b"message", &sig));
    }
}
