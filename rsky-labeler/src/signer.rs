use crate::label::{encode_for_signing, SignedLabel};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use multibase::Base;
use secp256k1::{ecdsa, Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

pub const DID_KEY_PREFIX: &str = "did:key:";
// multicodec varint for secp256k1-pub
pub const SECP256K1_DID_PREFIX: [u8; 2] = [0xe7, 0x01];

/// Anything that can produce a label signature over canonical label bytes.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, msg: &[u8]) -> Result<Vec<u8>>;
}

/// atproto-style secp256k1 keypair: signs the SHA-256 digest of the message
/// and emits a 64-byte compact, low-S signature.
#[derive(Debug, Clone)]
pub struct Secp256k1Signer {
    secret_key: SecretKey,
}

impl Secp256k1Signer {
    /// Imports a hex-encoded 32-byte private key (an optional `0x` prefix is
    /// allowed).
    pub async fn import(key_material: &str) -> Result<Self> {
        let trimmed = key_material.trim();
        let hex_key = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        if hex_key.is_empty() {
            bail!("signing key is empty");
        }
        let bytes = hex::decode(hex_key).context("signing key is not valid hex")?;
        let secret_key =
            SecretKey::from_slice(&bytes).context("signing key is not a valid secp256k1 key")?;
        Ok(Self { secret_key })
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        Self { secret_key }
    }

    pub fn generate() -> Self {
        Self {
            secret_key: SecretKey::new(&mut secp256k1::rand::thread_rng()),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key_global(&self.secret_key)
    }

    /// `did:key` form of the public key, for publishing in the labeler's DID
    /// document.
    pub fn did_key(&self) -> String {
        let mut prefixed = SECP256K1_DID_PREFIX.to_vec();
        prefixed.extend_from_slice(&self.public_key().serialize());
        format!(
            "{DID_KEY_PREFIX}{}",
            multibase::encode(Base::Base58Btc, prefixed)
        )
    }

    pub fn export(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }
}

#[async_trait]
impl Signer for Secp256k1Signer {
    async fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        let hash = Sha256::digest(msg);
        let message = Message::from_digest_slice(hash.as_ref())?;
        let mut sig = self.secret_key.sign_ecdsa(message);
        // Convert to low-s
        sig.normalize_s();
        Ok(sig.serialize_compact().to_vec())
    }
}

/// Checks a compact secp256k1 signature over the SHA-256 digest of `msg`.
/// Malleable (high-S) signatures are rejected.
pub fn verify_sig(public_key: &PublicKey, msg: &[u8], sig: &[u8]) -> Result<bool> {
    let parsed = match ecdsa::Signature::from_compact(sig) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(false),
    };
    let mut normalized = parsed;
    normalized.normalize_s();
    if normalized != parsed {
        return Ok(false);
    }
    let hash = Sha256::digest(msg);
    let message = Message::from_digest_slice(hash.as_ref())?;
    Ok(SECP256K1
        .verify_ecdsa(&message, &parsed, public_key)
        .is_ok())
}

/// Verifies that `label.sig` was produced over the label's canonical bytes.
pub fn verify_label(label: &SignedLabel, public_key: &PublicKey) -> Result<bool> {
    let bytes = encode_for_signing(&label.unsigned())?;
    verify_sig(public_key, &bytes, &label.sig)
}
