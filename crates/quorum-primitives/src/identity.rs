//! recoverable secp256k1 identities
//!
//! participants have no certificates. an address is the last 20 bytes of the
//! keccak-256 hash of the uncompressed public key, and the public key is
//! recovered from a 65-byte `r || s || v` signature and the signed digest every
//! time trust is needed.
//!
//! messages are hashed with sha-256 before signing, so a signer and a verifier
//! only agree when they hash the exact same bytes. callers sign canonical json
//! (see [`crate::canonical`]) and never a display string.

use core::fmt;
use core::str::FromStr;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::{Error, Result};

/// length of a recoverable signature on the wire
pub const SIGNATURE_LEN: usize = 65;

/// length of a participant address
pub const ADDRESS_LEN: usize = 20;

/// length of a message digest
pub const DIGEST_LEN: usize = 32;

/// sha-256 digest of a message, the value that actually gets signed
pub fn digest(message: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(message).into()
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// 20-byte participant address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// derive the address of a public key
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let uncompressed = public_key.to_encoded_point(false);
        // skip the 0x04 sec1 tag, hash x || y
        let hash = keccak256(&uncompressed.as_bytes()[1..]);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&hash[32 - ADDRESS_LEN..]);
        Self(out)
    }

    /// lowercase hex without `0x`
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(strip_hex_prefix(s.trim()))
            .map_err(|e| Error::InvalidAddress(e.to_string()))?;
        let arr: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| Error::InvalidAddress(format!("expected 20 bytes, got {}", b.len())))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// 65-byte `r || s || v` signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature([u8; SIGNATURE_LEN]);

impl RecoverableSignature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SIGNATURE_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidSignature(format!("expected {} bytes, got {}", SIGNATURE_LEN, bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(strip_hex_prefix(s.trim()))
            .map_err(|e| Error::InvalidSignature(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// split into the ecdsa signature and recovery id
    ///
    /// accepts both raw (0/1) and ethereum-style (27/28) recovery bytes
    fn parts(&self) -> Result<(Signature, RecoveryId)> {
        let signature = Signature::from_slice(&self.0[..64])
            .map_err(|e| Error::InvalidSignature(e.to_string()))?;
        let v = match self.0[64] {
            v @ 0..=3 => v,
            v @ 27..=30 => v - 27,
            other => {
                return Err(Error::InvalidSignature(format!("bad recovery byte {}", other)))
            }
        };
        let recovery_id = RecoveryId::from_byte(v)
            .ok_or_else(|| Error::InvalidSignature(format!("bad recovery id {}", v)))?;
        Ok((signature, recovery_id))
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoverableSignature({})", self.to_hex())
    }
}

/// long-lived or ephemeral secp256k1 key pair
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    pub fn from_bytes(secret: &[u8]) -> Result<Self> {
        let signing_key =
            SigningKey::from_slice(secret).map_err(|e| Error::InvalidPrivateKey(e.to_string()))?;
        Ok(Self { signing_key })
    }

    pub fn from_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(strip_hex_prefix(secret.trim()))
            .map_err(|e| Error::InvalidPrivateKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn public_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    /// compressed sec1 public key, hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().to_encoded_point(true).as_bytes())
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key())
    }

    /// sign the sha-256 digest of `message`
    pub fn sign(&self, message: &[u8]) -> Result<RecoverableSignature> {
        self.sign_digest(&digest(message))
    }

    pub fn sign_digest(&self, digest: &[u8; DIGEST_LEN]) -> Result<RecoverableSignature> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|e| Error::InvalidSignature(e.to_string()))?;
        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(RecoverableSignature(out))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("address", &self.address()).finish_non_exhaustive()
    }
}

/// sign `message` with `key`
pub fn sign(key: &KeyPair, message: &[u8]) -> Result<RecoverableSignature> {
    key.sign(message)
}

/// recover the signer's public key from a signature and the signed digest
pub fn recover_public_key(signature: &RecoverableSignature, digest: &[u8]) -> Result<VerifyingKey> {
    if digest.is_empty() {
        return Err(Error::InvalidSignature("empty digest".into()));
    }
    if digest.len() != DIGEST_LEN {
        return Err(Error::InvalidSignature(format!(
            "digest must be {} bytes, got {}",
            DIGEST_LEN,
            digest.len()
        )));
    }
    let (sig, recovery_id) = signature.parts()?;
    VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|e| Error::InvalidSignature(e.to_string()))
}

/// recover the signer's address from a signature and the signed digest
pub fn recover_address(signature: &RecoverableSignature, digest: &[u8]) -> Result<Address> {
    recover_public_key(signature, digest).map(|pk| Address::from_public_key(&pk))
}

/// recover the signer of `message`
pub fn recover_signer(signature: &RecoverableSignature, message: &[u8]) -> Result<Address> {
    recover_address(signature, &digest(message))
}

/// parse a sec1 public key (compressed or uncompressed), hex
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(strip_hex_prefix(hex_key.trim()))
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| Error::InvalidPublicKey(e.to_string()))
}
