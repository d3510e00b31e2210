//! sealing task results to the task's ephemeral key
//!
//! ecies over secp256k1:
//! - sender draws an ephemeral key and does ecdh with the task public key
//! - hkdf-sha256 (salt = ephemeral public key, info = [`RESULT_KDF_INFO`])
//! - chacha20poly1305 with a random nonce
//!
//! layout: `ephemeral_pubkey (33, compressed) || nonce (12) || ciphertext+tag`

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use k256::ecdh::{diffie_hellman, EphemeralSecret};
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use rand::RngCore;
use sha2::Sha256;

use crate::{Error, KeyPair, Result};

/// domain separator for result sealing keys
pub const RESULT_KDF_INFO: &[u8] = b"quorum:result:v1";

const EPHEMERAL_KEY_LEN: usize = 33;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

fn derive_key(shared_secret: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(RESULT_KDF_INFO, &mut key)
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;
    Ok(key)
}

/// seal `plaintext` so only the holder of `recipient`'s secret can read it
pub fn seal(recipient: &VerifyingKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random(&mut rand::thread_rng());
    let ephemeral_public = ephemeral.public_key().to_encoded_point(true);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient));

    let key = derive_key(shared.raw_secret_bytes(), ephemeral_public.as_bytes())?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(EPHEMERAL_KEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// open a sealed box with the recipient key pair
pub fn open(recipient: &KeyPair, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < EPHEMERAL_KEY_LEN + NONCE_LEN + TAG_LEN {
        return Err(Error::DecryptionFailed(format!("sealed box too short: {} bytes", sealed.len())));
    }
    let (ephemeral_bytes, rest) = sealed.split_at(EPHEMERAL_KEY_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral_public = PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|e| Error::DecryptionFailed(format!("ephemeral key: {}", e)))?;
    let shared = diffie_hellman(
        recipient.signing_key().as_nonzero_scalar(),
        ephemeral_public.as_affine(),
    );

    let key = derive_key(shared.raw_secret_bytes(), ephemeral_bytes)
        .map_err(|e| Error::DecryptionFailed(e.to_string()))?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| Error::DecryptionFailed(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| Error::DecryptionFailed(e.to_string()))
}
