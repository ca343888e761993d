//! Keys and integrity primitives.
//!
//! Every packet is tagged with a fresh 16-byte hash key which keys the
//! BLAKE2b-64 tags on the packet header and on each message header. The
//! hash key itself travels inside the packet header, wrapped with the
//! long-lived per-channel secret key using ChaCha20-Poly1305. The body of
//! the packet file is separately enveloped in a raw ChaCha20 keystream
//! whose nonce is derived from the file name, so the two peers never need
//! to exchange per-file state.

use blake2::digest::consts::{U12, U16, U8};
use blake2::digest::Mac;
use blake2::{Blake2b, Blake2bMac, Digest};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::{CryptoRng, RngCore};

use crate::error::{Error, Result};

/// Per-packet hash key length.
pub const HASH_KEY_LEN: usize = 16;
/// Long-lived ChaCha20-Poly1305 channel key length.
pub const SECRET_KEY_LEN: usize = 32;
/// Nonce length of both the AEAD key wrap and the body stream cipher.
pub(crate) const NONCE_LEN: usize = 12;
/// Poly1305 tag length.
pub(crate) const AEAD_TAG_LEN: usize = 16;
/// Encapsulated hash key: nonce || ciphertext || tag.
pub const TOKEN_LEN: usize = NONCE_LEN + HASH_KEY_LEN + AEAD_TAG_LEN;

/// Keyed and keyless header tag length (BLAKE2b-64).
pub(crate) const TAG_LEN: usize = 8;
/// Message content hash length (BLAKE2b-128).
pub(crate) const CONTENT_HASH_LEN: usize = 16;

/// The long-lived symmetric key provisioned for one channel (one pair of
/// drop folders). Both the key wrap and the Layer-0 body cipher use it.
#[derive(Clone)]
pub struct SecretKey([u8; SECRET_KEY_LEN]);

impl SecretKey {
    pub fn new(bytes: [u8; SECRET_KEY_LEN]) -> Self {
        SecretKey(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SECRET_KEY_LEN] = bytes.try_into().map_err(|_| Error::ErrKeyLength)?;
        Ok(SecretKey(bytes))
    }

    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SECRET_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        SecretKey(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey").field("key", &"[ elided ]").finish()
    }
}

/// The per-packet key for the keyed BLAKE2b tags.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HashKey([u8; HASH_KEY_LEN]);

impl std::fmt::Debug for HashKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashKey").field("key", &"[ elided ]").finish()
    }
}

impl HashKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; HASH_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        HashKey(bytes)
    }

    pub(crate) fn from_bytes(bytes: [u8; HASH_KEY_LEN]) -> Self {
        HashKey(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; HASH_KEY_LEN] {
        &self.0
    }
}

/// Wraps a hash key for transport inside the packet header.
///
/// Returns `nonce || ciphertext || tag`, `TOKEN_LEN` bytes total.
pub fn encrypt_key<R: RngCore + CryptoRng>(
    hash_key: &HashKey,
    secret_key: &SecretKey,
    rng: &mut R,
) -> Result<[u8; TOKEN_LEN]> {
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(secret_key.as_bytes()));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), hash_key.as_bytes().as_slice())
        .map_err(|_| Error::ErrHeaderAuthFailure)?;

    let mut token = [0u8; TOKEN_LEN];
    token[..NONCE_LEN].copy_from_slice(&nonce);
    token[NONCE_LEN..].copy_from_slice(&sealed);
    Ok(token)
}

/// Unwraps an encapsulated hash key. Fails on any tag mismatch.
pub fn decrypt_key(token: &[u8], secret_key: &SecretKey) -> Result<HashKey> {
    if token.len() != TOKEN_LEN {
        return Err(Error::ErrKeyLength);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(secret_key.as_bytes()));
    let opened = cipher
        .decrypt(Nonce::from_slice(&token[..NONCE_LEN]), &token[NONCE_LEN..])
        .map_err(|_| Error::ErrHeaderAuthFailure)?;

    let bytes: [u8; HASH_KEY_LEN] = opened
        .as_slice()
        .try_into()
        .map_err(|_| Error::ErrHeaderAuthFailure)?;
    Ok(HashKey(bytes))
}

/// Keyed BLAKE2b-64 tag over header bytes.
pub(crate) fn keyed_tag(hash_key: &HashKey, data: &[u8]) -> [u8; TAG_LEN] {
    // the key is always HASH_KEY_LEN bytes, well under the BLAKE2b maximum
    let mut mac = <Blake2bMac<U8> as Mac>::new_from_slice(hash_key.as_bytes())
        .expect("hash key length is valid for BLAKE2b");
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().into()
}

/// Keyless BLAKE2b-64 tag, used by the control block.
pub(crate) fn plain_tag(data: &[u8]) -> [u8; TAG_LEN] {
    let mut hasher = Blake2b::<U8>::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2b-128 hash of message content.
pub(crate) fn content_hash(data: &[u8]) -> [u8; CONTENT_HASH_LEN] {
    let mut hasher = Blake2b::<U16>::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// Derives the 12-byte body-cipher nonce from a packet file name.
///
/// File names are unique per channel (the packet id in them is strictly
/// monotonic per sender), so the per-channel secret key never sees a
/// repeated nonce.
pub(crate) fn derive_nonce(file_name: &str) -> [u8; NONCE_LEN] {
    let mut hasher = Blake2b::<U12>::new();
    Digest::update(&mut hasher, file_name.as_bytes());
    hasher.finalize().into()
}
