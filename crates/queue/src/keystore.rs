//! Password-sealed signing keys
//!
//! A sealed key is `memory_kib || iterations || salt || nonce || ciphertext`.
//! The cipher key is derived from the password with Argon2id at the cost
//! recorded in the header, and the ed25519 seed is sealed with
//! ChaCha20-Poly1305 using the header as associated data, so a wrong
//! password fails authentication before any signing happens.

use crate::error::QueueError;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, SigningKey as Ed25519Key};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const SEED_LEN: usize = 32;
const KEY_LEN: usize = 32;
const AEAD_TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 4 + SALT_LEN + NONCE_LEN;
const SEALED_LEN: usize = HEADER_LEN + SEED_LEN + AEAD_TAG_LEN;

const DEFAULT_MEMORY_KIB: u32 = 64 * 1024;
const DEFAULT_ITERATIONS: u32 = 3;
/// Refuse to open keys that ask for more than 1 GiB of KDF memory
const MAX_MEMORY_KIB: u32 = 1024 * 1024;

/// A decrypted key that can sign transaction bodies
pub trait SigningKey: Send + Sync {
    /// Signature over `message`
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Public half, as raw bytes
    fn public_key(&self) -> Vec<u8>;

    /// Base64 signature, as carried in an envelope
    fn sign_base64(&self, message: &[u8]) -> String {
        STANDARD.encode(self.sign(message))
    }

    fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key())
    }
}

/// Turns a password and stored ciphertext into a usable key
pub trait KeyStore: Send + Sync {
    fn decrypt_key(&self, password: &str, ciphertext: &[u8])
        -> Result<Box<dyn SigningKey>, QueueError>;
}

/// ed25519 signing key
pub struct Ed25519Signer {
    key: Ed25519Key,
}

impl Ed25519Signer {
    pub fn from_seed(seed: &[u8; SEED_LEN]) -> Self {
        Self {
            key: Ed25519Key::from_bytes(seed),
        }
    }

    pub fn generate() -> Self {
        Self {
            key: Ed25519Key::generate(&mut OsRng),
        }
    }

    pub fn seed(&self) -> [u8; SEED_LEN] {
        self.key.to_bytes()
    }
}

impl SigningKey for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }
}

/// Key store for keys sealed with [`PasswordKeyStore::seal`]
///
/// The cost settings only apply to sealing; opening uses whatever cost the
/// sealed key records.
#[derive(Debug, Clone, Copy)]
pub struct PasswordKeyStore {
    memory_kib: u32,
    iterations: u32,
}

impl Default for PasswordKeyStore {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_MEMORY_KIB,
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl PasswordKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cost(memory_kib: u32, iterations: u32) -> Self {
        Self {
            memory_kib,
            iterations,
        }
    }

    /// Seal an ed25519 seed under `password`
    pub fn seal(&self, password: &str, seed: &[u8; SEED_LEN]) -> Result<Vec<u8>, QueueError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut sealed = Vec::with_capacity(SEALED_LEN);
        sealed.extend_from_slice(&self.memory_kib.to_le_bytes());
        sealed.extend_from_slice(&self.iterations.to_le_bytes());
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce);

        let key = derive_key(password, &salt, self.memory_kib, self.iterations)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: seed,
                    aad: &sealed,
                },
            )
            .map_err(|e| QueueError::Signing(format!("sealing failed: {}", e)))?;
        sealed.extend(ciphertext);
        Ok(sealed)
    }
}

impl KeyStore for PasswordKeyStore {
    fn decrypt_key(
        &self,
        password: &str,
        ciphertext: &[u8],
    ) -> Result<Box<dyn SigningKey>, QueueError> {
        if ciphertext.len() != SEALED_LEN {
            return Err(QueueError::Signing(format!(
                "sealed key has {} bytes",
                ciphertext.len()
            )));
        }
        let (header, body) = ciphertext.split_at(HEADER_LEN);
        let memory_kib = read_u32(&header[0..4]);
        let iterations = read_u32(&header[4..8]);
        if memory_kib > MAX_MEMORY_KIB {
            return Err(QueueError::Signing(format!(
                "sealed key asks for {} KiB of memory",
                memory_kib
            )));
        }
        let salt = &header[8..8 + SALT_LEN];
        let nonce = &header[8 + SALT_LEN..];

        let key = derive_key(password, salt, memory_kib, iterations)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: body,
                        aad: header,
                    },
                )
                .map_err(|_| QueueError::InvalidPassword)?,
        );

        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        if plaintext.len() != SEED_LEN {
            return Err(QueueError::Signing("sealed seed has the wrong length".into()));
        }
        seed.copy_from_slice(&plaintext);
        Ok(Box::new(Ed25519Signer::from_seed(&seed)))
    }
}

fn derive_key(
    password: &str,
    salt: &[u8],
    memory_kib: u32,
    iterations: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, QueueError> {
    let params = Params::new(memory_kib, iterations, 1, Some(KEY_LEN))?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params).hash_password_into(
        password.as_bytes(),
        salt,
        &mut key[..],
    )?;
    Ok(key)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
