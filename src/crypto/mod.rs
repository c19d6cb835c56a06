use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Encrypted field values carry this prefix; anything without it is legacy
/// plaintext that predates encryption.
const FIELD_PREFIX: &str = "dv1:";

const USER_SALT_CONTEXT: &str = "duostore.field-key.v1";

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl KdfParams {
    pub fn default_params() -> Self {
        Self {
            m_cost_kib: 8 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }

    pub fn for_test() -> Self {
        Self {
            m_cost_kib: 1024,
            t_cost: 1,
            p_cost: 1,
        }
    }
}

/// Raised when a stored value cannot be decrypted with the active key.
/// Field-local: callers substitute the raw stored value and continue.
#[derive(Debug)]
pub struct DecryptionError {
    pub tag: String,
}

impl std::fmt::Display for DecryptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decryption failed for field {}", self.tag)
    }
}

impl std::error::Error for DecryptionError {}

fn user_salt(user_id: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(USER_SALT_CONTEXT.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();

    let mut salt = [0u8; 16];
    salt.copy_from_slice(&digest[..16]);
    salt
}

pub fn derive_user_key(user_id: &str, params: &KdfParams) -> Result<[u8; 32]> {
    let argon_params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
        .map_err(|_| anyhow!("argon2 params"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let salt = user_salt(user_id);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(user_id.as_bytes(), &salt, &mut output)
        .map_err(|_| anyhow!("argon2 hash"))?;
    Ok(output)
}

pub fn encrypt_bytes(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| anyhow!("invalid key"))?;

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| anyhow!("encrypt failed"))?;

    let mut blob = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub fn decrypt_bytes(key: &[u8; 32], blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < 24 {
        return Err(anyhow!("ciphertext too short"));
    }

    let (nonce_bytes, ciphertext) = blob.split_at(24);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| anyhow!("invalid key"))?;
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| anyhow!("decrypt failed"))
}

struct ActiveKey {
    user_id: String,
    key: Arc<[u8; 32]>,
}

/// Field-level encryption service keyed to one user at a time.
///
/// `initialize_key` swaps the active key on user switch. Operations capture
/// the key reference once at call start, so a concurrent swap never corrupts
/// an in-flight encrypt/decrypt.
pub struct FieldCipher {
    kdf: KdfParams,
    active: Mutex<Option<ActiveKey>>,
}

impl FieldCipher {
    pub fn new(kdf: KdfParams) -> Self {
        Self {
            kdf,
            active: Mutex::new(None),
        }
    }

    pub fn initialize_key(&self, user_id: &str) -> Result<()> {
        let key = derive_user_key(user_id, &self.kdf)?;
        let mut active = self.active.lock().map_err(|_| anyhow!("poisoned lock"))?;
        *active = Some(ActiveKey {
            user_id: user_id.to_string(),
            key: Arc::new(key),
        });
        Ok(())
    }

    pub fn active_user(&self) -> Option<String> {
        let active = self.active.lock().ok()?;
        active.as_ref().map(|a| a.user_id.clone())
    }

    fn snapshot(&self) -> Result<Arc<[u8; 32]>> {
        let active = self.active.lock().map_err(|_| anyhow!("poisoned lock"))?;
        active
            .as_ref()
            .map(|a| Arc::clone(&a.key))
            .ok_or_else(|| anyhow!("encryption key not initialized"))
    }

    /// Empty input is returned unchanged; only non-empty strings are sealed.
    pub fn encrypt_field(&self, plaintext: &str, tag: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let key = self.snapshot()?;
        let blob = encrypt_bytes(&key, plaintext.as_bytes(), tag.as_bytes())?;
        Ok(format!("{FIELD_PREFIX}{}", B64.encode(blob)))
    }

    pub fn encrypt_opt(&self, plaintext: Option<&str>, tag: &str) -> Result<Option<String>> {
        match plaintext {
            Some(value) => Ok(Some(self.encrypt_field(value, tag)?)),
            None => Ok(None),
        }
    }

    /// Strict decrypt. Fails with [`DecryptionError`] on values that are not
    /// in the encrypted format or were sealed under a different key.
    pub fn decrypt_field(&self, stored: &str, tag: &str) -> Result<String> {
        if stored.is_empty() {
            return Ok(String::new());
        }

        let Some(encoded) = stored.strip_prefix(FIELD_PREFIX) else {
            return Err(DecryptionError {
                tag: tag.to_string(),
            }
            .into());
        };

        let key = self.snapshot()?;
        let blob = B64.decode(encoded).map_err(|_| DecryptionError {
            tag: tag.to_string(),
        })?;
        let plaintext =
            decrypt_bytes(&key, &blob, tag.as_bytes()).map_err(|_| DecryptionError {
                tag: tag.to_string(),
            })?;

        String::from_utf8(plaintext).map_err(|_| {
            DecryptionError {
                tag: tag.to_string(),
            }
            .into()
        })
    }

    /// Best-effort decrypt used on every read path. Legacy plaintext (no
    /// format prefix) passes through silently; a value that looks encrypted
    /// but fails to open is logged and returned raw, never an error.
    pub fn decrypt_field_or_raw(&self, stored: &str, tag: &str) -> String {
        if !stored.starts_with(FIELD_PREFIX) {
            return stored.to_string();
        }

        match self.decrypt_field(stored, tag) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                log::warn!("failed to decrypt field {tag}; returning stored value");
                stored.to_string()
            }
        }
    }

    pub fn decrypt_opt_or_raw(&self, stored: Option<&str>, tag: &str) -> Option<String> {
        stored.map(|value| self.decrypt_field_or_raw(value, tag))
    }
}
