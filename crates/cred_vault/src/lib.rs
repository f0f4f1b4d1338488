/*!
# Credential Vault

Encrypted-at-rest store of target credentials. Ciphertext comes from an
injected storage backend; decryption happens on demand with an
authenticated cipher (ChaCha20-Poly1305), and the plaintext lives only
inside a [`CredentialHandle`] that zeroes its buffer on release and on
drop. Decrypted bytes are never logged and never cached beyond one
execution.
*/

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("credential not found for target")]
    NotFound,
    /// Deliberately does not say whether the key reference, the key, or
    /// the ciphertext was at fault. The distinction stays in internal
    /// debug logs so callers cannot be used as a decryption oracle.
    #[error("credential decryption failed")]
    DecryptionFailed,
    #[error("credential already released")]
    Released,
    #[error("credential store error: {0}")]
    Store(String),
}

/// One encrypted credential as stored at rest.
#[derive(Debug, Clone)]
pub struct CipherRecord {
    pub target_id: String,
    pub protocol: String,
    pub key_ref: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Storage contract for ciphertext blobs. The CRUD layer behind it is an
/// external collaborator.
#[async_trait]
pub trait CredentialStoreInterface: Send + Sync {
    async fn get_ciphertext(
        &self,
        target_id: &str,
        protocol: &str,
    ) -> VaultResult<Option<CipherRecord>>;
}

/// Scoped acquisition of a decrypted credential. The secret is reachable
/// only through [`CredentialHandle::with_secret`], and `release` (or drop)
/// zeroes the underlying buffer on every exit path.
pub struct CredentialHandle {
    target_id: String,
    protocol: String,
    secret: Arc<Mutex<Vec<u8>>>,
    released: AtomicBool,
}

impl CredentialHandle {
    fn new(target_id: String, protocol: String, plaintext: Vec<u8>) -> Self {
        Self {
            target_id,
            protocol,
            secret: Arc::new(Mutex::new(plaintext)),
            released: AtomicBool::new(false),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Run `f` over the decrypted bytes. Fails once the handle has been
    /// released; the secret never escapes by value.
    pub fn with_secret<R>(&self, f: impl FnOnce(&[u8]) -> R) -> VaultResult<R> {
        if self.released.load(Ordering::Acquire) {
            return Err(VaultError::Released);
        }
        let guard = self.secret.lock().unwrap();
        Ok(f(&guard))
    }

    /// Zero the secret buffer. Idempotent; also invoked by `Drop` so an
    /// early-return error path cannot leave plaintext behind.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.secret.lock().unwrap();
        guard.zeroize();
        debug!(target_id = %self.target_id, "credential released and zeroed");
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn raw_buffer(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.secret)
    }
}

impl Drop for CredentialHandle {
    fn drop(&mut self) {
        self.release();
    }
}

// The secret never appears in any rendering of the handle.
impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("target_id", &self.target_id)
            .field("protocol", &self.protocol)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

/// Decrypts stored credentials against a key-reference table.
pub struct CredentialVault {
    store: Arc<dyn CredentialStoreInterface>,
    keys: HashMap<String, Key>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStoreInterface>) -> Self {
        Self {
            store,
            keys: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key_ref: &str, key_bytes: [u8; 32]) -> Self {
        self.keys.insert(key_ref.to_string(), Key::from(key_bytes));
        self
    }

    /// Fetch, verify and decrypt the credential for `(target_id, protocol)`.
    /// The returned handle must be released by the caller; release is also
    /// guaranteed on drop.
    pub async fn resolve(&self, target_id: &str, protocol: &str) -> VaultResult<CredentialHandle> {
        let record = self
            .store
            .get_ciphertext(target_id, protocol)
            .await?
            .ok_or(VaultError::NotFound)?;

        if record.protocol != protocol {
            debug!(target_id, expected = protocol, declared = %record.protocol,
                "stored credential protocol does not match request");
            return Err(VaultError::NotFound);
        }

        let key = match self.keys.get(&record.key_ref) {
            Some(key) => key,
            None => {
                debug!(target_id, key_ref = %record.key_ref, "unknown key reference");
                return Err(VaultError::DecryptionFailed);
            }
        };

        if record.nonce.len() != 12 {
            debug!(target_id, "malformed nonce in stored credential");
            return Err(VaultError::DecryptionFailed);
        }

        let cipher = ChaCha20Poly1305::new(key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&record.nonce), record.ciphertext.as_ref())
            .map_err(|_| {
                debug!(target_id, key_ref = %record.key_ref,
                    "AEAD verification failed (wrong key or corrupted ciphertext)");
                VaultError::DecryptionFailed
            })?;

        Ok(CredentialHandle::new(
            record.target_id,
            record.protocol,
            plaintext,
        ))
    }
}

/// Seals a plaintext secret for storage. Used when provisioning targets
/// and by tests.
pub fn seal(key_bytes: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> VaultResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key_bytes));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| VaultError::DecryptionFailed)
}

/// In-memory credential store for wiring and tests.
pub struct MemoryCredentialStore {
    records: Mutex<Vec<CipherRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, record: CipherRecord) {
        self.records.lock().unwrap().push(record);
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStoreInterface for MemoryCredentialStore {
    async fn get_ciphertext(
        &self,
        target_id: &str,
        protocol: &str,
    ) -> VaultResult<Option<CipherRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .find(|r| r.target_id == target_id && r.protocol == protocol)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];
    const NONCE: [u8; 12] = [3u8; 12];

    fn vault_with(secret: &[u8]) -> CredentialVault {
        let store = MemoryCredentialStore::new();
        store.insert(CipherRecord {
            target_id: "web-01".to_string(),
            protocol: "command-shell".to_string(),
            key_ref: "primary".to_string(),
            nonce: NONCE.to_vec(),
            ciphertext: seal(&KEY, &NONCE, secret).unwrap(),
        });
        CredentialVault::new(Arc::new(store)).with_key("primary", KEY)
    }

    #[tokio::test]
    async fn resolves_and_exposes_secret_in_scope() {
        let vault = vault_with(b"hunter2");
        let handle = vault.resolve("web-01", "command-shell").await.unwrap();
        let len = handle.with_secret(|s| {
            assert_eq!(s, b"hunter2");
            s.len()
        });
        assert_eq!(len.unwrap(), 7);
        handle.release();
    }

    #[tokio::test]
    async fn release_zeroes_the_buffer() {
        let vault = vault_with(b"hunter2");
        let handle = vault.resolve("web-01", "command-shell").await.unwrap();
        let buffer = handle.raw_buffer();
        handle.release();

        let guard = buffer.lock().unwrap();
        assert!(guard.iter().all(|&b| b == 0));
        drop(guard);
        assert!(matches!(
            handle.with_secret(|_| ()),
            Err(VaultError::Released)
        ));
    }

    #[tokio::test]
    async fn drop_zeroes_the_buffer() {
        let vault = vault_with(b"hunter2");
        let handle = vault.resolve("web-01", "command-shell").await.unwrap();
        let buffer = handle.raw_buffer();
        drop(handle);
        assert!(buffer.lock().unwrap().iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn debug_rendering_never_shows_the_secret() {
        let vault = vault_with(b"hunter2");
        let handle = vault.resolve("web-01", "command-shell").await.unwrap();
        let rendered = format!("{:?}", handle);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("web-01"));
    }

    #[tokio::test]
    async fn missing_target_is_not_found() {
        let vault = vault_with(b"hunter2");
        let err = vault.resolve("db-09", "command-shell").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound));
    }

    #[tokio::test]
    async fn protocol_mismatch_is_not_found() {
        let vault = vault_with(b"hunter2");
        let err = vault.resolve("web-01", "http").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound));
    }

    #[tokio::test]
    async fn wrong_key_and_corrupt_ciphertext_surface_identically() {
        // Wrong key for the stored key_ref.
        let store = MemoryCredentialStore::new();
        store.insert(CipherRecord {
            target_id: "web-01".to_string(),
            protocol: "http".to_string(),
            key_ref: "primary".to_string(),
            nonce: NONCE.to_vec(),
            ciphertext: seal(&KEY, &NONCE, b"s3cret").unwrap(),
        });
        let vault = CredentialVault::new(Arc::new(store)).with_key("primary", [9u8; 32]);
        let wrong_key = vault.resolve("web-01", "http").await.unwrap_err();

        // Corrupted ciphertext under the right key.
        let store = MemoryCredentialStore::new();
        let mut ciphertext = seal(&KEY, &NONCE, b"s3cret").unwrap();
        ciphertext[0] ^= 0xff;
        store.insert(CipherRecord {
            target_id: "web-01".to_string(),
            protocol: "http".to_string(),
            key_ref: "primary".to_string(),
            nonce: NONCE.to_vec(),
            ciphertext,
        });
        let vault = CredentialVault::new(Arc::new(store)).with_key("primary", KEY);
        let corrupted = vault.resolve("web-01", "http").await.unwrap_err();

        assert_eq!(wrong_key.to_string(), corrupted.to_string());
    }
}
