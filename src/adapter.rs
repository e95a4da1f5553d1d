//! Hardware wrap adapter
//!
//! Raw key custody is delegated to a platform service holding a
//! secure-enclave-class key. The vault only sees `wrap`/`unwrap`; tokens are
//! opaque strings. Platform backends (Android Keystore, iOS Keychain/Secure
//! Enclave) implement [`WrapAdapter`] in the host application.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, AeadCipher, EncryptedBlob, CodecError, KEY_LEN};
use crate::store::{keys, KeyValueStore};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WrapError {
    /// Keystore demands a biometric / credential prompt before use
    #[error("Interactive authentication required")]
    NeedsInteractiveAuth,

    #[error("User cancelled authentication")]
    Cancelled,

    /// Biometric enrollment changed or the key was deleted - sealed tokens are dead
    #[error("Hardware key invalidated")]
    KeyInvalidated,

    #[error("Token rejected by keystore")]
    Rejected,

    #[error("Keystore unavailable: {0}")]
    Unavailable(String),
}

impl WrapError {
    /// Retrying after the user authenticates may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NeedsInteractiveAuth | Self::Cancelled)
    }
}

pub type WrapResult<T> = std::result::Result<T, WrapError>;

/// Capability set `{wrap, unwrap}` over a device-bound key-encryption-key.
pub trait WrapAdapter: Send + Sync {
    /// Seals `plaintext` under the hardware key named `alias`, creating the key if needed.
    fn wrap(&self, alias: &str, plaintext: &[u8]) -> WrapResult<String>;

    /// Opens a token produced by [`WrapAdapter::wrap`] for the same alias.
    fn unwrap(&self, alias: &str, token: &str) -> WrapResult<Zeroizing<Vec<u8>>>;

    /// Destroys the hardware key. Tokens sealed under it become unopenable.
    fn delete_key(&self, _alias: &str) -> WrapResult<()> {
        Ok(())
    }
}

impl<T: WrapAdapter + ?Sized> WrapAdapter for Arc<T> {
    fn wrap(&self, alias: &str, plaintext: &[u8]) -> WrapResult<String> {
        (**self).wrap(alias, plaintext)
    }

    fn unwrap(&self, alias: &str, token: &str) -> WrapResult<Zeroizing<Vec<u8>>> {
        (**self).unwrap(alias, token)
    }

    fn delete_key(&self, alias: &str) -> WrapResult<()> {
        (**self).delete_key(alias)
    }
}

fn seal_with(kek: &[u8], alias: &str, plaintext: &[u8]) -> WrapResult<String> {
    crypto::encrypt_bound(kek, plaintext, AeadCipher::XChaCha20Poly1305, alias.as_bytes())
        .map(|blob| blob.to_base64())
        .map_err(|e| WrapError::Unavailable(e.to_string()))
}

fn open_with(kek: &[u8], alias: &str, token: &str) -> WrapResult<Zeroizing<Vec<u8>>> {
    let blob = EncryptedBlob::from_base64(token).map_err(|_| WrapError::Rejected)?;
    crypto::decrypt_bound(kek, &blob, alias.as_bytes()).map_err(|e| match e {
        CodecError::AuthenticationFailed => WrapError::Rejected,
        other => WrapError::Unavailable(other.to_string()),
    })
}

fn fresh_kek() -> Zeroizing<[u8; KEY_LEN]> {
    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(kek.as_mut_slice());
    kek
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY ADAPTER
// ═══════════════════════════════════════════════════════════════════════════

/// Zachowanie adaptera pamięciowego
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterMode {
    Normal,
    /// Every `unwrap` answers `NeedsInteractiveAuth` until [`MemoryWrapAdapter::authenticate`]
    RequireAuth,
    /// The user dismisses every prompt
    Cancel,
    Offline(String),
}

/// In-memory adapter with scriptable failures.
///
/// **Not a keystore.** KEKs live in process memory; use for tests and
/// ephemeral profiles only.
pub struct MemoryWrapAdapter {
    keks: RwLock<HashMap<String, Zeroizing<[u8; KEY_LEN]>>>,
    mode: Mutex<AdapterMode>,
    unwrap_calls: AtomicUsize,
}

impl Default for MemoryWrapAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWrapAdapter {
    pub fn new() -> Self {
        Self {
            keks: RwLock::new(HashMap::new()),
            mode: Mutex::new(AdapterMode::Normal),
            unwrap_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: AdapterMode) {
        *self.mode.lock() = mode;
    }

    /// User completed the interactive prompt
    pub fn authenticate(&self) {
        let mut mode = self.mode.lock();
        if *mode == AdapterMode::RequireAuth {
            *mode = AdapterMode::Normal;
        }
    }

    pub fn unwrap_calls(&self) -> usize {
        self.unwrap_calls.load(Ordering::SeqCst)
    }

    pub fn has_key(&self, alias: &str) -> bool {
        self.keks.read().contains_key(alias)
    }

    fn gate(&self) -> WrapResult<()> {
        match &*self.mode.lock() {
            AdapterMode::Normal => Ok(()),
            AdapterMode::RequireAuth => Err(WrapError::NeedsInteractiveAuth),
            AdapterMode::Cancel => Err(WrapError::Cancelled),
            AdapterMode::Offline(reason) => Err(WrapError::Unavailable(reason.clone())),
        }
    }
}

impl WrapAdapter for MemoryWrapAdapter {
    fn wrap(&self, alias: &str, plaintext: &[u8]) -> WrapResult<String> {
        if let AdapterMode::Offline(reason) = &*self.mode.lock() {
            return Err(WrapError::Unavailable(reason.clone()));
        }
        let mut keks = self.keks.write();
        let kek = keks.entry(alias.to_string()).or_insert_with(fresh_kek);
        seal_with(kek.as_slice(), alias, plaintext)
    }

    fn unwrap(&self, alias: &str, token: &str) -> WrapResult<Zeroizing<Vec<u8>>> {
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        self.gate()?;
        let keks = self.keks.read();
        let kek = keks.get(alias).ok_or(WrapError::KeyInvalidated)?;
        open_with(kek.as_slice(), alias, token)
    }

    fn delete_key(&self, alias: &str) -> WrapResult<()> {
        if let Some(mut kek) = self.keks.write().remove(alias) {
            kek.zeroize();
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SOFTWARE ADAPTER
// ═══════════════════════════════════════════════════════════════════════════

/// File-backed KEK adapter for desktop development builds.
///
/// KEKs are stored in their own key-value store (0600 files for
/// [`crate::store::FileStore`]); this gives no hardware protection and must not
/// ship on devices that have a real keystore.
pub struct SoftwareWrapAdapter {
    store: Arc<dyn KeyValueStore>,
}

impl SoftwareWrapAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn kek_key(alias: &str) -> String {
        keys::scoped("kek", alias)
    }

    fn load_kek(&self, alias: &str) -> WrapResult<Option<Zeroizing<Vec<u8>>>> {
        let stored = self
            .store
            .get(&Self::kek_key(alias))
            .map_err(|e| WrapError::Unavailable(e.to_string()))?;
        match stored {
            Some(bytes) if bytes.len() == KEY_LEN => Ok(Some(Zeroizing::new(bytes))),
            Some(_) => {
                warn!(alias, "Software KEK has wrong length, treating as invalidated");
                Err(WrapError::KeyInvalidated)
            }
            None => Ok(None),
        }
    }
}

impl WrapAdapter for SoftwareWrapAdapter {
    fn wrap(&self, alias: &str, plaintext: &[u8]) -> WrapResult<String> {
        let kek = match self.load_kek(alias)? {
            Some(kek) => kek,
            None => {
                debug!(alias, "Creating software KEK");
                let kek = fresh_kek();
                self.store
                    .set(&Self::kek_key(alias), kek.as_slice())
                    .map_err(|e| WrapError::Unavailable(e.to_string()))?;
                Zeroizing::new(kek.to_vec())
            }
        };
        seal_with(&kek, alias, plaintext)
    }

    fn unwrap(&self, alias: &str, token: &str) -> WrapResult<Zeroizing<Vec<u8>>> {
        let kek = self.load_kek(alias)?.ok_or(WrapError::KeyInvalidated)?;
        open_with(&kek, alias, token)
    }

    fn delete_key(&self, alias: &str) -> WrapResult<()> {
        self.store
            .delete(&Self::kek_key(alias))
            .map_err(|e| WrapError::Unavailable(e.to_string()))
    }
}
