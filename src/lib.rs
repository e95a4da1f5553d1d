//! # ALFA_DEVICEVAULT 1.0 - Sejf związany z urządzeniem
//!
//! ## Możliwości:
//! - Argon2id z solą wiązaną do urządzenia (fingerprint + entropia + integralność)
//! - Klucz główny zapieczętowany przez adapter sprzętowy (Keystore / Secure Enclave)
//! - Szybka ścieżka odblokowania przez pepper HMAC
//! - Auto-wipe po przekroczeniu prób, na sygnał zagrożenia lub zdalnie
//! - Szyfrowanie danych aplikacji (XChaCha20-Poly1305 / AES-256-GCM)
//!
//! The platform key store is abstracted behind [`WrapAdapter`]; the persisted
//! vault state lives behind [`KeyValueStore`].

pub mod adapter;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod handle;
pub mod logging;
pub mod policy;
pub mod store;
pub mod vault;
pub mod wipe;

// Re-exports
pub use adapter::{MemoryWrapAdapter, SoftwareWrapAdapter, WrapAdapter, WrapError};
pub use config::VaultConfig;
pub use crypto::{AeadCipher, EncryptedBlob, KdfCost};
pub use error::{Result, VaultError};
pub use handle::VaultHandle;
pub use policy::{PasswordPolicy, ThreatLevel, WipePolicy, WipeSeverity};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use vault::{DeviceVault, MasterKeyEnvelope, UnlockPath, VaultState, VaultStatus};
pub use wipe::{WipeDecision, WipeEvent, WipeReason, WipeTrigger};

/// Wersja biblioteki
pub const VERSION: &str = "1.0.0";

/// Nazwa systemu
pub const SYSTEM_NAME: &str = "ALFA_DEVICEVAULT";
