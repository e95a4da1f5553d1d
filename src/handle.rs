//! Async facade over [`DeviceVault`]
//!
//! Argon2id and adapter prompts block, so every call runs on tokio's
//! blocking pool and the caller's executor stays responsive.

use std::sync::Arc;

use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::crypto::EncryptedBlob;
use crate::error::{Result, VaultError};
use crate::vault::{DeviceVault, UnlockPath, VaultState, VaultStatus};
use crate::wipe::{WipeDecision, WipeEvent, WipeTrigger};

#[derive(Clone)]
pub struct VaultHandle {
    vault: Arc<DeviceVault>,
}

impl VaultHandle {
    pub fn new(vault: DeviceVault) -> Self {
        Self {
            vault: Arc::new(vault),
        }
    }

    pub fn vault(&self) -> &DeviceVault {
        &self.vault
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceVault) -> Result<T> + Send + 'static,
    {
        let vault = self.vault.clone();
        tokio::task::spawn_blocking(move || f(&vault))
            .await
            .map_err(|e| VaultError::Task(e.to_string()))?
    }

    pub async fn setup(&self, password: SecretString) -> Result<()> {
        self.blocking(move |v| v.setup(&password)).await
    }

    pub async fn unlock(&self, password: SecretString) -> Result<UnlockPath> {
        self.blocking(move |v| v.unlock(&password)).await
    }

    pub async fn change_password(&self, current: SecretString, new: SecretString) -> Result<()> {
        self.blocking(move |v| v.change_password(&current, &new)).await
    }

    pub fn lock(&self) {
        self.vault.lock();
    }

    pub fn state(&self) -> VaultState {
        self.vault.state()
    }

    pub async fn encrypt_payload(&self, plaintext: Vec<u8>) -> Result<EncryptedBlob> {
        let plaintext = Zeroizing::new(plaintext);
        self.blocking(move |v| v.encrypt_payload(&plaintext)).await
    }

    pub async fn decrypt_payload(&self, blob: EncryptedBlob) -> Result<Zeroizing<Vec<u8>>> {
        self.blocking(move |v| v.decrypt_payload(&blob)).await
    }

    pub async fn report_explicit_trigger(&self, trigger: WipeTrigger) -> Result<WipeDecision> {
        self.blocking(move |v| v.report_explicit_trigger(&trigger)).await
    }

    /// Waits for in-flight derivations before destroying anything
    pub async fn execute_wipe(&self, decision: WipeDecision) -> Result<Option<WipeEvent>> {
        self.blocking(move |v| v.execute_wipe(&decision)).await
    }

    pub async fn status(&self) -> Result<VaultStatus> {
        self.blocking(|v| v.status()).await
    }
}
