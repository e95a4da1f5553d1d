//! ALFA DeviceVault - orchestrator
//!
//! Owns the master-key lifecycle: derives it once at setup, seals it through
//! the wrap adapter, opens it on unlock and keeps it in memory only while
//! unlocked. Every failed verification feeds the auto-wipe engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::adapter::WrapAdapter;
use crate::config::VaultConfig;
use crate::crypto::{
    self, derive_key, derive_key_32, hash_password, purposes, verify_password, AeadCipher,
    EncryptedBlob, PasswordHashRecord, SecretKey, SecureBuffer, MASTER_KEY_LEN,
};
use crate::device::{
    self, DeviceEnvironment, FingerprintCollector, SaltMaterial, StaticThreatSource,
    SystemEnvironment, ThreatSignalSource,
};
use crate::error::{Result, VaultError};
use crate::policy::ThreatLevel;
use crate::store::{keys, KeyValueStore, StoreError};
use crate::wipe::{
    AutoWipeEngine, AuxiliaryWiper, WipeDecision, WipeEvent, WipeReason, WipeTargets, WipeTrigger,
};

/// Current [`MasterKeyEnvelope`] format
pub const ENVELOPE_FORMAT_VERSION: u32 = 1;

const PEPPER_LEN: usize = 32;

/// Vault state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultState {
    Uninitialized,
    /// Configured, not yet unlocked in this session
    PasswordSet,
    Unlocked,
    Locked,
    /// Terminal
    Wiped,
}

/// Sealed master key. The raw key never has a persisted form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyEnvelope {
    pub format_version: u32,
    pub alias: String,
    /// Opaque adapter token
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// Which verification path a successful unlock took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockPath {
    /// Pepper tag matched, KDF skipped
    Fast,
    /// Full Argon2id verification
    Slow,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub profile: String,
    pub state: VaultState,
    pub remaining_attempts: u32,
    pub cipher: AeadCipher,
    /// Current reading of the threat source
    pub threat_level: ThreatLevel,
    pub last_wipe: Option<WipeEvent>,
}

enum Attempt<T> {
    Accepted(T),
    Rejected(WipeDecision),
    Threat(u8),
}

type HmacSha256 = Hmac<Sha256>;

/// Device-bound vault - main entry point
pub struct DeviceVault {
    config: VaultConfig,
    store: Arc<dyn KeyValueStore>,
    adapter: Arc<dyn WrapAdapter>,
    environment: Arc<dyn DeviceEnvironment>,
    threats: Arc<dyn ThreatSignalSource>,
    auxiliary: Vec<Arc<dyn AuxiliaryWiper>>,
    wipe: AutoWipeEngine,
    /// One setup / unlock / password change at a time
    lifecycle: Mutex<()>,
    /// Shared by key-material operations, exclusive for a wipe
    gate: RwLock<()>,
    state: RwLock<VaultState>,
    /// Cached master key (only when unlocked)
    session: RwLock<Option<SecretKey>>,
}

impl DeviceVault {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Opens the profile described by `config`, detecting its persisted state
    pub fn open(
        config: VaultConfig,
        store: Arc<dyn KeyValueStore>,
        adapter: Arc<dyn WrapAdapter>,
    ) -> Result<Self> {
        config.validate()?;
        let wipe = AutoWipeEngine::new(store.clone(), &config.profile, config.wipe.clone())?;

        let scoped = |name| keys::scoped(&config.profile, name);
        let state = if wipe.is_wiped()? {
            VaultState::Wiped
        } else if store.contains(&scoped(keys::HASH_RECORD))? && store.contains(&scoped(keys::ENVELOPE))? {
            VaultState::PasswordSet
        } else {
            VaultState::Uninitialized
        };
        debug!(profile = %config.profile, ?state, "Vault opened");

        Ok(Self {
            environment: Arc::new(SystemEnvironment::new(config.app_id.clone())),
            threats: Arc::new(StaticThreatSource::clean()),
            auxiliary: Vec::new(),
            config,
            store,
            adapter,
            wipe,
            lifecycle: Mutex::new(()),
            gate: RwLock::new(()),
            state: RwLock::new(state),
            session: RwLock::new(None),
        })
    }

    pub fn with_environment(mut self, environment: Arc<dyn DeviceEnvironment>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_threat_source(mut self, threats: Arc<dyn ThreatSignalSource>) -> Self {
        self.threats = threats;
        self
    }

    /// Registers a subsystem cleared by standard and maximum wipes
    pub fn with_auxiliary(mut self, wiper: Arc<dyn AuxiliaryWiper>) -> Self {
        self.auxiliary.push(wiper);
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn state(&self) -> VaultState {
        *self.state.read()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    /// Binds a new password to this device. Leaves the vault unlocked.
    pub fn setup(&self, password: &SecretString) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let _gate = self.gate.read();

        match self.state() {
            VaultState::Uninitialized => {}
            VaultState::Wiped => return Err(VaultError::Wiped),
            _ => return Err(VaultError::AlreadyConfigured),
        }
        self.config.password.validate(password.expose_secret())?;

        let salt = self.device_salt_or_derive()?;
        let master = derive_key(password, salt.as_bytes(), &self.config.kdf)?;
        let record = hash_password(password, &self.config.kdf, Some(salt.as_bytes()))?;

        // Nothing is persisted unless the adapter sealed both keys
        let envelope = self.seal_master(&master)?;
        let (pepper_token, pepper_tag) = self.new_pepper(password)?;

        self.put_json(keys::ENVELOPE, &envelope)?;
        self.write_pepper(&pepper_token, &pepper_tag)?;
        self.put_json(keys::HASH_RECORD, &record)?;
        self.wipe.reset_failed_attempts()?;

        *self.session.write() = Some(master);
        *self.state.write() = VaultState::Unlocked;
        info!(profile = %self.config.profile, "Vault set up");
        Ok(())
    }

    /// Verifies the password and opens the sealed master key.
    ///
    /// A wrong password returns `AuthenticationFailed` with the attempts left;
    /// the last allowed failure wipes the vault and returns `Wiped`.
    pub fn unlock(&self, password: &SecretString) -> Result<UnlockPath> {
        let _lifecycle = self.lifecycle.lock();
        let attempt = {
            let _gate = self.gate.read();
            self.try_unlock(password)?
        };
        self.settle(attempt)
    }

    fn try_unlock(&self, password: &SecretString) -> Result<Attempt<UnlockPath>> {
        self.require_configured()?;

        let level = self.threats.current_threat_level();
        if level >= self.config.wipe.threat_threshold {
            return Ok(Attempt::Threat(level));
        }

        let envelope: MasterKeyEnvelope = self.get_json(keys::ENVELOPE)?.ok_or(VaultError::NotConfigured)?;

        let path = if self.pepper_matches(password)? {
            UnlockPath::Fast
        } else {
            if let Some(decision) = self.verify_or_report(password)? {
                return Ok(Attempt::Rejected(decision));
            }
            UnlockPath::Slow
        };

        // Adapter errors propagate here: state is untouched and nothing is cached
        let master = self.open_envelope(&envelope)?;

        if path == UnlockPath::Slow {
            if let Err(e) = self.refresh_pepper(password) {
                warn!(error = %e, "Pepper refresh failed, next unlock takes the slow path");
            }
        }
        self.wipe.reset_failed_attempts()?;

        *self.session.write() = Some(master);
        *self.state.write() = VaultState::Unlocked;
        info!(profile = %self.config.profile, ?path, "Vault unlocked");
        Ok(Attempt::Accepted(path))
    }

    /// Turns a rejected attempt into a wipe when the decision calls for one.
    /// Runs without the gate held so the wipe can take it exclusively.
    fn settle<T>(&self, attempt: Attempt<T>) -> Result<T> {
        match attempt {
            Attempt::Accepted(value) => Ok(value),
            Attempt::Rejected(decision) if decision.should_wipe => {
                self.execute_wipe(&decision)?;
                Err(VaultError::Wiped)
            }
            Attempt::Rejected(decision) => Err(VaultError::AuthenticationFailed {
                remaining: Some(decision.remaining_attempts),
            }),
            Attempt::Threat(level) => {
                warn!(level, "Threat level over threshold");
                let decision = self.wipe.report_explicit_trigger(&WipeTrigger::ThreatScore(level))?;
                self.execute_wipe(&decision)?;
                Err(VaultError::Wiped)
            }
        }
    }

    /// Drops the cached key. Always safe to call.
    pub fn lock(&self) {
        let mut state = self.state.write();
        // SecretBox zeroizes on drop
        drop(self.session.write().take());
        if *state == VaultState::Unlocked {
            *state = VaultState::Locked;
            info!(profile = %self.config.profile, "Vault locked");
        }
    }

    /// Replaces the password record and pepper; the master key itself is re-sealed unchanged.
    pub fn change_password(&self, current: &SecretString, new: &SecretString) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let attempt = {
            let _gate = self.gate.read();
            self.try_change_password(current, new)?
        };
        self.settle(attempt)
    }

    fn try_change_password(&self, current: &SecretString, new: &SecretString) -> Result<Attempt<()>> {
        self.require_unlocked()?;
        self.config.password.validate(new.expose_secret())?;

        if let Some(decision) = self.verify_or_report(current)? {
            return Ok(Attempt::Rejected(decision));
        }

        let salt = device::load_salt(self.store.as_ref(), &self.config.profile)?
            .ok_or(VaultError::NotConfigured)?;
        let record = hash_password(new, &self.config.kdf, Some(salt.as_bytes()))?;
        let envelope = {
            let session = self.session.read();
            let master = session.as_ref().ok_or(VaultError::VaultLocked)?;
            self.seal_master(master)?
        };

        if let Err(e) = self.adapter.delete_key(&self.config.pepper_alias()) {
            warn!(error = %e, "Could not retire old pepper key");
        }
        let (pepper_token, pepper_tag) = self.new_pepper(new)?;

        self.put_json(keys::ENVELOPE, &envelope)?;
        self.write_pepper(&pepper_token, &pepper_tag)?;
        self.put_json(keys::HASH_RECORD, &record)?;
        self.wipe.reset_failed_attempts()?;

        info!(profile = %self.config.profile, "Password changed");
        Ok(Attempt::Accepted(()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PAYLOADS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn encrypt_payload(&self, plaintext: &[u8]) -> Result<EncryptedBlob> {
        self.with_payload_key(|key| Ok(crypto::encrypt(key, plaintext, self.config.cipher)?))
    }

    /// Tampered envelopes fail with `AuthenticationFailed`; no partial plaintext
    pub fn decrypt_payload(&self, blob: &EncryptedBlob) -> Result<Zeroizing<Vec<u8>>> {
        self.with_payload_key(|key| Ok(crypto::decrypt(key, blob)?))
    }

    /// Stores an application secret, bound to its name
    pub fn store_secret(&self, name: &str, value: &[u8]) -> Result<()> {
        let key = self.secret_key(name)?;
        let blob = self.with_payload_key(|k| {
            Ok(crypto::encrypt_bound(k, value, self.config.cipher, name.as_bytes())?)
        })?;
        self.store.set(&key, &blob.to_bytes())?;
        debug!(name, "Secret stored");
        Ok(())
    }

    pub fn load_secret(&self, name: &str) -> Result<Option<SecureBuffer>> {
        let key = self.secret_key(name)?;
        self.with_payload_key(|k| {
            let Some(bytes) = self.store.get(&key)? else {
                return Ok(None);
            };
            let blob = EncryptedBlob::from_bytes(&bytes)?;
            let plaintext = crypto::decrypt_bound(k, &blob, name.as_bytes())?;
            Ok(Some(SecureBuffer::from_slice(&plaintext)))
        })
    }

    pub fn delete_secret(&self, name: &str) -> Result<()> {
        let key = self.secret_key(name)?;
        self.require_unlocked()?;
        self.store.delete(&key)?;
        Ok(())
    }

    pub fn list_secrets(&self) -> Result<Vec<String>> {
        self.require_unlocked()?;
        let prefix = keys::scoped(&self.config.profile, keys::APP_SECRETS);
        Ok(self
            .store
            .keys_with_prefix(&prefix)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Session key from the master key and a peer's ephemeral key material
    pub fn derive_session_key(&self, ephemeral: &[u8], salt: Option<&[u8]>) -> Result<SecretKey> {
        let _gate = self.gate.read();
        self.require_unlocked()?;
        let session = self.session.read();
        let master = session.as_ref().ok_or(VaultError::VaultLocked)?;
        crypto::derive_session_key(master, ephemeral, salt)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // AUTO-WIPE
    // ═══════════════════════════════════════════════════════════════════════

    /// Counts a failure reported by the host (e.g. a failed biometric prompt).
    /// The decision is returned; the caller executes it.
    pub fn report_failed_attempt(&self) -> Result<WipeDecision> {
        if self.state() == VaultState::Wiped {
            return Err(VaultError::Wiped);
        }
        self.wipe.report_failed_attempt()
    }

    /// Manual wipes need an unlocked session; other triggers carry their own authentication.
    pub fn report_explicit_trigger(&self, trigger: &WipeTrigger) -> Result<WipeDecision> {
        if matches!(trigger, WipeTrigger::Manual) {
            self.require_unlocked()?;
        }
        self.wipe.report_explicit_trigger(trigger)
    }

    /// Polls the threat source and wipes when the level crosses the threshold
    pub fn evaluate_threats(&self) -> Result<Option<WipeEvent>> {
        if matches!(self.state(), VaultState::Wiped | VaultState::Uninitialized) {
            return Ok(None);
        }
        let level = self.threats.current_threat_level();
        let decision = self.wipe.report_explicit_trigger(&WipeTrigger::ThreatScore(level))?;
        self.execute_wipe(&decision)
    }

    /// Irreversible. Waits for in-flight derivations; safe to repeat.
    pub fn execute_wipe(&self, decision: &WipeDecision) -> Result<Option<WipeEvent>> {
        if !decision.should_wipe {
            return Ok(None);
        }

        let _gate = self.gate.write();
        let mut state = self.state.write();
        let mut session = self.session.write();
        let aliases = self.config.wrap_aliases();

        let event = self.wipe.execute(
            decision,
            WipeTargets {
                store: self.store.as_ref(),
                adapter: self.adapter.as_ref(),
                profile: &self.config.profile,
                wrap_aliases: &aliases,
                auxiliary: &self.auxiliary,
                session: &mut session,
            },
        )?;
        *state = VaultState::Wiped;
        Ok(event)
    }

    /// Shorthand for the duress button
    pub fn panic_wipe(&self) -> Result<Option<WipeEvent>> {
        self.execute_wipe(&WipeDecision::wipe(WipeReason::Panic))
    }

    pub fn status(&self) -> Result<VaultStatus> {
        let state = self.state();
        let remaining_attempts = if state == VaultState::Wiped {
            0
        } else {
            self.wipe.remaining_attempts()?
        };
        Ok(VaultStatus {
            profile: self.config.profile.clone(),
            state,
            remaining_attempts,
            cipher: self.config.cipher,
            threat_level: ThreatLevel::from_score(self.threats.current_threat_level()),
            last_wipe: self.wipe.last_event()?,
        })
    }

    /// Fingerprint of this device as seen by the vault
    pub fn fingerprint(&self) -> Result<device::DeviceFingerprint> {
        self.collector().collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    fn key(&self, name: &str) -> String {
        keys::scoped(&self.config.profile, name)
    }

    fn secret_key(&self, name: &str) -> Result<String> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(VaultError::InvalidInput(format!("invalid secret name: {:?}", name)));
        }
        Ok(self.key(&format!("{}{}", keys::APP_SECRETS, name)))
    }

    fn get_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.store.get(&self.key(name))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.store.set(&self.key(name), &serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn require_configured(&self) -> Result<()> {
        match self.state() {
            VaultState::Wiped => Err(VaultError::Wiped),
            VaultState::Uninitialized => Err(VaultError::NotConfigured),
            _ => Ok(()),
        }
    }

    fn require_unlocked(&self) -> Result<()> {
        match self.state() {
            VaultState::Unlocked => Ok(()),
            VaultState::Wiped => Err(VaultError::Wiped),
            VaultState::Uninitialized => Err(VaultError::NotConfigured),
            VaultState::PasswordSet | VaultState::Locked => Err(VaultError::VaultLocked),
        }
    }

    fn with_payload_key<T>(&self, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        let _gate = self.gate.read();
        self.require_unlocked()?;
        let session = self.session.read();
        let master = session.as_ref().ok_or(VaultError::VaultLocked)?;
        let key = derive_key_32(master, purposes::PAYLOAD)?;
        f(key.expose_secret())
    }

    fn collector(&self) -> FingerprintCollector {
        FingerprintCollector::new(self.environment.clone(), self.store.clone(), &self.config.profile)
    }

    fn device_salt_or_derive(&self) -> Result<SaltMaterial> {
        device::load_or_derive(self.store.as_ref(), &self.config.profile, || {
            let fingerprint = self.collector().collect()?;
            Ok((fingerprint, device::hardware_entropy()?, self.threats.probe()))
        })
    }

    /// Full Argon2id check against the stored record. `Some(decision)` on a wrong password.
    fn verify_or_report(&self, password: &SecretString) -> Result<Option<WipeDecision>> {
        let record: PasswordHashRecord =
            self.get_json(keys::HASH_RECORD)?.ok_or(VaultError::NotConfigured)?;
        let salt = device::load_salt(self.store.as_ref(), &self.config.profile)?;

        if verify_password(password, &record, salt.as_ref().map(SaltMaterial::as_bytes))? {
            return Ok(None);
        }
        let decision = self.wipe.report_failed_attempt()?;
        warn!(remaining = decision.remaining_attempts, "Password verification failed");
        Ok(Some(decision))
    }

    fn seal_master(&self, master: &SecretKey) -> Result<MasterKeyEnvelope> {
        let token = self.adapter.wrap(&self.config.wrap_alias, master.expose_secret())?;
        Ok(MasterKeyEnvelope {
            format_version: ENVELOPE_FORMAT_VERSION,
            alias: self.config.wrap_alias.clone(),
            token,
            created_at: Utc::now(),
        })
    }

    fn open_envelope(&self, envelope: &MasterKeyEnvelope) -> Result<SecretKey> {
        if envelope.format_version != ENVELOPE_FORMAT_VERSION {
            return Err(VaultError::NotConfigured);
        }
        let raw = self.adapter.unwrap(&envelope.alias, &envelope.token)?;
        if raw.len() != MASTER_KEY_LEN {
            return Err(VaultError::Crypto(format!(
                "sealed master key has {} bytes",
                raw.len()
            )));
        }
        let mut key = Box::new([0u8; MASTER_KEY_LEN]);
        key.copy_from_slice(&raw);
        Ok(SecretBox::new(key))
    }

    fn pepper_tag(pepper: &[u8], password: &SecretString) -> Result<[u8; 32]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(pepper)
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        mac.update(password.expose_secret().as_bytes());
        Ok(mac.finalize().into_bytes().into())
    }

    fn new_pepper(&self, password: &SecretString) -> Result<(String, [u8; 32])> {
        let mut pepper = Zeroizing::new([0u8; PEPPER_LEN]);
        rand::rngs::OsRng.fill_bytes(pepper.as_mut_slice());
        let token = self.adapter.wrap(&self.config.pepper_alias(), pepper.as_slice())?;
        let tag = Self::pepper_tag(pepper.as_slice(), password)?;
        Ok((token, tag))
    }

    fn write_pepper(&self, token: &str, tag: &[u8; 32]) -> Result<()> {
        self.store.set(&self.key(keys::PEPPER_KEY), token.as_bytes())?;
        self.store.set(&self.key(keys::PEPPER_TAG), tag)?;
        Ok(())
    }

    fn refresh_pepper(&self, password: &SecretString) -> Result<()> {
        let (token, tag) = self.new_pepper(password)?;
        self.write_pepper(&token, &tag)
    }

    /// Fast-path check. Interactive-auth demands surface as errors; any other
    /// pepper problem falls back to the slow path.
    fn pepper_matches(&self, password: &SecretString) -> Result<bool> {
        let token = self.store.get(&self.key(keys::PEPPER_KEY))?;
        let stored = self.store.get(&self.key(keys::PEPPER_TAG))?;
        let (Some(token), Some(stored)) = (token, stored) else {
            return Ok(false);
        };
        let token = String::from_utf8(token)
            .map_err(|_| StoreError::Backend("pepper token is not UTF-8".into()))?;

        match self.adapter.unwrap(&self.config.pepper_alias(), &token) {
            Ok(pepper) => {
                let tag = Self::pepper_tag(&pepper, password)?;
                Ok(tag.as_slice().ct_eq(stored.as_slice()).into())
            }
            Err(e) if e.is_retryable() => Err(e.into()),
            Err(e) => {
                debug!(error = %e, "Pepper unavailable, using slow path");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterMode, MemoryWrapAdapter, SoftwareWrapAdapter, WrapError};
    use crate::crypto::test_cost;
    use crate::device::{Attribute, StaticEnvironment};
    use crate::policy::WipePolicy;
    use crate::store::{FileStore, MemoryStore};
    use crate::wipe::WipeMethod;

    const PASSWORD: &str = "Sz9!qLmp2";

    fn pw(s: &str) -> SecretString {
        SecretString::from(s)
    }

    fn config() -> VaultConfig {
        VaultConfig {
            kdf: test_cost(),
            ..Default::default()
        }
    }

    fn environment() -> Arc<StaticEnvironment> {
        Arc::new(
            StaticEnvironment::new()
                .with(Attribute::Os, "TestOS")
                .with(Attribute::OsVersion, "1.0"),
        )
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        adapter: Arc<MemoryWrapAdapter>,
        vault: DeviceVault,
    }

    fn fixture_with(config: VaultConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(MemoryWrapAdapter::new());
        let vault = DeviceVault::open(config, store.clone(), adapter.clone())
            .unwrap()
            .with_environment(environment());
        Fixture { store, adapter, vault }
    }

    fn configured() -> Fixture {
        let f = fixture_with(config());
        f.vault.setup(&pw(PASSWORD)).unwrap();
        f
    }

    #[test]
    fn test_end_to_end_setup_lock_unlock() {
        let f = configured();
        assert_eq!(f.vault.state(), VaultState::Unlocked);

        f.vault.lock();
        assert_eq!(f.vault.state(), VaultState::Locked);
        assert_eq!(f.vault.unlock(&pw(PASSWORD)).unwrap(), UnlockPath::Fast);

        let blob = f.vault.encrypt_payload(b"hello").unwrap();
        assert_eq!(f.vault.decrypt_payload(&blob).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn test_no_plaintext_master_key_in_store() {
        let f = configured();
        let raw = {
            let session = f.vault.session.read();
            session.as_ref().unwrap().expose_secret().to_vec()
        };
        for key in f.store.keys_with_prefix("").unwrap() {
            let value = f.store.get(&key).unwrap().unwrap();
            assert!(!value.windows(raw.len()).any(|w| w == raw.as_slice()), "{}", key);
        }
    }

    #[test]
    fn test_slow_path_refreshes_pepper() {
        let f = configured();
        f.vault.lock();
        f.store.set("default/pepper_tag", &[0u8; 32]).unwrap();

        assert_eq!(f.vault.unlock(&pw(PASSWORD)).unwrap(), UnlockPath::Slow);
        f.vault.lock();
        assert_eq!(f.vault.unlock(&pw(PASSWORD)).unwrap(), UnlockPath::Fast);
    }

    #[test]
    fn test_five_wrong_unlocks_wipe_the_vault() {
        let f = configured();
        f.vault.lock();

        for remaining in (1..5).rev() {
            let err = f.vault.unlock(&pw("wrong")).unwrap_err();
            assert_eq!(err.remaining_attempts(), Some(remaining));
            assert_eq!(f.vault.state(), VaultState::Locked);
        }
        assert!(matches!(f.vault.unlock(&pw("wrong")), Err(VaultError::Wiped)));
        assert!(matches!(f.vault.unlock(&pw(PASSWORD)), Err(VaultError::Wiped)));

        let status = f.vault.status().unwrap();
        assert_eq!(status.state, VaultState::Wiped);
        assert_eq!(
            status.last_wipe.map(|e| e.reason),
            Some(WipeReason::AttemptsExhausted)
        );
        assert_eq!(f.store.get("default/master_envelope").unwrap(), None);
        assert_eq!(f.store.get("default/hash_record").unwrap(), None);
        assert!(!f.adapter.has_key("alfa.devicevault.master"));
    }

    #[test]
    fn test_successful_unlock_resets_counter() {
        let f = configured();
        f.vault.lock();
        assert!(f.vault.unlock(&pw("wrong")).is_err());
        assert!(f.vault.unlock(&pw("wrong")).is_err());
        assert_eq!(f.vault.status().unwrap().remaining_attempts, 3);
        f.vault.unlock(&pw(PASSWORD)).unwrap();
        assert_eq!(f.vault.status().unwrap().remaining_attempts, 5);
    }

    #[test]
    fn test_adapter_auth_demand_fails_closed() {
        let f = configured();
        f.vault.lock();

        f.adapter.set_mode(AdapterMode::RequireAuth);
        let err = f.vault.unlock(&pw(PASSWORD)).unwrap_err();
        assert!(matches!(err, VaultError::AdapterUnavailable(WrapError::NeedsInteractiveAuth)));
        assert!(err.requires_reauth());
        assert_eq!(f.vault.state(), VaultState::Locked);
        assert!(f.vault.session.read().is_none());
        assert!(matches!(f.vault.encrypt_payload(b"x"), Err(VaultError::VaultLocked)));
        assert_eq!(f.vault.status().unwrap().remaining_attempts, 5);

        f.adapter.set_mode(AdapterMode::Cancel);
        assert!(f.vault.unlock(&pw(PASSWORD)).unwrap_err().requires_reauth());
        assert_eq!(f.vault.state(), VaultState::Locked);

        f.adapter.set_mode(AdapterMode::Normal);
        assert!(f.vault.unlock(&pw(PASSWORD)).is_ok());
    }

    #[test]
    fn test_invalidated_hardware_key_never_falls_back() {
        let f = configured();
        f.vault.lock();
        f.adapter.delete_key("alfa.devicevault.master").unwrap();

        let err = f.vault.unlock(&pw(PASSWORD)).unwrap_err();
        assert!(matches!(err, VaultError::AdapterUnavailable(WrapError::KeyInvalidated)));
        assert_eq!(f.vault.state(), VaultState::Locked);
    }

    #[test]
    fn test_wipe_twice_is_noop() {
        let f = configured();
        f.vault.store_secret("otp", b"JBSWY3DP").unwrap();

        let decision = f.vault.report_explicit_trigger(&WipeTrigger::Manual).unwrap();
        let first = f.vault.execute_wipe(&decision).unwrap().unwrap();
        let second = f.vault.execute_wipe(&decision).unwrap().unwrap();
        assert!(first.is_complete());
        assert!(second.is_complete());
        assert_eq!(f.vault.state(), VaultState::Wiped);
        assert!(f.store.keys_with_prefix("default/secrets/").unwrap().is_empty());
        assert!(matches!(f.vault.setup(&pw(PASSWORD)), Err(VaultError::Wiped)));
    }

    #[test]
    fn test_sequencing_errors() {
        let f = fixture_with(config());
        assert!(matches!(f.vault.encrypt_payload(b"x"), Err(VaultError::NotConfigured)));
        assert!(matches!(f.vault.unlock(&pw(PASSWORD)), Err(VaultError::NotConfigured)));
        assert!(matches!(
            f.vault.setup(&pw("short")),
            Err(VaultError::PolicyViolation(_))
        ));

        f.vault.setup(&pw(PASSWORD)).unwrap();
        assert!(matches!(f.vault.setup(&pw(PASSWORD)), Err(VaultError::AlreadyConfigured)));

        f.vault.lock();
        assert!(matches!(
            f.vault.report_explicit_trigger(&WipeTrigger::Manual),
            Err(VaultError::VaultLocked)
        ));
        assert!(matches!(
            f.vault.derive_session_key(&[1u8; 32], None),
            Err(VaultError::VaultLocked)
        ));
    }

    #[test]
    fn test_change_password_keeps_data() {
        let f = configured();
        let blob = f.vault.encrypt_payload(b"kept").unwrap();

        f.vault.change_password(&pw(PASSWORD), &pw("N3w-passphrase")).unwrap();
        f.vault.lock();

        assert!(matches!(
            f.vault.unlock(&pw(PASSWORD)),
            Err(VaultError::AuthenticationFailed { remaining: Some(4) })
        ));
        f.vault.unlock(&pw("N3w-passphrase")).unwrap();
        assert_eq!(f.vault.decrypt_payload(&blob).unwrap().as_slice(), b"kept");
    }

    #[test]
    fn test_secrets_roundtrip_and_lock() {
        let f = configured();
        f.vault.store_secret("api-token", b"tok_123").unwrap();
        assert_eq!(
            f.vault.load_secret("api-token").unwrap().unwrap().as_slice(),
            b"tok_123"
        );
        assert!(f.vault.load_secret("missing").unwrap().is_none());
        assert_eq!(f.vault.list_secrets().unwrap(), vec!["api-token".to_string()]);
        assert!(f.vault.store_secret("../escape", b"x").is_err());

        f.vault.lock();
        assert!(matches!(f.vault.load_secret("api-token"), Err(VaultError::VaultLocked)));
    }

    #[test]
    fn test_delete_secret() {
        let f = configured();
        f.vault.store_secret("otp", b"JBSWY3DP").unwrap();
        f.vault.store_secret("pin", b"1234").unwrap();

        f.vault.delete_secret("otp").unwrap();
        assert!(f.vault.load_secret("otp").unwrap().is_none());
        assert_eq!(f.vault.list_secrets().unwrap(), vec!["pin".to_string()]);
        // missing secret
        f.vault.delete_secret("otp").unwrap();

        f.vault.lock();
        assert!(matches!(f.vault.delete_secret("pin"), Err(VaultError::VaultLocked)));
        f.vault.unlock(&pw(PASSWORD)).unwrap();
        assert!(f.vault.load_secret("pin").unwrap().is_some());
    }

    #[test]
    fn test_tmp_named_secrets_are_listed_kept_and_wiped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let vault = DeviceVault::open(config(), store, Arc::new(MemoryWrapAdapter::new()))
            .unwrap()
            .with_environment(environment());
        vault.setup(&pw(PASSWORD)).unwrap();

        vault.store_secret("a.tmp", b"first").unwrap();
        vault.store_secret("a", b"second").unwrap();
        vault.store_secret("backup.tmp", b"third").unwrap();
        assert_eq!(vault.load_secret("a.tmp").unwrap().unwrap().as_slice(), b"first");
        assert_eq!(
            vault.list_secrets().unwrap(),
            vec!["a".to_string(), "a.tmp".to_string(), "backup.tmp".to_string()]
        );

        vault.panic_wipe().unwrap();
        let secrets = dir.path().join("default/secrets");
        assert!(!secrets.join("backup.tmp").exists());
        assert!(!secrets.join("a.tmp").exists());
        assert!(!secrets.join("a").exists());
    }

    #[test]
    fn test_evaluate_threats() {
        let threats = Arc::new(StaticThreatSource::clean());
        let vault = DeviceVault::open(config(), Arc::new(MemoryStore::new()), Arc::new(MemoryWrapAdapter::new()))
            .unwrap()
            .with_environment(environment())
            .with_threat_source(threats.clone());
        assert!(vault.evaluate_threats().unwrap().is_none());

        vault.setup(&pw(PASSWORD)).unwrap();
        threats.set_level(5);
        assert!(vault.evaluate_threats().unwrap().is_none());
        assert_eq!(vault.state(), VaultState::Unlocked);
        assert_eq!(vault.status().unwrap().threat_level, ThreatLevel::Elevated);

        threats.set_level(8);
        let event = vault.evaluate_threats().unwrap().unwrap();
        assert_eq!(event.reason, WipeReason::ThreatScore);
        assert_eq!(vault.state(), VaultState::Wiped);
        assert!(vault.evaluate_threats().unwrap().is_none());
    }

    struct CountingWiper {
        name: &'static str,
        fail: bool,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl CountingWiper {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                calls: std::sync::atomic::AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl AuxiliaryWiper for CountingWiper {
        fn name(&self) -> &str {
            self.name
        }

        fn clear(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                Err("subsystem offline".into())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_panic_wipe_clears_auxiliary_subsystems() {
        let biometrics = CountingWiper::new("biometrics", false);
        let otp = CountingWiper::new("otp", true);
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(MemoryWrapAdapter::new());
        let vault = DeviceVault::open(config(), store.clone(), adapter.clone())
            .unwrap()
            .with_environment(environment())
            .with_auxiliary(biometrics.clone())
            .with_auxiliary(otp.clone());
        vault.setup(&pw(PASSWORD)).unwrap();

        let event = vault.panic_wipe().unwrap().unwrap();
        assert_eq!(biometrics.calls(), 1);
        assert_eq!(otp.calls(), 1);
        assert!(!event.is_complete());

        let aux: Vec<_> = event
            .results
            .iter()
            .filter(|r| r.method == WipeMethod::ClearAuxiliary)
            .collect();
        assert_eq!(aux.len(), 2);
        assert!(aux[0].success);
        assert_eq!(aux[0].detail.as_deref(), Some("biometrics"));
        assert!(!aux[1].success);
        assert!(aux[1].detail.as_deref().unwrap().starts_with("otp: "));

        // the failing subsystem did not stop the rest of the plan
        assert!(event
            .results
            .iter()
            .filter(|r| r.method != WipeMethod::ClearAuxiliary)
            .all(|r| r.success));
        assert_eq!(store.get("default/master_envelope").unwrap(), None);
        assert!(!adapter.has_key("alfa.devicevault.master"));
        assert_eq!(vault.state(), VaultState::Wiped);
    }

    #[test]
    fn test_session_key_derivation() {
        let f = configured();
        let a = f.vault.derive_session_key(&[1u8; 32], None).unwrap();
        let b = f.vault.derive_session_key(&[1u8; 32], None).unwrap();
        assert_eq!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn test_threat_level_wipes_on_unlock() {
        let threats = Arc::new(StaticThreatSource::clean());
        let store = Arc::new(MemoryStore::new());
        let vault = DeviceVault::open(config(), store, Arc::new(MemoryWrapAdapter::new()))
            .unwrap()
            .with_environment(environment())
            .with_threat_source(threats.clone());
        vault.setup(&pw(PASSWORD)).unwrap();
        vault.lock();

        threats.set_level(9);
        assert!(matches!(vault.unlock(&pw(PASSWORD)), Err(VaultError::Wiped)));
        assert_eq!(
            vault.status().unwrap().last_wipe.map(|e| e.reason),
            Some(WipeReason::ThreatScore)
        );
    }

    #[test]
    fn test_parallel_wrong_passwords_cannot_bypass_threshold() {
        let f = fixture_with(VaultConfig {
            wipe: WipePolicy {
                max_failed_attempts: 3,
                ..Default::default()
            },
            ..config()
        });
        f.vault.setup(&pw(PASSWORD)).unwrap();
        f.vault.lock();

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| f.vault.unlock(&pw("wrong"))))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut remaining: Vec<_> = results
            .iter()
            .filter_map(|r| r.as_ref().err().and_then(VaultError::remaining_attempts))
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec![1, 2]);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(VaultError::Wiped)))
                .count(),
            2
        );
    }

    #[test]
    fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let open = || {
            let store: Arc<dyn KeyValueStore> =
                Arc::new(FileStore::new(&dir.path().join("vault")).unwrap());
            let keystore: Arc<dyn KeyValueStore> =
                Arc::new(FileStore::new(&dir.path().join("keystore")).unwrap());
            DeviceVault::open(config(), store, Arc::new(SoftwareWrapAdapter::new(keystore)))
                .unwrap()
                .with_environment(environment())
        };

        let blob = {
            let vault = open();
            vault.setup(&pw(PASSWORD)).unwrap();
            vault.encrypt_payload(b"persisted").unwrap().to_bytes()
        };

        let vault = open();
        assert_eq!(vault.state(), VaultState::PasswordSet);
        vault.unlock(&pw(PASSWORD)).unwrap();
        let blob = EncryptedBlob::from_bytes(&blob).unwrap();
        assert_eq!(vault.decrypt_payload(&blob).unwrap().as_slice(), b"persisted");
    }
}
