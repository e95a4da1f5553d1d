//! Konfiguracja sejfu

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{AeadCipher, KdfCost};
use crate::error::{Result, VaultError};
use crate::policy::{PasswordPolicy, WipePolicy};

/// Environment override for the data directory
pub const ENV_DATA_DIR: &str = "ALFA_DEVICEVAULT_DATA_DIR";
/// Environment override for the profile id
pub const ENV_PROFILE: &str = "ALFA_DEVICEVAULT_PROFILE";
/// Environment override for the config file path
pub const ENV_CONFIG: &str = "ALFA_DEVICEVAULT_CONFIG";

const CONFIG_FILE: &str = "config.json";

/// Vault configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Profile id; every store key is scoped under it
    pub profile: String,
    /// Wrap adapter alias of the master key
    pub wrap_alias: String,
    /// Application identity mixed into the fingerprint
    pub app_id: String,
    /// Payload cipher
    pub cipher: AeadCipher,
    /// Argon2id cost for new records
    pub kdf: KdfCost,
    pub wipe: WipePolicy,
    pub password: PasswordPolicy,
    /// Root of the file store (CLI only)
    pub data_dir: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            profile: "default".into(),
            wrap_alias: "alfa.devicevault.master".into(),
            app_id: "alfa-devicevault".into(),
            cipher: AeadCipher::default(),
            kdf: KdfCost::default(),
            wipe: WipePolicy::default(),
            password: PasswordPolicy::default(),
            data_dir: None,
        }
    }
}

impl VaultConfig {
    /// Alias of the wrapped pepper key
    pub fn pepper_alias(&self) -> String {
        format!("{}.pepper", self.wrap_alias)
    }

    /// Both hardware aliases owned by this profile
    pub fn wrap_aliases(&self) -> Vec<String> {
        vec![self.wrap_alias.clone(), self.pepper_alias()]
    }

    pub fn validate(&self) -> Result<()> {
        let is_segment = |s: &str| {
            !s.is_empty()
                && !s.starts_with('.')
                && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        };
        if !is_segment(&self.profile) {
            return Err(VaultError::InvalidInput(format!(
                "invalid profile id: {:?}",
                self.profile
            )));
        }
        if !is_segment(&self.wrap_alias) {
            return Err(VaultError::InvalidInput(format!(
                "invalid wrap alias: {:?}",
                self.wrap_alias
            )));
        }
        self.kdf.validate()?;
        self.wipe.validate()
    }

    /// Default data directory (`<data_dir>/alfa-devicevault`)
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("alfa-devicevault")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(Self::default_data_dir)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(crate::store::StoreError::from)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(crate::store::StoreError::from)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)
            .map_err(crate::store::StoreError::from)?;
        Ok(())
    }

    /// Config file (explicit path, `ALFA_DEVICEVAULT_CONFIG`, or `<data_dir>/config.json`),
    /// defaults when it does not exist, then env overrides.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from))
            .unwrap_or_else(|| Self::data_dir_from_env().join(CONFIG_FILE));

        let mut config = if path.exists() {
            debug!(path = %path.display(), "Loading config");
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn data_dir_from_env() -> PathBuf {
        std::env::var_os(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_data_dir)
    }

    pub fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os(ENV_DATA_DIR) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(profile) = std::env::var(ENV_PROFILE) {
            if !profile.is_empty() {
                self.profile = profile;
            }
        }
    }
}
