//! Polityki bezpieczeństwa - auto-wipe i wymagania haseł

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::device::MAX_THREAT_LEVEL;
use crate::error::{Result, VaultError};

/// Poziom zagrożenia (skala 0..=10)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    /// Normalny tryb pracy
    #[default]
    Normal,
    /// Podwyższona czujność
    Elevated,
    /// Wysokie zagrożenie
    High,
    /// Krytyczne
    Critical,
}

impl ThreatLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=2 => Self::Normal,
            3..=5 => Self::Elevated,
            6..=8 => Self::High,
            _ => Self::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// How much gets destroyed, and how thoroughly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WipeSeverity {
    /// Key material only: the vault becomes unrecoverable
    Minimal,
    #[default]
    Standard,
    /// Everything, including the device binding
    Maximum,
}

impl WipeSeverity {
    /// Overwrite passes for sensitive buffers
    pub fn overwrite_passes(&self) -> u32 {
        match self {
            Self::Minimal => 1,
            Self::Standard => 3,
            Self::Maximum => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Standard => "standard",
            Self::Maximum => "maximum",
        }
    }
}

/// Polityka auto-wipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WipePolicy {
    /// Nieudane próby przed wipe
    pub max_failed_attempts: u32,

    /// Failures further apart than this restart the count (sekundy)
    pub attempt_window_seconds: u64,

    pub severity: WipeSeverity,

    /// Threat level (0..=10) at or above which a threat trigger wipes
    pub threat_threshold: u8,

    /// Maksymalna liczba zapisanych zdarzeń wipe
    pub history_cap: usize,

    /// Hex SHA-256 of the shared remote-wipe token
    pub remote_token_sha256: Option<String>,

    /// Hex Ed25519 public key allowed to sign remote wipe commands
    pub remote_authority_key: Option<String>,

    /// Maximum age of a signed remote command (sekundy)
    pub remote_command_max_age_seconds: u64,
}

impl Default for WipePolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            attempt_window_seconds: 24 * 60 * 60,
            severity: WipeSeverity::Standard,
            threat_threshold: 8,
            history_cap: 20,
            remote_token_sha256: None,
            remote_authority_key: None,
            remote_command_max_age_seconds: 300,
        }
    }
}

impl WipePolicy {
    /// Polityka dla wysokiego bezpieczeństwa
    pub fn high_security() -> Self {
        Self {
            max_failed_attempts: 3,
            severity: WipeSeverity::Maximum,
            threat_threshold: 5,
            ..Default::default()
        }
    }

    pub fn attempt_window(&self) -> Duration {
        Duration::seconds(self.attempt_window_seconds.min(i64::MAX as u64) as i64)
    }

    pub fn remote_command_max_age(&self) -> Duration {
        Duration::seconds(self.remote_command_max_age_seconds.min(i64::MAX as u64) as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_failed_attempts == 0 {
            return Err(VaultError::InvalidInput(
                "max_failed_attempts must be at least 1".into(),
            ));
        }
        if self.attempt_window_seconds == 0 {
            return Err(VaultError::InvalidInput(
                "attempt_window_seconds must be positive".into(),
            ));
        }
        if self.threat_threshold == 0 || self.threat_threshold > MAX_THREAT_LEVEL {
            return Err(VaultError::InvalidInput(format!(
                "threat_threshold must be within 1..={}",
                MAX_THREAT_LEVEL
            )));
        }
        if self.history_cap == 0 {
            return Err(VaultError::InvalidInput("history_cap must be at least 1".into()));
        }
        if let Some(digest) = &self.remote_token_sha256 {
            if hex::decode(digest).map(|d| d.len()) != Ok(32) {
                return Err(VaultError::InvalidInput(
                    "remote_token_sha256 must be 64 hex characters".into(),
                ));
            }
        }
        if let Some(key) = &self.remote_authority_key {
            if hex::decode(key).map(|k| k.len()) != Ok(32) {
                return Err(VaultError::InvalidInput(
                    "remote_authority_key must be a 32-byte hex Ed25519 key".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Wymagania hasła przy setup / zmianie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    /// Wymagana minimalna długość hasła (znaki)
    pub min_length: usize,

    /// Wymagaj cyfr w haśle
    pub require_digits: bool,

    /// Wymagaj znaków specjalnych
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_digits: true,
            require_special: false,
        }
    }
}

impl PasswordPolicy {
    /// No constraints; used by hosts that enforce their own rules
    pub fn permissive() -> Self {
        Self {
            min_length: 0,
            require_digits: false,
            require_special: false,
        }
    }

    /// Sprawdza czy hasło spełnia wymagania polityki
    pub fn validate(&self, password: &str) -> Result<()> {
        let mut errors = Vec::new();

        if password.chars().count() < self.min_length {
            errors.push(format!(
                "Password must be at least {} characters",
                self.min_length
            ));
        }

        if self.require_digits && !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push("Password must contain at least one digit".to_string());
        }

        if self.require_special && !password.chars().any(|c| !c.is_alphanumeric()) {
            errors.push("Password must contain at least one special character".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(VaultError::PolicyViolation(errors.join("; ")))
        }
    }
}
