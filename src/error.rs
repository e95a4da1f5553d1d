//! Typy błędów dla ALFA_DEVICEVAULT

use thiserror::Error;

use crate::adapter::WrapError;
use crate::crypto::CodecError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Malformed key/nonce lengths or envelopes - programmer error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Wrong password (`remaining` is set) or AEAD tag mismatch (`remaining` is `None`)
    #[error("Authentication failed")]
    AuthenticationFailed { remaining: Option<u32> },

    /// Hardware wrap/unwrap failed or needs interactive re-authentication
    #[error("Key adapter unavailable: {0}")]
    AdapterUnavailable(#[from] WrapError),

    #[error("Vault is not configured - call setup() first")]
    NotConfigured,

    #[error("Vault already configured")]
    AlreadyConfigured,

    #[error("Vault is locked - call unlock() first")]
    VaultLocked,

    /// Terminal: secrets were destroyed, the app must reset its state
    #[error("Vault has been wiped - all secrets are destroyed")]
    Wiped,

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Wipe trigger rejected: {0}")]
    UnauthorizedTrigger(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Invalid vault JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl From<CodecError> for VaultError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::AuthenticationFailed => Self::AuthenticationFailed { remaining: None },
            CodecError::InvalidKeyLength { .. }
            | CodecError::InvalidNonceLength { .. }
            | CodecError::Malformed(_)
            | CodecError::UnsupportedVersion(_)
            | CodecError::UnsupportedCipher(_) => Self::InvalidInput(e.to_string()),
            CodecError::Encryption(_) | CodecError::Rng(_) => Self::Crypto(e.to_string()),
        }
    }
}

impl VaultError {
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. } | Self::Wiped | Self::UnauthorizedTrigger(_)
        )
    }

    /// Caller should prompt for interactive unlock and retry
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::AdapterUnavailable(e) if e.is_retryable())
    }

    pub fn remaining_attempts(&self) -> Option<u32> {
        match self {
            Self::AuthenticationFailed { remaining } => *remaining,
            _ => None,
        }
    }

    /// Message safe to show to the user. Never reveals why verification failed.
    pub fn user_message(&self) -> String {
        match self {
            Self::AuthenticationFailed { remaining: Some(n) } => {
                format!("Authentication failed. {} attempt(s) remaining.", n)
            }
            Self::AuthenticationFailed { remaining: None } => {
                "Authentication failed.".to_string()
            }
            Self::AdapterUnavailable(_) => "Please authenticate again to continue.".to_string(),
            Self::Wiped => {
                "This vault has been permanently erased. Its data cannot be recovered.".to_string()
            }
            Self::NotConfigured => "Vault has not been set up yet.".to_string(),
            Self::VaultLocked => "Vault is locked.".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_errors_are_normalized() {
        assert!(matches!(
            VaultError::from(CodecError::AuthenticationFailed),
            VaultError::AuthenticationFailed { remaining: None }
        ));
        assert!(matches!(
            VaultError::from(CodecError::InvalidKeyLength { expected: 32, actual: 3 }),
            VaultError::InvalidInput(_)
        ));
    }

    #[test]
    fn test_user_message_shows_remaining() {
        let err = VaultError::AuthenticationFailed { remaining: Some(2) };
        assert!(err.user_message().contains("2 attempt"));
        assert_eq!(err.remaining_attempts(), Some(2));
    }

    #[test]
    fn test_reauth_classification() {
        assert!(VaultError::AdapterUnavailable(WrapError::NeedsInteractiveAuth).requires_reauth());
        assert!(!VaultError::Wiped.requires_reauth());
        assert!(VaultError::Wiped.is_security_critical());
    }
}
