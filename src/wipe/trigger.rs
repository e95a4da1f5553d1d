//! Explicit wipe triggers and remote command authentication

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Result, VaultError};
use crate::policy::WipePolicy;

/// Allowed clock skew for commands issued "in the future"
const FUTURE_SKEW_SECONDS: i64 = 30;

pub enum WipeTrigger {
    /// Duress button; the caller already holds an unlocked session or elevated privilege
    Panic,
    /// Shared-secret remote command
    RemoteCommand { token: SecretString },
    /// Command signed by the registered remote authority
    SignedRemoteCommand(SignedWipeCommand),
    /// Current threat level (0..=10) from the integrity probe
    ThreatScore(u8),
    /// Owner-initiated wipe from an unlocked session
    Manual,
}

impl WipeTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Panic => "panic",
            Self::RemoteCommand { .. } => "remote_command",
            Self::SignedRemoteCommand(_) => "signed_remote_command",
            Self::ThreatScore(_) => "threat_score",
            Self::Manual => "manual",
        }
    }
}

/// Zdalna komenda wipe podpisana Ed25519
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedWipeCommand {
    pub profile: String,
    pub issued_at: DateTime<Utc>,
    pub nonce: String,
    /// Hex Ed25519 signature over [`SignedWipeCommand::message`]
    pub signature: String,
}

impl SignedWipeCommand {
    pub fn sign(authority: &SigningKey, profile: &str, nonce: &str, issued_at: DateTime<Utc>) -> Self {
        let message = Self::message_for(profile, issued_at, nonce);
        Self {
            profile: profile.to_string(),
            issued_at,
            nonce: nonce.to_string(),
            signature: hex::encode(authority.sign(message.as_bytes()).to_bytes()),
        }
    }

    fn message_for(profile: &str, issued_at: DateTime<Utc>, nonce: &str) -> String {
        format!(
            "alfa-devicevault:wipe:{}:{}:{}",
            profile,
            issued_at.timestamp_millis(),
            nonce
        )
    }

    pub fn message(&self) -> String {
        Self::message_for(&self.profile, self.issued_at, &self.nonce)
    }

    pub(crate) fn verify(
        &self,
        authority_hex: &str,
        profile: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key_bytes: [u8; 32] = hex::decode(authority_hex)
            .ok()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| VaultError::InvalidInput("malformed remote authority key".into()))?;
        let authority = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| VaultError::InvalidInput("invalid remote authority key".into()))?;

        let signature = hex::decode(&self.signature)
            .ok()
            .and_then(|s| Signature::from_slice(&s).ok())
            .ok_or_else(|| VaultError::UnauthorizedTrigger("malformed signature".into()))?;

        authority
            .verify_strict(self.message().as_bytes(), &signature)
            .map_err(|_| VaultError::UnauthorizedTrigger("bad signature".into()))?;

        if self.profile != profile {
            return Err(VaultError::UnauthorizedTrigger("command for another profile".into()));
        }
        if now - self.issued_at > max_age {
            return Err(VaultError::UnauthorizedTrigger("command expired".into()));
        }
        if self.issued_at - now > Duration::seconds(FUTURE_SKEW_SECONDS) {
            return Err(VaultError::UnauthorizedTrigger("command issued in the future".into()));
        }
        Ok(())
    }
}

/// Hex SHA-256 of a remote token, as stored in [`WipePolicy::remote_token_sha256`]
pub fn remote_token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Compares digests in constant time
pub(crate) fn verify_remote_token(token: &SecretString, policy: &WipePolicy) -> Result<()> {
    let expected = policy
        .remote_token_sha256
        .as_deref()
        .and_then(|d| hex::decode(d).ok())
        .ok_or_else(|| VaultError::UnauthorizedTrigger("no remote token configured".into()))?;

    let presented = Sha256::digest(token.expose_secret().as_bytes());
    if bool::from(presented.as_slice().ct_eq(&expected)) {
        Ok(())
    } else {
        Err(VaultError::UnauthorizedTrigger("remote token mismatch".into()))
    }
}
