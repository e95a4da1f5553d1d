//! Layered salt derivation
//!
//! ```text
//! L1    = H(fingerprint digest)
//! L2    = H(L1 || hardware entropy)
//! L3    = H(L2 || install marker)
//! L4    = H(L3 || environment string)
//! final = H(L4 || hex(attestation bits))
//! salt  = HKDF-SHA256(final) -> 64 bytes
//! ```
//!
//! The salt is derived once per install and read back thereafter. If the
//! environment later drifts (OS update) the stored salt is kept as is and the
//! drift goes unnoticed; re-deriving would orphan every key bound to it.

use std::fmt;

use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use tracing::info;

use super::attestation::IntegrityFlags;
use super::fingerprint::DeviceFingerprint;
use crate::crypto::{derive_subkey_fixed, purposes};
use crate::error::{Result, VaultError};
use crate::store::{keys, KeyValueStore};

pub const SALT_LEN: usize = 64;

/// Bytes the platform RNG contributes to layer 2
pub const HARDWARE_ENTROPY_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct SaltMaterial([u8; SALT_LEN]);

impl SaltMaterial {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; SALT_LEN] = bytes.try_into().map_err(|_| {
            VaultError::InvalidInput(format!(
                "salt must be {} bytes, got {}",
                SALT_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SaltMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SaltMaterial({}..)", hex::encode(&self.0[..4]))
    }
}

fn layer(previous: &[u8], extra: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(previous);
    hasher.update(extra);
    hasher.finalize().into()
}

/// Pure derivation: identical inputs give an identical salt
pub fn derive_salt(
    fingerprint: &DeviceFingerprint,
    hardware_entropy: &[u8],
    attestation: IntegrityFlags,
) -> Result<SaltMaterial> {
    if hardware_entropy.is_empty() {
        return Err(VaultError::InvalidInput("hardware entropy is empty".into()));
    }

    let l1: [u8; 32] = Sha256::digest(fingerprint.digest).into();
    let l2 = layer(&l1, hardware_entropy);
    let l3 = layer(&l2, fingerprint.install_marker().as_bytes());
    let l4 = layer(&l3, fingerprint.environment_string().as_bytes());
    let last = layer(&l4, attestation.to_hex().as_bytes());

    let wide = derive_subkey_fixed::<SALT_LEN>(&last, None, purposes::SALT_EXPAND)?;
    Ok(SaltMaterial(*wide.expose_secret()))
}

/// Stored salt for the profile, if any. A stored value of the wrong length is an error.
pub fn load_salt(store: &dyn KeyValueStore, profile: &str) -> Result<Option<SaltMaterial>> {
    match store.get(&keys::scoped(profile, keys::SALT))? {
        Some(bytes) => SaltMaterial::from_bytes(&bytes).map(Some).map_err(|_| {
            VaultError::Storage(crate::store::StoreError::Backend(format!(
                "stored salt has {} bytes, expected {}",
                bytes.len(),
                SALT_LEN
            )))
        }),
        None => Ok(None),
    }
}

/// Returns the persisted salt, deriving and writing it only when none exists.
///
/// `inputs` is invoked only on first derivation.
pub fn load_or_derive<F>(store: &dyn KeyValueStore, profile: &str, inputs: F) -> Result<SaltMaterial>
where
    F: FnOnce() -> Result<(DeviceFingerprint, Vec<u8>, IntegrityFlags)>,
{
    if let Some(salt) = load_salt(store, profile)? {
        return Ok(salt);
    }

    let (fingerprint, entropy, attestation) = inputs()?;
    let salt = derive_salt(&fingerprint, &entropy, attestation)?;
    store.set(&keys::scoped(profile, keys::SALT), salt.as_bytes())?;
    info!(profile, attestation = %attestation, "Derived device salt");
    Ok(salt)
}

/// Fresh platform entropy for layer 2
pub fn hardware_entropy() -> Result<Vec<u8>> {
    let mut buf = vec![0u8; HARDWARE_ENTROPY_LEN];
    getrandom::getrandom(&mut buf).map_err(|e| VaultError::Crypto(format!("RNG failed: {}", e)))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn fingerprint() -> DeviceFingerprint {
        DeviceFingerprint::from_attributes(vec![
            ("os".into(), "Android".into()),
            ("os_version".into(), "14".into()),
            ("arch".into(), "aarch64".into()),
            ("installed_at".into(), "1700000000000".into()),
        ])
    }

    #[test]
    fn test_salt_deterministic() {
        let a = derive_salt(&fingerprint(), &[9u8; 32], IntegrityFlags::NONE).unwrap();
        let b = derive_salt(&fingerprint(), &[9u8; 32], IntegrityFlags::NONE).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), SALT_LEN);
    }

    #[test]
    fn test_salt_depends_on_every_layer() {
        let base = derive_salt(&fingerprint(), &[9u8; 32], IntegrityFlags::NONE).unwrap();

        let flagged = derive_salt(&fingerprint(), &[9u8; 32], IntegrityFlags::DEBUGGER_ATTACHED).unwrap();
        assert_ne!(base, flagged);

        let other_entropy = derive_salt(&fingerprint(), &[8u8; 32], IntegrityFlags::NONE).unwrap();
        assert_ne!(base, other_entropy);

        let mut attrs = fingerprint().attributes;
        attrs[3].1 = "1700000000001".into();
        let other_install =
            derive_salt(&DeviceFingerprint::from_attributes(attrs), &[9u8; 32], IntegrityFlags::NONE).unwrap();
        assert_ne!(base, other_install);
    }

    #[test]
    fn test_salt_persisted_once() {
        let store = MemoryStore::new();
        let first = load_or_derive(&store, "p", || {
            Ok((fingerprint(), vec![1u8; 32], IntegrityFlags::NONE))
        })
        .unwrap();

        let second = load_or_derive(&store, "p", || -> Result<_> {
            panic!("salt must not be re-derived")
        })
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_wrong_length_salt_is_storage_error() {
        let store = MemoryStore::new();
        store.set("p/salt", &[0u8; 16]).unwrap();
        assert!(matches!(load_salt(&store, "p"), Err(VaultError::Storage(_))));
        assert!(derive_salt(&fingerprint(), &[], IntegrityFlags::NONE).is_err());
    }
}
