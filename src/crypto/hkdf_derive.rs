//! HKDF derywacja kluczy modułowych

use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretBox};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Derywuje klucz o stałej długości
pub fn derive_subkey_fixed<const N: usize>(
    ikm: &[u8],
    salt: Option<&[u8]>,
    purpose: &str,
) -> Result<SecretBox<[u8; N]>> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut output = Box::new([0u8; N]);
    hk.expand(purpose.as_bytes(), &mut output[..])
        .map_err(|e| VaultError::Crypto(format!("HKDF expand failed: {}", e)))?;

    Ok(SecretBox::new(output))
}

/// Derywuje klucz 32-bajtowy z klucza głównego
pub fn derive_key_32(master: &SecretBox<[u8; 32]>, purpose: &str) -> Result<SecretBox<[u8; 32]>> {
    derive_subkey_fixed::<32>(master.expose_secret(), None, purpose)
}

/// Session key from the master key and a peer's ephemeral key material.
///
/// IKM is `master || ephemeral`; an absent salt means the RFC 5869 all-zero salt.
pub fn derive_session_key(
    master: &SecretBox<[u8; 32]>,
    ephemeral: &[u8],
    salt: Option<&[u8]>,
) -> Result<SecretBox<[u8; 32]>> {
    if ephemeral.is_empty() {
        return Err(VaultError::InvalidInput("ephemeral key is empty".into()));
    }

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 + ephemeral.len()));
    ikm.extend_from_slice(master.expose_secret());
    ikm.extend_from_slice(ephemeral);

    derive_subkey_fixed::<32>(&ikm, salt, purposes::SESSION)
}

/// Predefiniowane cele derywacji
pub mod purposes {
    pub const PAYLOAD: &str = "ALFA:devicevault:payload";
    pub const SESSION: &str = "ALFA:devicevault:session";
    pub const SALT_EXPAND: &str = "ALFA:devicevault:salt";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> SecretBox<[u8; 32]> {
        SecretBox::new(Box::new([42u8; 32]))
    }

    #[test]
    fn test_derive_deterministic() {
        let key1 = derive_key_32(&master(), "test").unwrap();
        let key2 = derive_key_32(&master(), "test").unwrap();
        assert_eq!(key1.expose_secret(), key2.expose_secret());
    }

    #[test]
    fn test_different_purposes_different_keys() {
        let key1 = derive_key_32(&master(), purposes::PAYLOAD).unwrap();
        let key2 = derive_key_32(&master(), purposes::SESSION).unwrap();
        assert_ne!(key1.expose_secret(), key2.expose_secret());
    }

    #[test]
    fn test_session_key_depends_on_ephemeral() {
        let a = derive_session_key(&master(), &[1u8; 32], None).unwrap();
        let b = derive_session_key(&master(), &[2u8; 32], None).unwrap();
        let c = derive_session_key(&master(), &[1u8; 32], Some(b"salt")).unwrap();
        assert_ne!(a.expose_secret(), b.expose_secret());
        assert_ne!(a.expose_secret(), c.expose_secret());
        assert!(derive_session_key(&master(), &[], None).is_err());
    }

    #[test]
    fn test_wide_output() {
        let wide = derive_subkey_fixed::<64>(&[7u8; 32], None, purposes::SALT_EXPAND).unwrap();
        assert_eq!(wide.expose_secret().len(), 64);
    }
}
