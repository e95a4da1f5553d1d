//! AEAD koperta - XChaCha20-Poly1305 (domyślny) i AES-256-GCM
//!
//! Envelope layout: `version(1) | cipher(1) | nonce | ciphertext || tag`.
//! The two header bytes are authenticated as associated data, so a blob can
//! only be opened with the cipher it was produced by.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Symmetric key length for both ciphers
pub const KEY_LEN: usize = 32;

/// Poly1305 / GHASH tag length
pub const TAG_LEN: usize = 16;

/// Current envelope format
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = 2;

/// Błędy kodeka koperty
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported cipher id {0}")]
    UnsupportedCipher(u8),

    #[error("Authentication failed - envelope tampered or wrong key")]
    AuthenticationFailed,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("RNG failed: {0}")]
    Rng(String),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Typ szyfru AEAD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AeadCipher {
    /// AES-256-GCM (12-byte nonce)
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    /// XChaCha20-Poly1305 (24-byte nonce) - preferowany
    #[default]
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl AeadCipher {
    pub fn nonce_len(&self) -> usize {
        match self {
            Self::Aes256Gcm => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::XChaCha20Poly1305 => "XChaCha20-Poly1305",
        }
    }

    /// Wire identifier stored in the envelope header
    pub fn id(&self) -> u8 {
        match self {
            Self::Aes256Gcm => 1,
            Self::XChaCha20Poly1305 => 2,
        }
    }

    pub fn from_id(id: u8) -> CodecResult<Self> {
        match id {
            1 => Ok(Self::Aes256Gcm),
            2 => Ok(Self::XChaCha20Poly1305),
            other => Err(CodecError::UnsupportedCipher(other)),
        }
    }
}

/// Zaszyfrowany blob: nonce + ciphertext + tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub cipher: AeadCipher,
    pub nonce: Vec<u8>,
    /// Ciphertext with the authentication tag appended
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    fn header(cipher: AeadCipher) -> [u8; HEADER_LEN] {
        [ENVELOPE_VERSION, cipher.id()]
    }

    /// The trailing authentication tag
    pub fn tag(&self) -> &[u8] {
        let split = self.ciphertext.len().saturating_sub(TAG_LEN);
        &self.ciphertext[split..]
    }

    /// Serialize to `version | cipher | nonce | ciphertext || tag`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.nonce.len() + self.ciphertext.len());
        out.extend_from_slice(&Self::header(self.cipher));
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> CodecResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Malformed("envelope shorter than header".into()));
        }
        if data[0] != ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion(data[0]));
        }
        let cipher = AeadCipher::from_id(data[1])?;
        let nonce_len = cipher.nonce_len();

        let body = &data[HEADER_LEN..];
        if body.len() < nonce_len + TAG_LEN {
            return Err(CodecError::Malformed(format!(
                "envelope body too short: {} bytes",
                body.len()
            )));
        }

        Ok(Self {
            cipher,
            nonce: body[..nonce_len].to_vec(),
            ciphertext: body[nonce_len..].to_vec(),
        })
    }

    /// Base64 form used when a blob travels through string-only channels
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> CodecResult<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CodecError::Malformed(format!("base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

/// Szyfruje dane świeżym losowym nonce
pub fn encrypt(key: &[u8], plaintext: &[u8], cipher: AeadCipher) -> CodecResult<EncryptedBlob> {
    encrypt_bound(key, plaintext, cipher, &[])
}

/// Deszyfruje kopertę; błąd tagu zwraca `AuthenticationFailed`, nigdy częściowe dane
pub fn decrypt(key: &[u8], blob: &EncryptedBlob) -> CodecResult<Zeroizing<Vec<u8>>> {
    decrypt_bound(key, blob, &[])
}

/// Encrypts with an extra binding context mixed into the associated data.
///
/// The same context must be supplied to [`decrypt_bound`]; wrap adapters use
/// the key alias here so a token sealed for one alias cannot be opened as
/// another.
pub fn encrypt_bound(
    key: &[u8],
    plaintext: &[u8],
    cipher: AeadCipher,
    context: &[u8],
) -> CodecResult<EncryptedBlob> {
    check_key(key)?;

    let mut nonce = vec![0u8; cipher.nonce_len()];
    getrandom::getrandom(&mut nonce).map_err(|e| CodecError::Rng(e.to_string()))?;

    let aad = associated_data(cipher, context);
    let payload = Payload { msg: plaintext, aad: &aad };

    let ciphertext = match cipher {
        AeadCipher::Aes256Gcm => {
            let c = Aes256Gcm::new_from_slice(key)
                .map_err(|e| CodecError::Encryption(e.to_string()))?;
            c.encrypt(AesNonce::from_slice(&nonce), payload)
        }
        AeadCipher::XChaCha20Poly1305 => {
            let c = XChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| CodecError::Encryption(e.to_string()))?;
            c.encrypt(XNonce::from_slice(&nonce), payload)
        }
    }
    .map_err(|e| CodecError::Encryption(format!("{} encryption failed: {}", cipher.name(), e)))?;

    Ok(EncryptedBlob {
        cipher,
        nonce,
        ciphertext,
    })
}

pub fn decrypt_bound(
    key: &[u8],
    blob: &EncryptedBlob,
    context: &[u8],
) -> CodecResult<Zeroizing<Vec<u8>>> {
    check_key(key)?;

    let cipher = blob.cipher;
    if blob.nonce.len() != cipher.nonce_len() {
        return Err(CodecError::InvalidNonceLength {
            expected: cipher.nonce_len(),
            actual: blob.nonce.len(),
        });
    }
    if blob.ciphertext.len() < TAG_LEN {
        return Err(CodecError::Malformed("ciphertext shorter than tag".into()));
    }

    let aad = associated_data(cipher, context);
    let payload = Payload {
        msg: blob.ciphertext.as_slice(),
        aad: &aad,
    };

    let plaintext = match cipher {
        AeadCipher::Aes256Gcm => {
            let c = Aes256Gcm::new_from_slice(key)
                .map_err(|_| CodecError::InvalidKeyLength { expected: KEY_LEN, actual: key.len() })?;
            c.decrypt(AesNonce::from_slice(&blob.nonce), payload)
        }
        AeadCipher::XChaCha20Poly1305 => {
            let c = XChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CodecError::InvalidKeyLength { expected: KEY_LEN, actual: key.len() })?;
            c.decrypt(XNonce::from_slice(&blob.nonce), payload)
        }
    }
    .map_err(|_| CodecError::AuthenticationFailed)?;

    Ok(Zeroizing::new(plaintext))
}

fn check_key(key: &[u8]) -> CodecResult<()> {
    if key.len() != KEY_LEN {
        return Err(CodecError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        });
    }
    Ok(())
}

fn associated_data(cipher: AeadCipher, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(HEADER_LEN + context.len());
    aad.extend_from_slice(&EncryptedBlob::header(cipher));
    aad.extend_from_slice(context);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    const CIPHERS: [AeadCipher; 2] = [AeadCipher::Aes256Gcm, AeadCipher::XChaCha20Poly1305];

    #[test]
    fn test_roundtrip_both_ciphers() {
        let key = [7u8; KEY_LEN];
        for cipher in CIPHERS {
            for len in [0usize, 1, 15, 16, 17, 1024] {
                let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
                let blob = encrypt(&key, &plaintext, cipher).unwrap();
                let parsed = EncryptedBlob::from_bytes(&blob.to_bytes()).unwrap();
                let decrypted = decrypt(&key, &parsed).unwrap();
                assert_eq!(decrypted.as_slice(), plaintext.as_slice());
            }
        }
    }

    #[test]
    fn test_single_bit_flip_fails_closed() {
        let key = [9u8; KEY_LEN];
        for cipher in CIPHERS {
            for len in [0usize, 5, 64] {
                let plaintext = vec![0xAB; len];
                let bytes = encrypt(&key, &plaintext, cipher).unwrap().to_bytes();

                // everything past the header: nonce, ciphertext and tag
                for byte in HEADER_LEN..bytes.len() {
                    for bit in 0..8 {
                        let mut tampered = bytes.clone();
                        tampered[byte] ^= 1 << bit;
                        let blob = EncryptedBlob::from_bytes(&tampered).unwrap();
                        assert_eq!(
                            decrypt(&key, &blob).unwrap_err(),
                            CodecError::AuthenticationFailed
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = [1u8; KEY_LEN];
        let a = encrypt(&key, b"same payload", AeadCipher::XChaCha20Poly1305).unwrap();
        let b = encrypt(&key, b"same payload", AeadCipher::XChaCha20Poly1305).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = encrypt(&[1u8; KEY_LEN], b"secret", AeadCipher::Aes256Gcm).unwrap();
        assert_eq!(
            decrypt(&[2u8; KEY_LEN], &blob).unwrap_err(),
            CodecError::AuthenticationFailed
        );
    }

    #[test]
    fn test_rejects_short_key_and_nonce() {
        assert!(matches!(
            encrypt(&[0u8; 16], b"x", AeadCipher::XChaCha20Poly1305),
            Err(CodecError::InvalidKeyLength { expected: 32, actual: 16 })
        ));

        let key = [3u8; KEY_LEN];
        let mut blob = encrypt(&key, b"x", AeadCipher::XChaCha20Poly1305).unwrap();
        blob.nonce.truncate(12);
        assert!(matches!(
            decrypt(&key, &blob),
            Err(CodecError::InvalidNonceLength { expected: 24, actual: 12 })
        ));
    }

    #[test]
    fn test_context_binding() {
        let key = [5u8; KEY_LEN];
        let blob = encrypt_bound(&key, b"wrapped", AeadCipher::XChaCha20Poly1305, b"alias-a").unwrap();
        assert!(decrypt_bound(&key, &blob, b"alias-a").is_ok());
        assert_eq!(
            decrypt_bound(&key, &blob, b"alias-b").unwrap_err(),
            CodecError::AuthenticationFailed
        );
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(matches!(EncryptedBlob::from_bytes(&[]), Err(CodecError::Malformed(_))));
        assert_eq!(
            EncryptedBlob::from_bytes(&[9, 2]).unwrap_err(),
            CodecError::UnsupportedVersion(9)
        );
        assert_eq!(
            EncryptedBlob::from_bytes(&[ENVELOPE_VERSION, 77]).unwrap_err(),
            CodecError::UnsupportedCipher(77)
        );
        assert!(matches!(
            EncryptedBlob::from_bytes(&[ENVELOPE_VERSION, 2, 0, 0]),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_base64_roundtrip() {
        let key = [4u8; KEY_LEN];
        let blob = encrypt(&key, b"travel", AeadCipher::Aes256Gcm).unwrap();
        let again = EncryptedBlob::from_base64(&blob.to_base64()).unwrap();
        assert_eq!(decrypt(&key, &again).unwrap().as_slice(), b"travel");
    }
}
