//! Moduł kryptograficzny - Argon2id, XChaCha20-Poly1305 / AES-GCM, HKDF, zeroize

mod aead;
mod argon2_kdf;
mod hkdf_derive;
mod zeroize_utils;

pub use aead::{
    decrypt, decrypt_bound, encrypt, encrypt_bound, AeadCipher, CodecError, CodecResult,
    EncryptedBlob, ENVELOPE_VERSION, KEY_LEN, TAG_LEN,
};
pub use argon2_kdf::{
    derive_key, hash_password, verify_password, KdfAlgorithm, KdfCost, PasswordHashRecord,
    MASTER_KEY_LEN, MIN_MEMORY_KIB, RECORD_FORMAT_VERSION,
};
pub use hkdf_derive::{derive_key_32, derive_session_key, derive_subkey_fixed, purposes};
pub use zeroize_utils::{fill_pass, overwrite_passes, SecureBuffer};

#[cfg(test)]
pub(crate) use argon2_kdf::test_cost;

/// Bezpieczny wrapper na klucz główny
pub type SecretKey = secrecy::SecretBox<[u8; 32]>;
