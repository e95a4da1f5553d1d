//! Device binding: fingerprint, layered salt, integrity signals

mod attestation;
mod fingerprint;
mod salt;

pub use attestation::{IntegrityFlags, StaticThreatSource, ThreatSignalSource, MAX_THREAT_LEVEL};
pub use fingerprint::{
    Attribute, DeviceEnvironment, DeviceFingerprint, FingerprintCollector, StaticEnvironment,
    SystemEnvironment,
};
pub use salt::{
    derive_salt, hardware_entropy, load_or_derive, load_salt, SaltMaterial, HARDWARE_ENTROPY_LEN,
    SALT_LEN,
};
