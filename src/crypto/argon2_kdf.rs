//! Argon2id KDF - derywacja klucza głównego i rekordy hashy haseł

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Current [`PasswordHashRecord`] format
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// Master key length (256 bit)
pub const MASTER_KEY_LEN: usize = 32;

/// Floor below which a cost profile is rejected
pub const MIN_MEMORY_KIB: u32 = 1024;

/// Ceiling for any cost read back from storage (4 GiB)
pub const MAX_MEMORY_KIB: u32 = 4 * 1024 * 1024;

const MAX_ITERATIONS: u32 = 64;
const MAX_PARALLELISM: u32 = 64;

const RECORD_SALT_LEN: usize = 16;

/// Domain secret mixed into master key derivation, keeps it distinct from record hashes
const MASTER_KEY_DOMAIN: &[u8] = b"ALFA_DEVICEVAULT_v1_MASTER";

/// Koszt Argon2id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfCost {
    /// Pamięć w KiB
    pub memory_kib: u32,
    /// Iteracje (time cost)
    pub iterations: u32,
    /// Równoległość
    pub parallelism: u32,
    /// Długość wyjściowa
    pub output_len: usize,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self::for_target()
    }
}

impl KdfCost {
    /// Telefony: 64 MiB, 3 przebiegi
    pub fn mobile() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 2,
            output_len: MASTER_KEY_LEN,
        }
    }

    /// Desktop: 256 MiB, 4 przebiegi
    pub fn desktop() -> Self {
        Self {
            memory_kib: 256 * 1024,
            iterations: 4,
            parallelism: 4,
            output_len: MASTER_KEY_LEN,
        }
    }

    /// Słabe urządzenia / szybkie odblokowanie
    pub fn interactive() -> Self {
        Self {
            memory_kib: 16 * 1024,
            iterations: 4,
            parallelism: 1,
            output_len: MASTER_KEY_LEN,
        }
    }

    /// Profile picked by the build target
    pub fn for_target() -> Self {
        if cfg!(any(target_os = "android", target_os = "ios")) {
            Self::mobile()
        } else {
            Self::desktop()
        }
    }

    /// Auto-tuning parametrów na podstawie CPU i pamięci
    pub fn auto_tune(cpu_count: usize, available_memory_mb: u64) -> Self {
        let parallelism = (cpu_count / 2).clamp(1, 8) as u32;
        let memory_mib = ((available_memory_mb / 4).min(512) as u32).max(16);
        let iterations = if memory_mib >= 128 { 2 } else { 3 };

        Self {
            memory_kib: memory_mib * 1024,
            iterations,
            parallelism,
            output_len: MASTER_KEY_LEN,
        }
    }

    /// Auto-tuning from the live system
    pub fn auto_tune_from_system() -> Self {
        use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new())
                .with_memory(MemoryRefreshKind::new().with_ram()),
        );
        let available_mb = sys.available_memory() / 1024 / 1024;
        Self::auto_tune(sys.cpus().len(), available_mb)
    }

    /// Oblicz szacowany czas derywacji (ms)
    pub fn estimated_time_ms(&self) -> u64 {
        let base = 50u64;
        let mem_factor = (self.memory_kib as u64 / 1024).max(1);
        base * self.iterations as u64 * mem_factor / self.parallelism.max(1) as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_kib < MIN_MEMORY_KIB {
            return Err(VaultError::InvalidInput(format!(
                "Argon2 memory {} KiB below minimum {} KiB",
                self.memory_kib, MIN_MEMORY_KIB
            )));
        }
        if self.memory_kib > MAX_MEMORY_KIB {
            return Err(VaultError::InvalidInput(format!(
                "Argon2 memory {} KiB above maximum {} KiB",
                self.memory_kib, MAX_MEMORY_KIB
            )));
        }
        if self.iterations == 0 || self.parallelism == 0 {
            return Err(VaultError::InvalidInput(
                "Argon2 iterations and parallelism must be non-zero".into(),
            ));
        }
        if self.iterations > MAX_ITERATIONS || self.parallelism > MAX_PARALLELISM {
            return Err(VaultError::InvalidInput(format!(
                "Argon2 iterations/parallelism above {}/{}",
                MAX_ITERATIONS, MAX_PARALLELISM
            )));
        }
        if !(16..=64).contains(&self.output_len) {
            return Err(VaultError::InvalidInput(format!(
                "Argon2 output length {} outside 16..=64",
                self.output_len
            )));
        }
        Ok(())
    }

    fn params(&self) -> Result<Params> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(self.output_len),
        )
        .map_err(|e| VaultError::KeyDerivationFailed(format!("Invalid Argon2 params: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    #[serde(rename = "argon2id")]
    Argon2id,
}

/// Zapisany rekord hasła
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHashRecord {
    pub format_version: u32,
    pub algorithm: KdfAlgorithm,
    pub cost: KdfCost,
    /// Record salt (base64)
    pub salt: String,
    /// Hash value (base64)
    pub hash: String,
    /// Password was pre-combined with the device salt before hashing
    #[serde(default)]
    pub device_bound: bool,
}

impl PasswordHashRecord {
    /// Export as a PHC string (`$argon2id$v=19$m=..,t=..,p=..$salt$hash`)
    pub fn to_phc_string(&self) -> Result<String> {
        if self.device_bound {
            return Err(VaultError::InvalidInput(
                "device-bound records have no portable PHC form".into(),
            ));
        }
        let (salt, hash) = self.decoded()?;
        Ok(format!(
            "$argon2id$v=19$m={},t={},p={}${}${}",
            self.cost.memory_kib,
            self.cost.iterations,
            self.cost.parallelism,
            STANDARD_NO_PAD.encode(salt),
            STANDARD_NO_PAD.encode(hash.as_slice()),
        ))
    }

    /// Import a PHC string, e.g. a legacy libsodium `crypto_pwhash_str` record
    pub fn from_phc_string(phc: &str) -> Result<Self> {
        use argon2::password_hash::PasswordHash;

        let parsed = PasswordHash::new(phc).map_err(|_| VaultError::NotConfigured)?;
        if parsed.algorithm.as_str() != "argon2id" {
            return Err(VaultError::NotConfigured);
        }
        if parsed.version.is_some_and(|v| v != 0x13) {
            return Err(VaultError::NotConfigured);
        }

        let params = Params::try_from(&parsed).map_err(|_| VaultError::NotConfigured)?;
        let salt = parsed.salt.ok_or(VaultError::NotConfigured)?;
        let mut salt_buf = [0u8; 64];
        let salt_bytes = salt
            .decode_b64(&mut salt_buf)
            .map_err(|_| VaultError::NotConfigured)?;
        let output = parsed.hash.ok_or(VaultError::NotConfigured)?;

        Ok(Self {
            format_version: RECORD_FORMAT_VERSION,
            algorithm: KdfAlgorithm::Argon2id,
            cost: KdfCost {
                memory_kib: params.m_cost(),
                iterations: params.t_cost(),
                parallelism: params.p_cost(),
                output_len: output.len(),
            },
            salt: STANDARD.encode(salt_bytes),
            hash: STANDARD.encode(output.as_bytes()),
            device_bound: false,
        })
    }

    fn decoded(&self) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        if self.format_version != RECORD_FORMAT_VERSION {
            return Err(VaultError::NotConfigured);
        }
        let salt = STANDARD.decode(&self.salt).map_err(|_| VaultError::NotConfigured)?;
        let hash = STANDARD.decode(&self.hash).map_err(|_| VaultError::NotConfigured)?;
        if hash.len() != self.cost.output_len || salt.is_empty() {
            return Err(VaultError::NotConfigured);
        }
        Ok((salt, Zeroizing::new(hash)))
    }
}

/// Hashuje hasło do nowego rekordu (losowy salt rekordu)
pub fn hash_password(
    password: &SecretString,
    cost: &KdfCost,
    device_salt: Option<&[u8]>,
) -> Result<PasswordHashRecord> {
    cost.validate()?;

    let mut salt = [0u8; RECORD_SALT_LEN];
    getrandom::getrandom(&mut salt)
        .map_err(|e| VaultError::Crypto(format!("RNG failed: {}", e)))?;

    let input = prepare_password(password, device_salt)?;
    let hash = run_argon2(&input, &salt, cost)?;

    Ok(PasswordHashRecord {
        format_version: RECORD_FORMAT_VERSION,
        algorithm: KdfAlgorithm::Argon2id,
        cost: *cost,
        salt: STANDARD.encode(salt),
        hash: STANDARD.encode(hash.as_slice()),
        device_bound: device_salt.is_some(),
    })
}

/// Weryfikuje hasło względem rekordu.
///
/// Cost parameters come from the record, never from current defaults.
/// A wrong password yields `Ok(false)`; an unreadable record yields
/// `Err(NotConfigured)`.
pub fn verify_password(
    password: &SecretString,
    record: &PasswordHashRecord,
    device_salt: Option<&[u8]>,
) -> Result<bool> {
    let (salt, expected) = record.decoded()?;
    // Corrupted cost must not reach the allocator
    record.cost.validate().map_err(|_| VaultError::NotConfigured)?;

    let device_salt = match (record.device_bound, device_salt) {
        (true, None) => return Err(VaultError::NotConfigured),
        (true, salt) => salt,
        (false, _) => None,
    };

    let input = prepare_password(password, device_salt)?;
    let computed = run_argon2(&input, &salt, &record.cost).map_err(|_| VaultError::NotConfigured)?;

    Ok(computed.as_slice().ct_eq(expected.as_slice()).into())
}

/// Derywuje klucz główny z hasła i soli urządzenia
pub fn derive_key(
    password: &SecretString,
    salt: &[u8],
    cost: &KdfCost,
) -> Result<SecretBox<[u8; MASTER_KEY_LEN]>> {
    cost.validate()?;
    if salt.len() < 8 {
        return Err(VaultError::InvalidInput(format!(
            "salt too short: {} bytes",
            salt.len()
        )));
    }

    let params = KdfCost {
        output_len: MASTER_KEY_LEN,
        ..*cost
    }
    .params()?;

    let argon2 = Argon2::new_with_secret(MASTER_KEY_DOMAIN, Algorithm::Argon2id, Version::V0x13, params)
        .map_err(|e| VaultError::KeyDerivationFailed(format!("Argon2 init failed: {}", e)))?;

    let mut output = Box::new([0u8; MASTER_KEY_LEN]);
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut output[..])
        .map_err(|e| VaultError::KeyDerivationFailed(format!("Hashing failed: {}", e)))?;

    Ok(SecretBox::new(output))
}

/// Device-bound mode keys the password with the device salt before stretching
fn prepare_password(password: &SecretString, device_salt: Option<&[u8]>) -> Result<Zeroizing<Vec<u8>>> {
    let raw = password.expose_secret().as_bytes();
    match device_salt {
        None => Ok(Zeroizing::new(raw.to_vec())),
        Some(salt) => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(salt)
                .map_err(|e| VaultError::Crypto(e.to_string()))?;
            mac.update(raw);
            Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
        }
    }
}

fn run_argon2(input: &[u8], salt: &[u8], cost: &KdfCost) -> Result<Zeroizing<Vec<u8>>> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, cost.params()?);
    let mut out = Zeroizing::new(vec![0u8; cost.output_len]);
    argon2
        .hash_password_into(input, salt, &mut out)
        .map_err(|e| VaultError::KeyDerivationFailed(format!("Hashing failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
pub(crate) fn test_cost() -> KdfCost {
    KdfCost {
        memory_kib: MIN_MEMORY_KIB,
        iterations: 1,
        parallelism: 1,
        output_len: MASTER_KEY_LEN,
    }
}
