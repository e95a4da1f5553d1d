//! Device DNA - canonical digest of device/install attributes

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, VaultError};
use crate::store::{keys, KeyValueStore};

/// Atrybuty odcisku w kolejności kanonicznej
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Os,
    OsVersion,
    Kernel,
    Locale,
    CpuCount,
    Architecture,
    HardwareId,
    AppId,
}

impl Attribute {
    pub const ALL: [Attribute; 8] = [
        Attribute::Os,
        Attribute::OsVersion,
        Attribute::Kernel,
        Attribute::Locale,
        Attribute::CpuCount,
        Attribute::Architecture,
        Attribute::HardwareId,
        Attribute::AppId,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Os => "os",
            Self::OsVersion => "os_version",
            Self::Kernel => "kernel",
            Self::Locale => "locale",
            Self::CpuCount => "cpu_count",
            Self::Architecture => "arch",
            Self::HardwareId => "hardware_id",
            Self::AppId => "app_id",
        }
    }
}

/// Source of raw attribute values. `None` means "not available on this device".
pub trait DeviceEnvironment: Send + Sync {
    fn attribute(&self, attr: Attribute) -> Option<String>;
}

/// Reads attributes from the running system via `sysinfo` and the process environment
pub struct SystemEnvironment {
    app_id: String,
}

impl SystemEnvironment {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
        }
    }

    fn locale() -> Option<String> {
        ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.is_empty())
    }

    fn cpu_count() -> Option<String> {
        use sysinfo::{CpuRefreshKind, RefreshKind, System};

        let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
        match sys.cpus().len() {
            0 => None,
            n => Some(n.to_string()),
        }
    }
}

impl DeviceEnvironment for SystemEnvironment {
    fn attribute(&self, attr: Attribute) -> Option<String> {
        use sysinfo::System;

        match attr {
            Attribute::Os => System::name(),
            Attribute::OsVersion => System::os_version(),
            Attribute::Kernel => System::kernel_version(),
            Attribute::Locale => Self::locale(),
            Attribute::CpuCount => Self::cpu_count(),
            Attribute::Architecture => Some(std::env::consts::ARCH.to_string()),
            Attribute::HardwareId => System::host_name(),
            Attribute::AppId => Some(self.app_id.clone()).filter(|id| !id.is_empty()),
        }
    }
}

/// Fixed attribute values, for tests and hosts that collect attributes themselves
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    values: Vec<(&'static str, String)>,
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attr: Attribute, value: impl Into<String>) -> Self {
        self.values.retain(|(name, _)| *name != attr.name());
        self.values.push((attr.name(), value.into()));
        self
    }
}

impl DeviceEnvironment for StaticEnvironment {
    fn attribute(&self, attr: Attribute) -> Option<String> {
        self.values
            .iter()
            .find(|(name, _)| *name == attr.name())
            .map(|(_, value)| value.clone())
    }
}

/// Zebrany odcisk urządzenia
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    /// `(name, value)` in canonical order, install timestamp last
    pub attributes: Vec<(String, String)>,
    /// SHA-256 over the canonical string
    pub digest: [u8; 32],
}

impl DeviceFingerprint {
    pub fn from_attributes(attributes: Vec<(String, String)>) -> Self {
        let digest = Sha256::digest(canonical(&attributes).as_bytes()).into();
        Self { attributes, digest }
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Persisted first-seen timestamp; the temporal layer of the salt
    pub fn install_marker(&self) -> &str {
        self.value(INSTALL_ATTRIBUTE).unwrap_or("unknown_installed_at")
    }

    /// `os/os_version/arch`; the environment layer of the salt
    pub fn environment_string(&self) -> String {
        [Attribute::Os, Attribute::OsVersion, Attribute::Architecture]
            .iter()
            .map(|attr| self.value(attr.name()).unwrap_or("unknown"))
            .collect::<Vec<_>>()
            .join("/")
    }
}

const INSTALL_ATTRIBUTE: &str = "installed_at";

fn canonical(attributes: &[(String, String)]) -> String {
    attributes
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("|")
}

/// Kolektor odcisku dla jednego profilu
pub struct FingerprintCollector {
    environment: Arc<dyn DeviceEnvironment>,
    store: Arc<dyn KeyValueStore>,
    profile: String,
}

impl FingerprintCollector {
    pub fn new(
        environment: Arc<dyn DeviceEnvironment>,
        store: Arc<dyn KeyValueStore>,
        profile: &str,
    ) -> Self {
        Self {
            environment,
            store,
            profile: profile.to_string(),
        }
    }

    /// Missing attributes become `unknown_<field>`; only storage errors fail.
    pub fn collect(&self) -> Result<DeviceFingerprint> {
        let mut attributes: Vec<(String, String)> = Attribute::ALL
            .iter()
            .map(|attr| {
                let value = self
                    .environment
                    .attribute(*attr)
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| format!("unknown_{}", attr.name()));
                (attr.name().to_string(), value)
            })
            .collect();

        attributes.push((INSTALL_ATTRIBUTE.to_string(), self.first_seen()?));
        Ok(DeviceFingerprint::from_attributes(attributes))
    }

    /// Reads the install timestamp, writing it on the very first call
    pub fn first_seen(&self) -> Result<String> {
        let key = keys::scoped(&self.profile, keys::FIRST_SEEN);
        if let Some(bytes) = self.store.get(&key)? {
            return String::from_utf8(bytes)
                .map_err(|_| VaultError::InvalidInput("first-seen marker is not UTF-8".into()));
        }

        let now = Utc::now().timestamp_millis().to_string();
        self.store.set(&key, now.as_bytes())?;
        debug!(profile = %self.profile, "Recorded first-seen marker");
        Ok(now)
    }
}
