//! Integrity / threat signals
//!
//! Detection heuristics live in the platform layer; the vault only consumes
//! the resulting bitmask and a 0..=10 threat level.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Highest value of [`ThreatSignalSource::current_threat_level`]
pub const MAX_THREAT_LEVEL: u8 = 10;

/// Bitmask of integrity violations reported by the platform probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrityFlags(u32);

impl IntegrityFlags {
    pub const NONE: Self = Self(0);
    pub const DEBUGGER_ATTACHED: Self = Self(0x01);
    pub const SU_BINARY_FOUND: Self = Self(0x02);
    pub const FRIDA_DETECTED: Self = Self(0x04);
    pub const PLAY_VERDICT_FAIL: Self = Self(0x08);
    pub const SELINUX_PERMISSIVE: Self = Self(0x10);
    pub const MAGISK_DETECTED: Self = Self(0x20);
    pub const XPOSED_DETECTED: Self = Self(0x40);

    /// (flag, name, weight w skali zagrożenia)
    const TABLE: [(Self, &'static str, u8); 7] = [
        (Self::DEBUGGER_ATTACHED, "debugger", 4),
        (Self::SU_BINARY_FOUND, "su_binary", 3),
        (Self::FRIDA_DETECTED, "frida", 5),
        (Self::PLAY_VERDICT_FAIL, "play_verdict", 2),
        (Self::SELINUX_PERMISSIVE, "selinux_permissive", 2),
        (Self::MAGISK_DETECTED, "magisk", 4),
        (Self::XPOSED_DETECTED, "xposed", 4),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub const fn is_clean(&self) -> bool {
        self.0 == 0
    }

    /// Lowercase hex rendering used by the salt deriver
    pub fn to_hex(&self) -> String {
        format!("{:08x}", self.0)
    }

    /// Names of the set known flags
    pub fn names(&self) -> Vec<&'static str> {
        Self::TABLE
            .iter()
            .filter(|(flag, _, _)| self.contains(*flag))
            .map(|(_, name, _)| *name)
            .collect()
    }

    /// Weighted threat score, capped at [`MAX_THREAT_LEVEL`].
    /// Unknown bits count as one point each.
    pub fn threat_score(&self) -> u8 {
        let mut known = 0u32;
        let mut score = 0u32;
        for (flag, _, weight) in Self::TABLE {
            known |= flag.0;
            if self.contains(flag) {
                score += weight as u32;
            }
        }
        score += (self.0 & !known).count_ones();
        score.min(MAX_THREAT_LEVEL as u32) as u8
    }
}

impl std::ops::BitOr for IntegrityFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for IntegrityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "clean");
        }
        write!(f, "{}", self.names().join("|"))
    }
}

/// Źródło sygnałów zagrożenia (platform probe)
pub trait ThreatSignalSource: Send + Sync {
    fn probe(&self) -> IntegrityFlags;

    /// 0 (none) ..= 10 (device compromised)
    fn current_threat_level(&self) -> u8;
}

/// Fixed signals set by the host (tests, desktop builds without probes)
#[derive(Debug, Default)]
pub struct StaticThreatSource {
    flags: AtomicU32,
    level: AtomicU8,
}

impl StaticThreatSource {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn set_flags(&self, flags: IntegrityFlags) {
        self.flags.store(flags.bits(), Ordering::SeqCst);
    }

    pub fn set_level(&self, level: u8) {
        self.level.store(level.min(MAX_THREAT_LEVEL), Ordering::SeqCst);
    }
}

impl ThreatSignalSource for StaticThreatSource {
    fn probe(&self) -> IntegrityFlags {
        IntegrityFlags::from_bits(self.flags.load(Ordering::SeqCst))
    }

    /// The larger of the explicit level and the score of the probed flags
    fn current_threat_level(&self) -> u8 {
        self.level
            .load(Ordering::SeqCst)
            .max(self.probe().threat_score())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert_eq!(IntegrityFlags::DEBUGGER_ATTACHED.bits(), 0x01);
        assert_eq!(IntegrityFlags::PLAY_VERDICT_FAIL.bits(), 0x08);
        assert_eq!(IntegrityFlags::XPOSED_DETECTED.bits(), 0x40);
        let both = IntegrityFlags::FRIDA_DETECTED | IntegrityFlags::SU_BINARY_FOUND;
        assert_eq!(both.to_hex(), "00000006");
        assert_eq!(both.to_string(), "su_binary|frida");
    }

    #[test]
    fn test_threat_score() {
        assert_eq!(IntegrityFlags::NONE.threat_score(), 0);
        assert_eq!(IntegrityFlags::PLAY_VERDICT_FAIL.threat_score(), 2);
        let rooted = IntegrityFlags::MAGISK_DETECTED
            | IntegrityFlags::FRIDA_DETECTED
            | IntegrityFlags::DEBUGGER_ATTACHED;
        assert_eq!(rooted.threat_score(), 10);
        assert_eq!(IntegrityFlags::from_bits(0x300).threat_score(), 2);
    }

    #[test]
    fn test_static_source() {
        let source = StaticThreatSource::clean();
        assert!(source.probe().is_clean());
        assert_eq!(source.current_threat_level(), 0);

        source.set_flags(IntegrityFlags::SU_BINARY_FOUND);
        assert_eq!(source.current_threat_level(), 3);
        source.set_level(42);
        assert_eq!(source.current_threat_level(), 10);
    }
}
