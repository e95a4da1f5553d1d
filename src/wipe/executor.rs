//! Ordered, best-effort destruction

use std::sync::Arc;

use chrono::Utc;
use secrecy::ExposeSecretMut;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::adapter::WrapAdapter;
use crate::crypto::{fill_pass, overwrite_passes, SecretKey};
use crate::policy::WipeSeverity;
use crate::store::{keys, KeyValueStore};

/// Host subsystem with its own clear API (biometric counters, safe zones, OTP secrets)
pub trait AuxiliaryWiper: Send + Sync {
    fn name(&self) -> &str;

    fn clear(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WipeMethod {
    /// Persist the terminal marker first so an interrupted wipe still reads as wiped
    MarkWiped,
    ShredSessionKey,
    /// Envelope, hash record, pepper, failure counter
    ClearKeyMaterial,
    DestroyWrapKeys,
    OverwriteSecrets,
    ClearAppSecrets,
    ClearAuxiliary,
    /// Salt and first-seen marker
    ClearDeviceBinding,
}

impl WipeMethod {
    /// Kolejność metod dla danego poziomu
    pub fn plan(severity: WipeSeverity) -> Vec<WipeMethod> {
        let mut plan = vec![
            Self::MarkWiped,
            Self::ShredSessionKey,
            Self::ClearKeyMaterial,
            Self::DestroyWrapKeys,
        ];
        if severity >= WipeSeverity::Standard {
            plan.extend([Self::OverwriteSecrets, Self::ClearAppSecrets, Self::ClearAuxiliary]);
        }
        if severity >= WipeSeverity::Maximum {
            plan.push(Self::ClearDeviceBinding);
        }
        plan
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipeMethodResult {
    pub method: WipeMethod,
    pub success: bool,
    pub detail: Option<String>,
}

/// Everything a wipe may touch, borrowed from the vault for the duration of the run
pub struct WipeTargets<'a> {
    pub store: &'a dyn KeyValueStore,
    pub adapter: &'a dyn WrapAdapter,
    pub profile: &'a str,
    pub wrap_aliases: &'a [String],
    pub auxiliary: &'a [Arc<dyn AuxiliaryWiper>],
    pub session: &'a mut Option<SecretKey>,
}

const KEY_MATERIAL: [&str; 5] = [
    keys::ENVELOPE,
    keys::HASH_RECORD,
    keys::PEPPER_KEY,
    keys::PEPPER_TAG,
    keys::FAILED_ATTEMPTS,
];

const DEVICE_BINDING: [&str; 2] = [keys::SALT, keys::FIRST_SEEN];

fn outcome(method: WipeMethod, failures: Vec<String>) -> WipeMethodResult {
    WipeMethodResult {
        method,
        success: failures.is_empty(),
        detail: (!failures.is_empty()).then(|| failures.join("; ")),
    }
}

fn delete_all(store: &dyn KeyValueStore, profile: &str, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .filter_map(|name| {
            store
                .delete(&keys::scoped(profile, name))
                .err()
                .map(|e| format!("{}: {}", name, e))
        })
        .collect()
}

fn secret_keys(store: &dyn KeyValueStore, profile: &str) -> Result<Vec<String>, String> {
    store
        .keys_with_prefix(&keys::scoped(profile, keys::APP_SECRETS))
        .map_err(|e| e.to_string())
}

/// Runs every method of the plan; a failing method never stops the rest
pub(crate) fn run(
    plan: &[WipeMethod],
    passes: u32,
    targets: &mut WipeTargets<'_>,
) -> Vec<WipeMethodResult> {
    plan.iter()
        .flat_map(|method| {
            let results = run_method(*method, passes, targets);
            for result in &results {
                if result.success {
                    info!(method = ?result.method, "Wipe method completed");
                } else {
                    error!(method = ?result.method, detail = ?result.detail, "Wipe method failed");
                }
            }
            results
        })
        .collect()
}

fn run_method(method: WipeMethod, passes: u32, t: &mut WipeTargets<'_>) -> Vec<WipeMethodResult> {
    let single = |failures: Vec<String>| vec![outcome(method, failures)];

    match method {
        WipeMethod::MarkWiped => {
            let stamp = Utc::now().to_rfc3339();
            single(
                t.store
                    .set(&keys::scoped(t.profile, keys::WIPED_MARKER), stamp.as_bytes())
                    .err()
                    .map(|e| e.to_string())
                    .into_iter()
                    .collect(),
            )
        }

        WipeMethod::ShredSessionKey => {
            if let Some(mut key) = t.session.take() {
                overwrite_passes(key.expose_secret_mut(), passes);
            }
            single(Vec::new())
        }

        WipeMethod::ClearKeyMaterial => single(delete_all(t.store, t.profile, &KEY_MATERIAL)),

        WipeMethod::DestroyWrapKeys => single(
            t.wrap_aliases
                .iter()
                .filter_map(|alias| {
                    t.adapter
                        .delete_key(alias)
                        .err()
                        .map(|e| format!("{}: {}", alias, e))
                })
                .collect(),
        ),

        WipeMethod::OverwriteSecrets => {
            let names = match secret_keys(t.store, t.profile) {
                Ok(names) => names,
                Err(e) => return single(vec![e]),
            };
            let mut failures = Vec::new();
            for name in names {
                let len = match t.store.get(&name) {
                    Ok(Some(value)) => value.len(),
                    Ok(None) => continue,
                    Err(e) => {
                        failures.push(format!("{}: {}", name, e));
                        continue;
                    }
                };
                let mut buffer = vec![0u8; len];
                for pass in 0..passes {
                    fill_pass(&mut buffer, pass);
                    if let Err(e) = t.store.set(&name, &buffer) {
                        failures.push(format!("{}: {}", name, e));
                        break;
                    }
                }
            }
            single(failures)
        }

        WipeMethod::ClearAppSecrets => match secret_keys(t.store, t.profile) {
            Ok(names) => single(
                names
                    .iter()
                    .filter_map(|name| t.store.delete(name).err().map(|e| format!("{}: {}", name, e)))
                    .collect(),
            ),
            Err(e) => single(vec![e]),
        },

        WipeMethod::ClearAuxiliary => {
            if t.auxiliary.is_empty() {
                return single(Vec::new());
            }
            t.auxiliary
                .iter()
                .map(|aux| {
                    let failures = match aux.clear() {
                        Ok(()) => Vec::new(),
                        Err(e) => {
                            warn!(subsystem = aux.name(), "Auxiliary clear failed");
                            vec![e.to_string()]
                        }
                    };
                    let mut result = outcome(method, failures);
                    result.detail = Some(match result.detail {
                        Some(err) => format!("{}: {}", aux.name(), err),
                        None => aux.name().to_string(),
                    });
                    result
                })
                .collect()
        }

        WipeMethod::ClearDeviceBinding => single(delete_all(t.store, t.profile, &DEVICE_BINDING)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryWrapAdapter;
    use crate::store::MemoryStore;
    use secrecy::SecretBox;

    struct FailingAux;

    impl AuxiliaryWiper for FailingAux {
        fn name(&self) -> &str {
            "otp"
        }

        fn clear(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("otp store offline".into())
        }
    }

    #[test]
    fn test_plan_grows_with_severity() {
        let minimal = WipeMethod::plan(WipeSeverity::Minimal);
        let maximum = WipeMethod::plan(WipeSeverity::Maximum);
        assert_eq!(minimal[0], WipeMethod::MarkWiped);
        assert!(minimal.contains(&WipeMethod::ClearKeyMaterial));
        assert!(!minimal.contains(&WipeMethod::ClearAppSecrets));
        assert!(maximum.len() > WipeMethod::plan(WipeSeverity::Standard).len());
        assert_eq!(maximum.last(), Some(&WipeMethod::ClearDeviceBinding));
    }

    #[test]
    fn test_failures_do_not_stop_the_run() {
        let store = MemoryStore::new();
        store.set("p/master_envelope", b"env").unwrap();
        store.set("p/secrets/token", b"abcdef").unwrap();
        let adapter = MemoryWrapAdapter::new();
        adapter.wrap("vault", b"k").unwrap();

        let aux: Vec<Arc<dyn AuxiliaryWiper>> = vec![Arc::new(FailingAux)];
        let aliases = vec!["vault".to_string()];
        let mut session = Some(SecretBox::new(Box::new([3u8; 32])));
        let mut targets = WipeTargets {
            store: &store,
            adapter: &adapter,
            profile: "p",
            wrap_aliases: &aliases,
            auxiliary: &aux,
            session: &mut session,
        };

        let results = run(&WipeMethod::plan(WipeSeverity::Standard), 3, &mut targets);
        let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].method, WipeMethod::ClearAuxiliary);
        assert!(failed[0].detail.as_deref().unwrap().starts_with("otp"));

        assert!(session.is_none());
        assert!(!adapter.has_key("vault"));
        assert_eq!(store.get("p/master_envelope").unwrap(), None);
        assert_eq!(store.get("p/secrets/token").unwrap(), None);
        assert!(store.get("p/wiped").unwrap().is_some());
    }
}
