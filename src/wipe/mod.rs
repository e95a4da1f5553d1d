//! Auto-wipe: decyzje i egzekucja
//!
//! Decisions are pure outputs; [`AutoWipeEngine::execute`] performs them.
//! A wipe is irreversible. Re-running it finds nothing left to clear.

mod executor;
mod trigger;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{Result, VaultError};
use crate::policy::{WipePolicy, WipeSeverity};
use crate::store::{keys, KeyValueStore};

pub use executor::{AuxiliaryWiper, WipeMethod, WipeMethodResult, WipeTargets};
pub use trigger::{remote_token_digest, SignedWipeCommand, WipeTrigger};

use trigger::verify_remote_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WipeReason {
    AttemptsExhausted,
    RemoteCommand,
    Panic,
    ThreatScore,
    Manual,
}

/// Wynik decyzji - nigdy sam nie zmienia stanu
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipeDecision {
    pub should_wipe: bool,
    pub reason: Option<WipeReason>,
    pub remaining_attempts: u32,
}

impl WipeDecision {
    pub fn wipe(reason: WipeReason) -> Self {
        Self {
            should_wipe: true,
            reason: Some(reason),
            remaining_attempts: 0,
        }
    }

    pub fn keep(remaining_attempts: u32) -> Self {
        Self {
            should_wipe: false,
            reason: None,
            remaining_attempts,
        }
    }
}

/// Zdarzenie wipe w historii
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipeEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: WipeReason,
    pub severity: WipeSeverity,
    pub results: Vec<WipeMethodResult>,
}

impl WipeEvent {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

/// Persisted failure counter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AttemptCounter {
    count: u32,
    last_failure: Option<DateTime<Utc>>,
}

/// Silnik auto-wipe jednego profilu
pub struct AutoWipeEngine {
    store: Arc<dyn KeyValueStore>,
    profile: String,
    policy: WipePolicy,
    /// Serializes read-increment-compare of the counter
    counter_lock: Mutex<()>,
}

impl AutoWipeEngine {
    pub fn new(store: Arc<dyn KeyValueStore>, profile: &str, policy: WipePolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            store,
            profile: profile.to_string(),
            policy,
            counter_lock: Mutex::new(()),
        })
    }

    pub fn policy(&self) -> &WipePolicy {
        &self.policy
    }

    fn key(&self, name: &str) -> String {
        keys::scoped(&self.profile, name)
    }

    fn load_counter(&self) -> Result<AttemptCounter> {
        match self.store.get(&self.key(keys::FAILED_ATTEMPTS))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(AttemptCounter::default()),
        }
    }

    /// Counter with failures outside the rolling window discarded
    fn live_counter(&self, now: DateTime<Utc>) -> Result<AttemptCounter> {
        let counter = self.load_counter()?;
        match counter.last_failure {
            Some(last) if now - last > self.policy.attempt_window() => Ok(AttemptCounter::default()),
            _ => Ok(counter),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DECISIONS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn report_failed_attempt(&self) -> Result<WipeDecision> {
        self.report_failed_attempt_at(Utc::now())
    }

    pub(crate) fn report_failed_attempt_at(&self, now: DateTime<Utc>) -> Result<WipeDecision> {
        let _guard = self.counter_lock.lock();

        let mut counter = self.live_counter(now)?;
        counter.count = counter.count.saturating_add(1);
        counter.last_failure = Some(now);
        self.store
            .set(&self.key(keys::FAILED_ATTEMPTS), &serde_json::to_vec(&counter)?)?;

        let threshold = self.policy.max_failed_attempts;
        if counter.count >= threshold {
            warn!(profile = %self.profile, attempts = counter.count, "Failed attempts exhausted");
            Ok(WipeDecision::wipe(WipeReason::AttemptsExhausted))
        } else {
            Ok(WipeDecision::keep(threshold - counter.count))
        }
    }

    pub fn report_explicit_trigger(&self, trigger: &WipeTrigger) -> Result<WipeDecision> {
        self.report_explicit_trigger_at(trigger, Utc::now())
    }

    pub(crate) fn report_explicit_trigger_at(
        &self,
        trigger: &WipeTrigger,
        now: DateTime<Utc>,
    ) -> Result<WipeDecision> {
        let decision = match trigger {
            WipeTrigger::Panic => WipeDecision::wipe(WipeReason::Panic),
            WipeTrigger::Manual => WipeDecision::wipe(WipeReason::Manual),
            WipeTrigger::RemoteCommand { token } => {
                verify_remote_token(token, &self.policy)?;
                WipeDecision::wipe(WipeReason::RemoteCommand)
            }
            WipeTrigger::SignedRemoteCommand(command) => {
                let authority = self.policy.remote_authority_key.as_deref().ok_or_else(|| {
                    VaultError::UnauthorizedTrigger("no remote authority registered".into())
                })?;
                command.verify(
                    authority,
                    &self.profile,
                    self.policy.remote_command_max_age(),
                    now,
                )?;
                WipeDecision::wipe(WipeReason::RemoteCommand)
            }
            WipeTrigger::ThreatScore(score) if *score >= self.policy.threat_threshold => {
                WipeDecision::wipe(WipeReason::ThreatScore)
            }
            WipeTrigger::ThreatScore(_) => WipeDecision::keep(self.remaining_attempts()?),
        };

        if decision.should_wipe {
            info!(profile = %self.profile, trigger = trigger.name(), "Wipe trigger accepted");
        }
        Ok(decision)
    }

    pub fn remaining_attempts(&self) -> Result<u32> {
        let counter = self.live_counter(Utc::now())?;
        Ok(self.policy.max_failed_attempts.saturating_sub(counter.count))
    }

    /// Only the vault calls this, and only after a successful unlock
    pub(crate) fn reset_failed_attempts(&self) -> Result<()> {
        let _guard = self.counter_lock.lock();
        self.store.delete(&self.key(keys::FAILED_ATTEMPTS))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // EXECUTION
    // ═══════════════════════════════════════════════════════════════════════

    pub fn is_wiped(&self) -> Result<bool> {
        Ok(self.store.contains(&self.key(keys::WIPED_MARKER))?)
    }

    /// Runs the plan for the configured severity. `None` when the decision says keep.
    pub fn execute(
        &self,
        decision: &WipeDecision,
        mut targets: WipeTargets<'_>,
    ) -> Result<Option<WipeEvent>> {
        let Some(reason) = decision.reason.filter(|_| decision.should_wipe) else {
            return Ok(None);
        };

        let severity = self.policy.severity;
        warn!(profile = %self.profile, ?reason, severity = severity.as_str(), "Executing wipe");

        let plan = WipeMethod::plan(severity);
        let results = executor::run(&plan, severity.overwrite_passes(), &mut targets);
        let event = WipeEvent {
            timestamp: Utc::now(),
            reason,
            severity,
            results,
        };

        if let Err(e) = self.append_history(&event) {
            error!(error = %e, "Failed to persist wipe event");
        }
        info!(
            succeeded = event.succeeded(),
            total = event.results.len(),
            "Wipe finished"
        );
        Ok(Some(event))
    }

    fn append_history(&self, event: &WipeEvent) -> Result<()> {
        let mut history = self.history()?;
        history.push(event.clone());
        if history.len() > self.policy.history_cap {
            let excess = history.len() - self.policy.history_cap;
            history.drain(..excess);
        }
        self.store
            .set(&self.key(keys::WIPE_HISTORY), &serde_json::to_vec(&history)?)?;
        Ok(())
    }

    /// Oldest first
    pub fn history(&self) -> Result<Vec<WipeEvent>> {
        match self.store.get(&self.key(keys::WIPE_HISTORY))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn last_event(&self) -> Result<Option<WipeEvent>> {
        Ok(self.history()?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryWrapAdapter;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use secrecy::SecretString;

    fn engine(policy: WipePolicy) -> AutoWipeEngine {
        AutoWipeEngine::new(Arc::new(MemoryStore::new()), "default", policy).unwrap()
    }

    fn run_wipe(engine: &AutoWipeEngine, decision: &WipeDecision) -> Option<WipeEvent> {
        let adapter = MemoryWrapAdapter::new();
        let mut session = None;
        engine
            .execute(
                decision,
                WipeTargets {
                    store: engine.store.as_ref(),
                    adapter: &adapter,
                    profile: "default",
                    wrap_aliases: &[],
                    auxiliary: &[],
                    session: &mut session,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_threshold_exactly() {
        let engine = engine(WipePolicy::default());
        for expected in (1..5).rev() {
            let decision = engine.report_failed_attempt().unwrap();
            assert!(!decision.should_wipe);
            assert_eq!(decision.remaining_attempts, expected);
        }
        let decision = engine.report_failed_attempt().unwrap();
        assert!(decision.should_wipe);
        assert_eq!(decision.reason, Some(WipeReason::AttemptsExhausted));
    }

    #[test]
    fn test_window_expiry_restarts_count() {
        let engine = engine(WipePolicy {
            max_failed_attempts: 2,
            attempt_window_seconds: 60,
            ..Default::default()
        });
        let t0 = Utc::now();
        assert!(!engine.report_failed_attempt_at(t0).unwrap().should_wipe);
        let later = t0 + Duration::seconds(120);
        let decision = engine.report_failed_attempt_at(later).unwrap();
        assert!(!decision.should_wipe);
        assert_eq!(decision.remaining_attempts, 1);
        assert!(engine
            .report_failed_attempt_at(later + Duration::seconds(5))
            .unwrap()
            .should_wipe);
    }

    #[test]
    fn test_reset() {
        let engine = engine(WipePolicy::default());
        engine.report_failed_attempt().unwrap();
        engine.report_failed_attempt().unwrap();
        assert_eq!(engine.remaining_attempts().unwrap(), 3);
        engine.reset_failed_attempts().unwrap();
        assert_eq!(engine.remaining_attempts().unwrap(), 5);
    }

    #[test]
    fn test_explicit_triggers() {
        let engine = engine(WipePolicy {
            remote_token_sha256: Some(remote_token_digest("s3cret")),
            threat_threshold: 7,
            ..Default::default()
        });

        assert!(engine.report_explicit_trigger(&WipeTrigger::Panic).unwrap().should_wipe);
        assert!(!engine
            .report_explicit_trigger(&WipeTrigger::ThreatScore(6))
            .unwrap()
            .should_wipe);
        assert_eq!(
            engine
                .report_explicit_trigger(&WipeTrigger::ThreatScore(7))
                .unwrap()
                .reason,
            Some(WipeReason::ThreatScore)
        );

        let good = WipeTrigger::RemoteCommand {
            token: SecretString::from("s3cret"),
        };
        assert!(engine.report_explicit_trigger(&good).unwrap().should_wipe);
        let bad = WipeTrigger::RemoteCommand {
            token: SecretString::from("guess"),
        };
        assert!(matches!(
            engine.report_explicit_trigger(&bad),
            Err(VaultError::UnauthorizedTrigger(_))
        ));
    }

    #[test]
    fn test_keep_decision_executes_nothing() {
        let engine = engine(WipePolicy::default());
        assert!(run_wipe(&engine, &WipeDecision::keep(3)).is_none());
        assert!(!engine.is_wiped().unwrap());
    }

    #[test]
    fn test_history_is_capped() {
        let engine = engine(WipePolicy {
            history_cap: 2,
            ..Default::default()
        });
        for reason in [WipeReason::Panic, WipeReason::Manual, WipeReason::ThreatScore] {
            let event = run_wipe(&engine, &WipeDecision::wipe(reason)).unwrap();
            assert!(event.is_complete());
        }
        let history = engine.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].reason, WipeReason::Manual);
        assert_eq!(engine.last_event().unwrap().unwrap().reason, WipeReason::ThreatScore);
        assert!(engine.is_wiped().unwrap());
    }
}
