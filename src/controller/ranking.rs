//! Candidate health ledger
//!
//! Per-profile rolling health owned exclusively by the control loop. The
//! probe machinery only emits samples; everything derived from them (EMA
//! latency, failure streaks, cool-downs) lives here so deregistration can
//! discard it atomically.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;

use crate::config::FailoverSettings;
use crate::probe::{HealthSample, ProbeOutcome};
use crate::profile::{ProfileId, ServerProfile};

/// Exponent cap keeps the backoff shift well inside u64
const BACKOFF_EXP_CAP: u32 = 6;

/// Derived health of one registered profile
#[derive(Debug, Clone, Default)]
pub struct ServerHealthState {
    /// Smoothed latency; `None` until the first success
    pub ema_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub last_outcome: Option<ProbeOutcome>,
    /// Not eligible as a failover target before this instant
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Health bookkeeping and candidate ranking
pub struct HealthLedger {
    settings: FailoverSettings,
    entries: BTreeMap<ProfileId, ServerHealthState>,
}

impl HealthLedger {
    pub fn new(settings: FailoverSettings) -> Self {
        HealthLedger { settings, entries: BTreeMap::new() }
    }

    /// Track a profile from a neutral baseline. Re-registering an already
    /// tracked profile keeps its current state.
    pub fn register(&mut self, id: ProfileId) {
        self.entries.entry(id).or_default();
    }

    /// Drop a profile and its history.
    pub fn deregister(&mut self, id: &ProfileId) {
        self.entries.remove(id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, id: &ProfileId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn state(&self, id: &ProfileId) -> Option<&ServerHealthState> {
        self.entries.get(id)
    }

    pub fn consecutive_failures(&self, id: &ProfileId) -> u32 {
        self.entries.get(id).map_or(0, |s| s.consecutive_failures)
    }

    /// Fold a sample in. Samples for untracked profiles are dropped so a
    /// late result from a deregistered worker cannot resurrect history.
    pub fn observe(&mut self, sample: &HealthSample) {
        let Some(entry) = self.entries.get_mut(&sample.profile_id) else {
            return;
        };
        match &sample.outcome {
            ProbeOutcome::Success { latency_ms } => {
                let latency = *latency_ms as f64;
                entry.ema_latency_ms = Some(match entry.ema_latency_ms {
                    Some(ema) => {
                        self.settings.ema_alpha * latency + (1.0 - self.settings.ema_alpha) * ema
                    }
                    None => latency,
                });
                entry.consecutive_failures = 0;
                entry.cooldown_until = None;
            }
            ProbeOutcome::Timeout | ProbeOutcome::ConnectError { .. } => {
                entry.consecutive_failures += 1;
                entry.cooldown_until =
                    Some(sample.timestamp + backoff(&self.settings, entry.consecutive_failures));
            }
        }
        entry.last_outcome = Some(sample.outcome.clone());
    }

    /// Count an exhausted start sequence as a failure so the candidate
    /// cools down before it is tried again.
    pub fn record_start_failure(&mut self, id: &ProfileId) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.consecutive_failures += 1;
        entry.cooldown_until =
            Some(Utc::now() + backoff(&self.settings, entry.consecutive_failures));
    }

    /// Best eligible candidate, or `None` when the group is exhausted.
    ///
    /// Eligibility: failure streak below the exclusion threshold, cool-down
    /// expired, not the profile being abandoned. Ranking: fewest
    /// consecutive failures first, then lowest EMA latency (unmeasured
    /// sorts last), then the caller's list order.
    pub fn best_candidate(
        &self,
        candidates: &[ServerProfile],
        exclude: Option<&ProfileId>,
        now: DateTime<Utc>,
    ) -> Option<ProfileId> {
        let mut best: Option<(ProfileId, u32, Option<f64>)> = None;
        for candidate in candidates {
            if exclude == Some(&candidate.id) {
                continue;
            }
            let default = ServerHealthState::default();
            let state = self.entries.get(&candidate.id).unwrap_or(&default);
            if state.consecutive_failures >= self.settings.exclusion_threshold {
                continue;
            }
            if state.cooldown_until.is_some_and(|until| until > now) {
                continue;
            }
            let beats = match &best {
                None => true,
                Some((_, failures, ema)) => {
                    state.consecutive_failures < *failures
                        || (state.consecutive_failures == *failures
                            && ema_less(state.ema_latency_ms, *ema))
                }
            };
            if beats {
                best = Some((candidate.id, state.consecutive_failures, state.ema_latency_ms));
            }
        }
        best.map(|(id, _, _)| id)
    }
}

/// Strictly-lower EMA comparison; a measured latency beats an unmeasured one.
fn ema_less(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Exponential cool-down: base doubled per consecutive failure, capped.
fn backoff(settings: &FailoverSettings, failures: u32) -> ChronoDuration {
    let exp = failures.saturating_sub(1).min(BACKOFF_EXP_CAP);
    let ms = settings
        .backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(settings.backoff_max_ms);
    ChronoDuration::milliseconds(ms as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeMethodKind;
    use crate::profile::{Protocol, ShadowsocksOptions};

    fn profile(name: &str) -> ServerProfile {
        ServerProfile {
            id: ProfileId::new(),
            name: name.to_string(),
            group: "test".to_string(),
            server: format!("{}.example.com", name),
            port: 8388,
            protocol: Protocol::Shadowsocks(ShadowsocksOptions {
                method: "aes-256-gcm".to_string(),
                password: "secret".to_string(),
            }),
        }
    }

    fn success(id: ProfileId, latency_ms: u64) -> HealthSample {
        HealthSample {
            profile_id: id,
            timestamp: Utc::now(),
            outcome: ProbeOutcome::Success { latency_ms },
            method: ProbeMethodKind::TcpPing,
        }
    }

    fn timeout(id: ProfileId) -> HealthSample {
        HealthSample {
            profile_id: id,
            timestamp: Utc::now(),
            outcome: ProbeOutcome::Timeout,
            method: ProbeMethodKind::TcpPing,
        }
    }

    fn ledger() -> HealthLedger {
        HealthLedger::new(FailoverSettings::default())
    }

    #[test]
    fn test_ema_smoothing() {
        let mut ledger = ledger();
        let id = ProfileId::new();
        ledger.register(id);

        ledger.observe(&success(id, 100));
        assert_eq!(ledger.state(&id).unwrap().ema_latency_ms, Some(100.0));

        // alpha 0.3: 0.3 * 200 + 0.7 * 100 = 130
        ledger.observe(&success(id, 200));
        let ema = ledger.state(&id).unwrap().ema_latency_ms.unwrap();
        assert!((ema - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_streak_and_reset() {
        let mut ledger = ledger();
        let id = ProfileId::new();
        ledger.register(id);

        ledger.observe(&timeout(id));
        ledger.observe(&timeout(id));
        assert_eq!(ledger.consecutive_failures(&id), 2);
        assert!(ledger.state(&id).unwrap().cooldown_until.is_some());

        ledger.observe(&success(id, 50));
        assert_eq!(ledger.consecutive_failures(&id), 0);
        assert!(ledger.state(&id).unwrap().cooldown_until.is_none());
    }

    #[test]
    fn test_untracked_samples_are_dropped() {
        let mut ledger = ledger();
        let id = ProfileId::new();
        ledger.observe(&timeout(id));
        assert!(!ledger.contains(&id));

        ledger.register(id);
        ledger.observe(&timeout(id));
        ledger.deregister(&id);
        ledger.observe(&timeout(id)); // late worker result after deregistration
        assert!(!ledger.contains(&id));

        // re-registration starts neutral
        ledger.register(id);
        assert_eq!(ledger.consecutive_failures(&id), 0);
        assert!(ledger.state(&id).unwrap().ema_latency_ms.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = FailoverSettings::default();
        assert_eq!(backoff(&settings, 1).num_milliseconds(), 5_000);
        assert_eq!(backoff(&settings, 2).num_milliseconds(), 10_000);
        assert_eq!(backoff(&settings, 3).num_milliseconds(), 20_000);
        // capped by backoff-max-ms
        assert_eq!(backoff(&settings, 60).num_milliseconds(), 300_000);
    }

    #[test]
    fn test_ranking_prefers_fewer_failures_then_latency() {
        // A: 3 timeouts (excluded), B: EMA 40 / 0 failures, C: EMA 20 / 1 failure
        let mut ledger = ledger();
        let (a, b, c) = (profile("a"), profile("b"), profile("c"));
        for p in [&a, &b, &c] {
            ledger.register(p.id);
        }
        for _ in 0..3 {
            ledger.observe(&timeout(a.id));
        }
        ledger.observe(&success(b.id, 40));
        ledger.observe(&success(c.id, 20));
        ledger.observe(&timeout(c.id));

        // past C's cool-down so only the failure count separates B and C
        let later = Utc::now() + ChronoDuration::hours(1);
        let candidates = vec![a.clone(), b.clone(), c.clone()];
        assert_eq!(ledger.best_candidate(&candidates, None, later), Some(b.id));
    }

    #[test]
    fn test_excluded_profile_needs_one_success() {
        let mut ledger = ledger();
        let a = profile("a");
        ledger.register(a.id);
        for _ in 0..3 {
            ledger.observe(&timeout(a.id));
        }
        let later = Utc::now() + ChronoDuration::hours(1);
        let candidates = vec![a.clone()];
        assert_eq!(ledger.best_candidate(&candidates, None, later), None);

        ledger.observe(&success(a.id, 80));
        assert_eq!(ledger.best_candidate(&candidates, None, later), Some(a.id));
    }

    #[test]
    fn test_cooldown_gates_selection() {
        let mut ledger = ledger();
        let (a, b) = (profile("a"), profile("b"));
        ledger.register(a.id);
        ledger.register(b.id);
        ledger.observe(&timeout(a.id)); // one failure, 5s cool-down

        let now = Utc::now();
        let candidates = vec![a.clone(), b.clone()];
        assert_eq!(ledger.best_candidate(&candidates, None, now), Some(b.id));

        // once the cool-down expires, a's single failure ranks it behind b
        let later = now + ChronoDuration::seconds(30);
        assert_eq!(ledger.best_candidate(&candidates, None, later), Some(b.id));
        assert_eq!(
            ledger.best_candidate(&[a.clone()], None, later),
            Some(a.id)
        );
    }

    #[test]
    fn test_abandoned_profile_is_excluded() {
        let mut ledger = ledger();
        let a = profile("a");
        ledger.register(a.id);
        let now = Utc::now();
        assert_eq!(ledger.best_candidate(&[a.clone()], Some(&a.id), now), None);
        assert_eq!(ledger.best_candidate(&[a.clone()], None, now), Some(a.id));
    }

    #[test]
    fn test_tie_breaks_on_list_order() {
        let ledger = ledger();
        let (a, b) = (profile("a"), profile("b"));
        let now = Utc::now();
        assert_eq!(
            ledger.best_candidate(&[a.clone(), b.clone()], None, now),
            Some(a.id)
        );
        assert_eq!(
            ledger.best_candidate(&[b.clone(), a.clone()], None, now),
            Some(b.id)
        );
    }

    #[test]
    fn test_start_failure_counts_as_failure() {
        let mut ledger = ledger();
        let a = profile("a");
        ledger.register(a.id);
        ledger.record_start_failure(&a.id);
        assert_eq!(ledger.consecutive_failures(&a.id), 1);
        assert_eq!(ledger.best_candidate(&[a.clone()], None, Utc::now()), None);
    }
}
