use chrono::{DateTime, Duration, Local, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::collaborators::SoundId;
use crate::events::{AttentionDecision, PriorityTier};

/// Daily window during which nothing interrupts proactively.
/// The window may wrap midnight; `start == end` disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHoursPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

const fn default_true() -> bool {
    true
}

impl Default for QuietHoursPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
        }
    }
}

impl QuietHoursPolicy {
    #[must_use]
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            enabled: true,
            start,
            end,
        }
    }

    /// Check whether `time` falls inside the quiet window
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if !self.enabled || self.start == self.end {
            return false;
        }
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    #[must_use]
    pub fn is_quiet_at(&self, now: DateTime<Local>) -> bool {
        self.contains(now.time())
    }
}

/// Alert-storm protection: at most `max_interrupts` in any `window_secs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_interrupts")]
    pub max_interrupts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

const fn default_max_interrupts() -> u32 {
    3
}

const fn default_window_secs() -> u64 {
    600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_interrupts: default_max_interrupts(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::seconds(i64::try_from(self.window_secs).unwrap_or(i64::MAX / 1000))
    }
}

/// Timestamps of recent INTERRUPT_NOW decisions, oldest first
#[derive(Debug, Clone, Default)]
pub struct RateState {
    interrupts: VecDeque<DateTime<Local>>,
}

impl RateState {
    /// Drop interrupts that slid out of the window ending at `now`
    fn prune(&mut self, now: DateTime<Local>, window: Duration) {
        while let Some(oldest) = self.interrupts.front() {
            if now - *oldest >= window {
                self.interrupts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an interrupt if the budget allows one at `now`
    fn try_admit(&mut self, now: DateTime<Local>, limit: &RateLimitConfig) -> bool {
        self.prune(now, limit.window());
        let used = u32::try_from(self.interrupts.len()).unwrap_or(u32::MAX);
        if used >= limit.max_interrupts {
            return false;
        }
        self.interrupts.push_back(now);
        true
    }

    /// Interrupts still inside the window ending at `now`
    #[must_use]
    pub fn count_in_window(&self, now: DateTime<Local>, window: Duration) -> usize {
        self.interrupts
            .iter()
            .filter(|at| now - **at < window)
            .count()
    }
}

/// Gate output: the decision plus the sound to play before acting on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateVerdict {
    pub decision: AttentionDecision,
    pub sound: Option<SoundId>,
    /// PRIORITY event downgraded by the rate limiter
    pub rate_limited: bool,
}

/// Single-threaded arbiter owning quiet-hours evaluation and rate state
#[derive(Debug, Default)]
pub struct AttentionGate {
    rate: RateState,
}

impl AttentionGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what an event of `tier` may do at `now`
    pub fn decide(
        &mut self,
        tier: PriorityTier,
        quiet_hours: &QuietHoursPolicy,
        limit: &RateLimitConfig,
        now: DateTime<Local>,
    ) -> GateVerdict {
        let quiet = quiet_hours.is_quiet_at(now);

        match tier {
            PriorityTier::Filtered => GateVerdict {
                decision: AttentionDecision::Suppress,
                sound: None,
                rate_limited: false,
            },
            PriorityTier::Regular => Self::silent(quiet, false),
            PriorityTier::Priority if quiet => {
                log::debug!("Quiet hours active, deferring priority alert");
                Self::silent(true, false)
            }
            PriorityTier::Priority => {
                if self.rate.try_admit(now, limit) {
                    GateVerdict {
                        decision: AttentionDecision::InterruptNow,
                        sound: Some(SoundId::ArrivalPriority),
                        rate_limited: false,
                    }
                } else {
                    log::info!(
                        "Interrupt budget of {} per {}s spent, downgrading priority alert",
                        limit.max_interrupts,
                        limit.window_secs
                    );
                    Self::silent(false, true)
                }
            }
        }
    }

    /// Ask for an interrupt slot for an already-deferred PRIORITY event
    /// (e.g. when quiet hours end). Shares the same budget as `decide`.
    pub fn admit_deferred(&mut self, limit: &RateLimitConfig, now: DateTime<Local>) -> bool {
        self.rate.try_admit(now, limit)
    }

    #[must_use]
    pub fn rate_state(&self) -> &RateState {
        &self.rate
    }

    fn silent(quiet: bool, rate_limited: bool) -> GateVerdict {
        GateVerdict {
            decision: AttentionDecision::NotifySilentPendingActivation,
            sound: if quiet {
                None
            } else {
                Some(SoundId::ArrivalRegular)
            },
            rate_limited,
        }
    }
}

/// `HH:MM` (or `HH:MM:SS`) serde format for quiet-hours boundaries
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(raw.trim(), "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
            .map_err(|e| serde::de::Error::custom(format!("invalid time {raw:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, hour, minute, 0).unwrap()
    }

    fn hm(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    fn night() -> QuietHoursPolicy {
        QuietHoursPolicy::new(hm(22, 0), hm(7, 0))
    }

    fn generous() -> RateLimitConfig {
        RateLimitConfig {
            max_interrupts: 100,
            window_secs: 60,
        }
    }

    #[test]
    fn test_quiet_hours_wrapping_midnight() {
        let policy = night();
        assert!(policy.contains(hm(22, 0)));
        assert!(policy.contains(hm(23, 30)));
        assert!(policy.contains(hm(3, 0)));
        assert!(!policy.contains(hm(7, 0)));
        assert!(!policy.contains(hm(14, 0)));
    }

    #[test]
    fn test_quiet_hours_same_day_and_disabled() {
        let afternoon = QuietHoursPolicy::new(hm(13, 0), hm(15, 0));
        assert!(afternoon.contains(hm(14, 0)));
        assert!(!afternoon.contains(hm(15, 0)));

        let empty = QuietHoursPolicy::new(hm(8, 0), hm(8, 0));
        assert!(!empty.contains(hm(8, 0)));

        let mut off = night();
        off.enabled = false;
        assert!(!off.contains(hm(23, 0)));
    }

    #[test]
    fn test_priority_outside_quiet_hours_interrupts() {
        let mut gate = AttentionGate::new();
        let verdict = gate.decide(PriorityTier::Priority, &night(), &generous(), at(14, 0));
        assert_eq!(verdict.decision, AttentionDecision::InterruptNow);
        assert_eq!(verdict.sound, Some(SoundId::ArrivalPriority));
    }

    #[test]
    fn test_priority_during_quiet_hours_is_deferred_without_sound() {
        let mut gate = AttentionGate::new();
        let verdict = gate.decide(PriorityTier::Priority, &night(), &generous(), at(23, 30));
        assert_eq!(
            verdict.decision,
            AttentionDecision::NotifySilentPendingActivation
        );
        assert_eq!(verdict.sound, None);
    }

    #[test]
    fn test_regular_never_interrupts() {
        let mut gate = AttentionGate::new();
        let day = gate.decide(PriorityTier::Regular, &night(), &generous(), at(14, 0));
        assert_eq!(day.decision, AttentionDecision::NotifySilentPendingActivation);
        assert_eq!(day.sound, Some(SoundId::ArrivalRegular));

        let late = gate.decide(PriorityTier::Regular, &night(), &generous(), at(23, 30));
        assert_eq!(late.decision, AttentionDecision::NotifySilentPendingActivation);
        assert_eq!(late.sound, None);
    }

    #[test]
    fn test_filtered_is_always_suppressed() {
        let mut gate = AttentionGate::new();
        let policies = [night(), QuietHoursPolicy::default()];
        for policy in policies {
            for hour in 0..24 {
                let verdict =
                    gate.decide(PriorityTier::Filtered, &policy, &generous(), at(hour, 15));
                assert_eq!(verdict.decision, AttentionDecision::Suppress);
                assert_eq!(verdict.sound, None);
            }
        }
    }

    #[test]
    fn test_rate_limit_downgrades_until_window_clears() {
        let mut gate = AttentionGate::new();
        let limit = RateLimitConfig {
            max_interrupts: 2,
            window_secs: 600,
        };
        let quiet = QuietHoursPolicy::default();

        let first = gate.decide(PriorityTier::Priority, &quiet, &limit, at(14, 0));
        let second = gate.decide(PriorityTier::Priority, &quiet, &limit, at(14, 1));
        let third = gate.decide(PriorityTier::Priority, &quiet, &limit, at(14, 2));
        assert_eq!(first.decision, AttentionDecision::InterruptNow);
        assert_eq!(second.decision, AttentionDecision::InterruptNow);
        assert_eq!(
            third.decision,
            AttentionDecision::NotifySilentPendingActivation
        );
        assert!(third.rate_limited);

        // 14:10 - the 14:00 interrupt slid out, one slot frees up
        let later = gate.decide(PriorityTier::Priority, &quiet, &limit, at(14, 10));
        assert_eq!(later.decision, AttentionDecision::InterruptNow);
        let still_full = gate.decide(PriorityTier::Priority, &quiet, &limit, at(14, 10));
        assert!(still_full.rate_limited);
    }

    #[test]
    fn test_rate_invariant_holds_for_every_window() {
        let mut gate = AttentionGate::new();
        let limit = RateLimitConfig {
            max_interrupts: 3,
            window_secs: 300,
        };
        let quiet = QuietHoursPolicy::default();
        let start = at(10, 0);

        let mut granted = Vec::new();
        for i in 0..200 {
            let now = start + Duration::seconds(i * 17);
            let verdict = gate.decide(PriorityTier::Priority, &quiet, &limit, now);
            if verdict.decision == AttentionDecision::InterruptNow {
                granted.push(now);
            }
        }

        for (i, window_start) in granted.iter().enumerate() {
            let in_window = granted[i..]
                .iter()
                .take_while(|t| **t - *window_start < limit.window())
                .count();
            assert!(in_window <= 3, "window starting {window_start} had {in_window}");
        }
        let end = start + Duration::seconds(200 * 17);
        assert!(gate.rate_state().count_in_window(end, limit.window()) <= 3);
    }

    #[test]
    fn test_deferred_admission_shares_budget() {
        let mut gate = AttentionGate::new();
        let limit = RateLimitConfig {
            max_interrupts: 1,
            window_secs: 600,
        };
        assert!(gate.admit_deferred(&limit, at(7, 0)));
        let verdict = gate.decide(
            PriorityTier::Priority,
            &QuietHoursPolicy::default(),
            &limit,
            at(7, 1),
        );
        assert!(verdict.rate_limited);
    }

    #[test]
    fn test_policy_toml_format() {
        let policy: QuietHoursPolicy =
            toml::from_str("start = \"22:00\"\nend = \"07:00\"").unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.start, hm(22, 0));

        let text = toml::to_string(&policy).unwrap();
        assert!(text.contains("start = \"22:00\""));
        assert!(toml::from_str::<QuietHoursPolicy>("start = \"25:00\"\nend = \"07:00\"").is_err());
    }
}
