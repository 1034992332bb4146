use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::ConnectivityConfig;

/// Outcome of one `ConnectivityProbe::probe` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeResult {
    Healthy,
    Failed(String),
    /// Channel reachable but credentials were rejected
    AuthExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Connected,
    /// Consecutive failures so far
    Degraded(u32),
    Lost,
    /// Reachable again, missed events being fetched
    Recovering,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Degraded(n) => write!(f, "degraded ({n} failed probe(s))"),
            Self::Lost => f.write_str("lost"),
            Self::Recovering => f.write_str("recovering"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
}

/// Auth signal, reported independently of reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChange {
    Expired,
    Restored,
}

/// What a probe result changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    pub transition: Option<Transition>,
    pub auth: Option<AuthChange>,
}

/// Sole owner of `ConnectivityState`
#[derive(Debug)]
pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    state: ConnectivityState,
    auth_expired: bool,
    outage_started: Option<DateTime<Local>>,
}

impl ConnectivityMonitor {
    #[must_use]
    pub const fn new(config: ConnectivityConfig) -> Self {
        Self {
            config,
            state: ConnectivityState::Connected,
            auth_expired: false,
            outage_started: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConnectivityState {
        self.state
    }

    #[must_use]
    pub const fn auth_expired(&self) -> bool {
        self.auth_expired
    }

    /// Start of the current (or just-ended) outage, the `since` for missed-mail fetches
    #[must_use]
    pub const fn outage_started(&self) -> Option<DateTime<Local>> {
        self.outage_started
    }

    /// Mail can be read or written right now
    #[must_use]
    pub const fn mail_available(&self) -> bool {
        !self.auth_expired
            && matches!(
                self.state,
                ConnectivityState::Connected | ConnectivityState::Degraded(_)
            )
    }

    pub fn set_config(&mut self, config: ConnectivityConfig) {
        self.config = config;
    }

    /// Fold one probe result into the state machine
    pub fn observe(&mut self, result: &ProbeResult, now: DateTime<Local>) -> Observation {
        let from = self.state;
        let mut observation = Observation::default();

        match result {
            ProbeResult::Failed(reason) => {
                self.state = match from {
                    ConnectivityState::Connected => ConnectivityState::Degraded(1),
                    ConnectivityState::Degraded(n) if n < self.config.max_retries => {
                        ConnectivityState::Degraded(n + 1)
                    }
                    ConnectivityState::Degraded(_)
                    | ConnectivityState::Lost
                    | ConnectivityState::Recovering => ConnectivityState::Lost,
                };
                if from == ConnectivityState::Connected {
                    self.outage_started = Some(now);
                }
                log::debug!("Probe failed ({reason}), state {}", self.state);
            }
            ProbeResult::Healthy | ProbeResult::AuthExpired => {
                self.state = match from {
                    ConnectivityState::Lost => ConnectivityState::Recovering,
                    ConnectivityState::Degraded(_) => ConnectivityState::Connected,
                    other => other,
                };
                let expired = matches!(result, ProbeResult::AuthExpired);
                if expired != self.auth_expired {
                    self.auth_expired = expired;
                    observation.auth = Some(if expired {
                        AuthChange::Expired
                    } else {
                        AuthChange::Restored
                    });
                }
            }
        }

        if self.state != from {
            log::info!("Connectivity {from} -> {}", self.state);
            observation.transition = Some(Transition {
                from,
                to: self.state,
            });
        }
        observation
    }

    /// Missed events were fetched; RECOVERING -> CONNECTED.
    /// Returns `None` when not recovering.
    pub fn complete_recovery(&mut self, fetched: usize) -> Option<Transition> {
        if self.state != ConnectivityState::Recovering {
            return None;
        }
        log::info!("Recovery complete, {fetched} event(s) arrived during the outage");
        self.state = ConnectivityState::Connected;
        Some(Transition {
            from: ConnectivityState::Recovering,
            to: ConnectivityState::Connected,
        })
    }

    /// Delay before the next probe in the current state
    #[must_use]
    pub fn next_probe_delay(&self) -> Duration {
        let base = self.config.base_backoff_secs;
        let max = self.config.max_backoff_secs;
        let secs = match self.state {
            ConnectivityState::Connected => self.config.probe_interval_secs,
            ConnectivityState::Degraded(n) => {
                let factor = 1u64.checked_shl(n.saturating_sub(1)).unwrap_or(u64::MAX);
                base.saturating_mul(factor).min(max)
            }
            ConnectivityState::Lost => max,
            ConnectivityState::Recovering => base,
        };
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
    }

    fn monitor() -> ConnectivityMonitor {
        ConnectivityMonitor::new(ConnectivityConfig {
            probe_interval_secs: 60,
            base_backoff_secs: 5,
            max_backoff_secs: 60,
            max_retries: 3,
        })
    }

    fn fail() -> ProbeResult {
        ProbeResult::Failed("timeout".to_string())
    }

    #[test]
    fn test_failures_degrade_then_lose() {
        let mut m = monitor();
        let states: Vec<_> = (0..5)
            .map(|_| {
                m.observe(&fail(), now());
                m.state()
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectivityState::Degraded(1),
                ConnectivityState::Degraded(2),
                ConnectivityState::Degraded(3),
                ConnectivityState::Lost,
                ConnectivityState::Lost,
            ]
        );
        assert_eq!(m.outage_started(), Some(now()));
    }

    #[test]
    fn test_repeated_loss_reports_one_transition() {
        let mut m = monitor();
        let transitions = (0..8)
            .filter_map(|_| m.observe(&fail(), now()).transition)
            .filter(|t| t.to == ConnectivityState::Lost)
            .count();
        assert_eq!(transitions, 1);
    }

    #[test]
    fn test_degraded_recovers_directly() {
        let mut m = monitor();
        m.observe(&fail(), now());
        let obs = m.observe(&ProbeResult::Healthy, now());
        assert_eq!(
            obs.transition,
            Some(Transition {
                from: ConnectivityState::Degraded(1),
                to: ConnectivityState::Connected
            })
        );
    }

    #[test]
    fn test_lost_goes_through_recovering() {
        let mut m = monitor();
        for _ in 0..4 {
            m.observe(&fail(), now());
        }
        assert_eq!(m.state(), ConnectivityState::Lost);
        assert!(!m.mail_available());

        m.observe(&ProbeResult::Healthy, now());
        assert_eq!(m.state(), ConnectivityState::Recovering);
        assert!(!m.mail_available());

        assert_eq!(
            m.complete_recovery(3).map(|t| t.to),
            Some(ConnectivityState::Connected)
        );
        assert!(m.complete_recovery(0).is_none());
        assert!(m.mail_available());
    }

    #[test]
    fn test_failure_while_recovering_is_lost_again() {
        let mut m = monitor();
        for _ in 0..4 {
            m.observe(&fail(), now());
        }
        m.observe(&ProbeResult::Healthy, now());
        m.observe(&fail(), now());
        assert_eq!(m.state(), ConnectivityState::Lost);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let mut m = monitor();
        assert_eq!(m.next_probe_delay(), Duration::from_secs(60));

        let mut delays = Vec::new();
        for _ in 0..4 {
            m.observe(&fail(), now());
            delays.push(m.next_probe_delay().as_secs());
        }
        assert_eq!(delays, vec![5, 10, 20, 60]);

        m.observe(&ProbeResult::Healthy, now());
        assert_eq!(m.next_probe_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_auth_signals_are_reported_once() {
        let mut m = monitor();
        let first = m.observe(&ProbeResult::AuthExpired, now());
        assert_eq!(first.auth, Some(AuthChange::Expired));
        assert!(first.transition.is_none());
        assert_eq!(m.state(), ConnectivityState::Connected);
        assert!(!m.mail_available());

        assert_eq!(m.observe(&ProbeResult::AuthExpired, now()).auth, None);
        assert_eq!(
            m.observe(&ProbeResult::Healthy, now()).auth,
            Some(AuthChange::Restored)
        );
        assert!(m.mail_available());
    }
}
