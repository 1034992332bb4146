use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::attention::{QuietHoursPolicy, RateLimitConfig};
use crate::classifier::FilterRules;
use crate::error::ConfigError;

/// Get the local data directory for hark.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push("hark");
    Ok(path)
}

/// Default location of the config file
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("config.toml"))
}

/// Conversation tuning. `history_depth` and `turn_idle_timeout_secs` have no
/// built-in defaults and must be present in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub history_depth: usize,
    pub turn_idle_timeout_secs: u64,
    #[serde(default = "default_context_reset_after_secs")]
    pub context_reset_after_secs: u64,
    #[serde(default = "default_unclear_attempt_limit")]
    pub unclear_attempt_limit: u32,
    #[serde(default = "default_max_interrupt_depth")]
    pub max_interrupt_depth: usize,
}

const fn default_context_reset_after_secs() -> u64 {
    1800
}

const fn default_unclear_attempt_limit() -> u32 {
    2
}

const fn default_max_interrupt_depth() -> usize {
    1
}

impl SessionConfig {
    /// Values written by `hark init`
    #[must_use]
    pub const fn recommended() -> Self {
        Self {
            history_depth: 20,
            turn_idle_timeout_secs: 30,
            context_reset_after_secs: default_context_reset_after_secs(),
            unclear_attempt_limit: default_unclear_attempt_limit(),
            max_interrupt_depth: default_max_interrupt_depth(),
        }
    }

    #[must_use]
    pub fn turn_idle_timeout(&self) -> chrono::Duration {
        seconds(self.turn_idle_timeout_secs)
    }

    #[must_use]
    pub fn context_reset_after(&self) -> chrono::Duration {
        seconds(self.context_reset_after_secs)
    }
}

/// Probe cadence and backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub probe_interval_secs: u64,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Consecutive failures tolerated as DEGRADED before declaring LOST
    pub max_retries: u32,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 60,
            base_backoff_secs: 5,
            max_backoff_secs: 300,
            max_retries: 3,
        }
    }
}

/// Side-effect acknowledgment bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub ack_timeout_ms: u64,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 15_000,
        }
    }
}

impl EffectsConfig {
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub poll_interval_secs: u64,
    /// Number of classified events remembered for summaries and re-reads
    pub ledger_capacity: usize,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            ledger_capacity: 500,
        }
    }
}

impl MailConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Immutable configuration snapshot. Reloads replace the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default)]
    pub filters: FilterRules,
    #[serde(default)]
    pub quiet_hours: QuietHoursPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub effects: EffectsConfig,
    #[serde(default)]
    pub mail: MailConfig,
}

impl AssistantConfig {
    /// Config with every section at its default and the given session settings
    #[must_use]
    pub fn with_session(session: SessionConfig) -> Self {
        Self {
            filters: FilterRules::default(),
            quiet_hours: QuietHoursPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            session,
            connectivity: ConnectivityConfig::default(),
            effects: EffectsConfig::default(),
            mail: MailConfig::default(),
        }
    }

    /// Parse and validate a config document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML, misses required keys,
    /// or fails validation
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Write config to a file, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, content).map_err(io_err)?;
        log::info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject values the core cannot operate with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending key
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 9] = [
            (self.session.history_depth > 0, "session.history_depth must be at least 1"),
            (
                self.session.turn_idle_timeout_secs > 0,
                "session.turn_idle_timeout_secs must be positive",
            ),
            (
                self.session.unclear_attempt_limit > 0,
                "session.unclear_attempt_limit must be at least 1",
            ),
            (self.rate_limit.window_secs > 0, "rate_limit.window_secs must be positive"),
            (
                self.connectivity.probe_interval_secs > 0,
                "connectivity.probe_interval_secs must be positive",
            ),
            (
                self.connectivity.base_backoff_secs > 0
                    && self.connectivity.base_backoff_secs <= self.connectivity.max_backoff_secs,
                "connectivity backoff must satisfy 0 < base_backoff_secs <= max_backoff_secs",
            ),
            (self.effects.ack_timeout_ms > 0, "effects.ack_timeout_ms must be positive"),
            (self.mail.poll_interval_secs > 0, "mail.poll_interval_secs must be positive"),
            (self.mail.ledger_capacity > 0, "mail.ledger_capacity must be at least 1"),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(ConfigError::Invalid((*message).to_string())),
            None => Ok(()),
        }
    }

    /// Starter document written by `hark init`
    #[must_use]
    pub fn template() -> String {
        let session = SessionConfig::recommended();
        format!(
            r#"# hark configuration

[filters]
# "name@host" matches one address, "@host" a whole domain
priority_senders = []
# Entries may also be {{ sender = "...", until = "2030-01-01T00:00:00+00:00" }}
ignore_senders = []

[quiet_hours]
enabled = true
start = "22:00"
end = "07:00"

[rate_limit]
max_interrupts = 3
window_secs = 600

[session]
history_depth = {history_depth}
turn_idle_timeout_secs = {idle}
context_reset_after_secs = {reset}
unclear_attempt_limit = {unclear}
max_interrupt_depth = {depth}

[connectivity]
probe_interval_secs = 60
base_backoff_secs = 5
max_backoff_secs = 300
max_retries = 3

[effects]
ack_timeout_ms = 15000

[mail]
poll_interval_secs = 30
ledger_capacity = 500
"#,
            history_depth = session.history_depth,
            idle = session.turn_idle_timeout_secs,
            reset = session.context_reset_after_secs,
            unclear = session.unclear_attempt_limit,
            depth = session.max_interrupt_depth,
        )
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn test_template_parses_and_validates() {
        let config = AssistantConfig::from_toml_str(&AssistantConfig::template()).unwrap();
        assert_eq!(config.session, SessionConfig::recommended());
        assert!(config.quiet_hours.enabled);
        assert_eq!(config.quiet_hours.start, NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        assert_eq!(config.effects.ack_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_session_keys_are_required() {
        let missing_section = "[rate_limit]\nmax_interrupts = 2\n";
        assert!(matches!(
            AssistantConfig::from_toml_str(missing_section),
            Err(ConfigError::Parse(_))
        ));

        let missing_idle = "[session]\nhistory_depth = 5\n";
        assert!(matches!(
            AssistantConfig::from_toml_str(missing_idle),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_optional_sections_default() {
        let config = AssistantConfig::from_toml_str(
            "[session]\nhistory_depth = 5\nturn_idle_timeout_secs = 10\n",
        )
        .unwrap();
        assert_eq!(config.session.unclear_attempt_limit, 2);
        assert_eq!(config.session.max_interrupt_depth, 1);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.connectivity.max_retries, 3);
        assert!(!config.quiet_hours.enabled);
        assert!(config.filters.priority_senders.is_empty());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = AssistantConfig::with_session(SessionConfig::recommended());
        config.session.history_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("history_depth")
        ));

        let mut config = AssistantConfig::with_session(SessionConfig::recommended());
        config.connectivity.base_backoff_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AssistantConfig::with_session(SessionConfig::recommended());
        config.filters.priority_senders.push("boss@work.com".to_string());
        config.quiet_hours = QuietHoursPolicy::new(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        );
        config.save(&path).unwrap();

        let loaded = AssistantConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = AssistantConfig::load(Path::new("/nonexistent/hark/config.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/hark/config.toml"));
    }
}
