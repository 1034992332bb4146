use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::AssistantConfig;
use crate::connectivity::ProbeResult;
use crate::intent::Recognition;
use crate::session::ReminderId;

/// Mail-provider identifier of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the mail provider filed the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxPlacement {
    Primary,
    Promotions,
    Social,
    Updates,
    Forums,
    Spam,
}

impl InboxPlacement {
    #[must_use]
    pub const fn is_primary(self) -> bool {
        matches!(self, Self::Primary)
    }
}

impl FromStr for InboxPlacement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" | "inbox" => Ok(Self::Primary),
            "promotions" | "promo" => Ok(Self::Promotions),
            "social" => Ok(Self::Social),
            "updates" => Ok(Self::Updates),
            "forums" => Ok(Self::Forums),
            "spam" | "junk" => Ok(Self::Spam),
            other => Err(format!("unknown inbox placement: {other}")),
        }
    }
}

/// A message reported by the mail collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEvent {
    pub id: EventId,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Local>,
    /// Opaque handle the mail collaborator resolves to the message body
    pub body_ref: String,
    pub placement: InboxPlacement,
}

impl InboxEvent {
    /// Primary-inbox message whose body reference is its id
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        received_at: DateTime<Local>,
    ) -> Self {
        let id = EventId::new(id);
        Self {
            body_ref: id.as_str().to_string(),
            id,
            sender: sender.into(),
            subject: subject.into(),
            received_at,
            placement: InboxPlacement::Primary,
        }
    }

    #[must_use]
    pub fn with_placement(mut self, placement: InboxPlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Display name of the sender ("Ana Lima <ana@x.org>" gives "Ana Lima")
    #[must_use]
    pub fn sender_name(&self) -> &str {
        match self.sender.split_once('<') {
            Some((name, _)) if !name.trim().is_empty() => name.trim().trim_matches('"'),
            _ => self.sender.trim(),
        }
    }
}

/// Notification tier assigned by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Priority,
    Regular,
    Filtered,
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Priority => "priority",
            Self::Regular => "regular",
            Self::Filtered => "filtered",
        };
        f.write_str(label)
    }
}

/// An inbox event together with its tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedEvent {
    pub event: InboxEvent,
    pub tier: PriorityTier,
}

impl ClassifiedEvent {
    #[must_use]
    pub fn id(&self) -> &EventId {
        &self.event.id
    }
}

/// What the attention gate allows an event to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionDecision {
    InterruptNow,
    NotifySilentPendingActivation,
    Suppress,
}

/// Everything the orchestrator consumes, funnelled through `submit_event`
#[derive(Debug, Clone)]
pub enum AssistantEvent {
    /// The user's cue phrase was detected
    ActivationTrigger,
    Inbox(InboxEvent),
    /// Result of running an utterance through speech understanding
    Speech(Recognition),
    Probe(ProbeResult),
    ReminderFired(ReminderId),
    ConfigReloaded(Arc<AssistantConfig>),
    Shutdown,
}

impl AssistantEvent {
    /// Short name for log lines
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ActivationTrigger => "activation_trigger",
            Self::Inbox(_) => "inbox",
            Self::Speech(_) => "speech",
            Self::Probe(_) => "probe",
            Self::ReminderFired(_) => "reminder_fired",
            Self::ConfigReloaded(_) => "config_reloaded",
            Self::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_placement_parsing() {
        assert_eq!("Primary".parse::<InboxPlacement>(), Ok(InboxPlacement::Primary));
        assert_eq!("junk".parse::<InboxPlacement>(), Ok(InboxPlacement::Spam));
        assert!("archive".parse::<InboxPlacement>().is_err());
    }

    #[test]
    fn test_sender_name_extraction() {
        let at = Local.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let named = InboxEvent::new("1", "\"Ana Lima\" <ana@example.org>", "Hi", at);
        assert_eq!(named.sender_name(), "Ana Lima");

        let bare = InboxEvent::new("2", "ops@example.org", "Hi", at);
        assert_eq!(bare.sender_name(), "ops@example.org");
    }

    #[test]
    fn test_new_event_defaults_to_primary() {
        let at = Local.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let event = InboxEvent::new("m-1", "a@b.c", "Subject", at);
        assert_eq!(event.placement, InboxPlacement::Primary);
        assert_eq!(event.body_ref, "m-1");

        let promo = event.with_placement(InboxPlacement::Promotions);
        assert!(!promo.placement.is_primary());
    }
}
