use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::connectivity::ProbeResult;
use crate::events::{EventId, InboxEvent};
use crate::intent::Recognition;
use crate::session::Reminder;

/// Notification sounds the core may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundId {
    ArrivalPriority,
    ArrivalRegular,
    Reminder,
}

impl SoundId {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ArrivalPriority => "arrival_priority",
            Self::ArrivalRegular => "arrival_regular",
            Self::Reminder => "reminder",
        }
    }
}

impl fmt::Display for SoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the user said, as transcribed by the speech front end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub transcript: String,
}

impl Utterance {
    #[must_use]
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
        }
    }
}

/// Side effects produced by intent handling, performed by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum EffectRequest {
    Schedule(Reminder),
    DraftReply { event_id: EventId, body: String },
    BeginReauth,
}

/// Speech-output collaborator. Both calls return once playback completed.
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    async fn speak(&self, text: &str) -> Result<()>;

    async fn play_sound(&self, sound: SoundId) -> Result<()>;
}

/// Mail collaborator
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Messages that arrived since the previous poll
    async fn poll_new(&self) -> Result<Vec<InboxEvent>>;

    /// Messages received at or after `since`, used after an outage
    async fn fetch_missed(&self, since: DateTime<Local>) -> Result<Vec<InboxEvent>>;

    async fn draft_reply(&self, event_id: &EventId, body: &str) -> Result<()>;

    /// Start the provider's interactive re-authorization flow
    async fn begin_reauth(&self) -> Result<()>;
}

/// Health check of the mail/auth channel
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> ProbeResult;
}

/// Speech-understanding collaborator
#[async_trait]
pub trait SpeechUnderstanding: Send + Sync {
    async fn recognize(&self, utterance: &Utterance) -> Recognition;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sound_ids_match_wire_names() {
        assert_eq!(SoundId::ArrivalPriority.to_string(), "arrival_priority");
        assert_eq!(SoundId::ArrivalRegular.as_str(), "arrival_regular");
        assert_eq!(
            serde_json::to_string(&SoundId::Reminder).unwrap(),
            "\"reminder\""
        );
    }
}
