use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

use crate::events::EventId;

/// Unique reminder identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReminderId(Uuid);

impl ReminderId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReminderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReminderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduled follow-up. The label keeps it speakable after its email is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: ReminderId,
    pub target_event_id: Option<EventId>,
    pub label: String,
    pub fire_at: DateTime<Local>,
}

/// What the conversation is currently about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topic {
    Email {
        event_id: EventId,
        sender: String,
        subject: String,
    },
    Reminder {
        reminder_id: ReminderId,
        label: String,
    },
}

impl Topic {
    /// Spoken description, e.g. "the email from Ana about Lunch"
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Email {
                sender, subject, ..
            } => format!("the email from {sender} about {subject}"),
            Self::Reminder { label, .. } => format!("your reminder about {label}"),
        }
    }

    #[must_use]
    pub fn event_id(&self) -> Option<&EventId> {
        match self {
            Self::Email { event_id, .. } => Some(event_id),
            Self::Reminder { .. } => None,
        }
    }
}

/// How a turn was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOrigin {
    ActivationTrigger,
    ProactiveInterrupt,
    Reminder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Abandoned,
    TimedOut,
}

/// History entry for a closed turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: u64,
    pub origin: TurnOrigin,
    pub opened_at: DateTime<Local>,
    pub closed_at: DateTime<Local>,
    pub topic: Option<String>,
    pub outcome: TurnOutcome,
}

/// Dialogue state that survives interruptions and restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub active_topic: Option<Topic>,
    /// Always sorted ascending by `fire_at`
    pub pending_reminders: Vec<Reminder>,
    pub history: VecDeque<TurnRecord>,
}

impl ConversationContext {
    /// Insert keeping `pending_reminders` sorted; equal times keep insertion order
    pub fn insert_reminder(&mut self, reminder: Reminder) {
        let at = self
            .pending_reminders
            .partition_point(|r| r.fire_at <= reminder.fire_at);
        self.pending_reminders.insert(at, reminder);
    }

    pub fn remove_reminder(&mut self, id: ReminderId) -> Option<Reminder> {
        let index = self.pending_reminders.iter().position(|r| r.id == id)?;
        Some(self.pending_reminders.remove(index))
    }

    /// Append to history, evicting the oldest entries beyond `depth`
    pub fn push_history(&mut self, record: TurnRecord, depth: usize) {
        self.history.push_back(record);
        self.trim_history(depth);
    }

    pub fn trim_history(&mut self, depth: usize) {
        while self.history.len() > depth {
            self.history.pop_front();
        }
    }

    /// A pending reminder refers to the active topic
    #[must_use]
    pub fn has_pending_follow_up(&self) -> bool {
        match &self.active_topic {
            Some(Topic::Email { event_id, .. }) => self
                .pending_reminders
                .iter()
                .any(|r| r.target_event_id.as_ref() == Some(event_id)),
            Some(Topic::Reminder { reminder_id, .. }) => {
                self.pending_reminders.iter().any(|r| r.id == *reminder_id)
            }
            None => false,
        }
    }

    /// Restore the sortedness and depth invariants on a loaded snapshot
    pub fn normalize(&mut self, history_depth: usize) {
        self.pending_reminders.sort_by_key(|r| r.fire_at);
        self.trim_history(history_depth);
        if let Some(Topic::Reminder { reminder_id, .. }) = &self.active_topic {
            let id = *reminder_id;
            if !self.pending_reminders.iter().any(|r| r.id == id) {
                self.active_topic = None;
            }
        }
    }
}
