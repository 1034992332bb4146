
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveTime};
use regex::{Captures, Regex};

use crate::collaborators::{SpeechUnderstanding, Utterance};
use crate::error::IntentUnclear;

/// Outcome of speech understanding for one utterance
pub type Recognition = Result<Intent, IntentUnclear>;

/// Which email a read request refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailTarget {
    /// The email currently under discussion
    Current,
    /// Oldest email not yet delivered
    Next,
    /// Most recent non-filtered email
    Latest,
    /// Most recent email whose sender contains the text
    FromSender(String),
}

/// When a reminder should fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderWhen {
    In(Duration),
    /// Next occurrence of this wall-clock time
    At(NaiveTime),
}

impl ReminderWhen {
    /// Absolute fire time relative to `now`
    #[must_use]
    pub fn resolve(self, now: DateTime<Local>) -> DateTime<Local> {
        match self {
            Self::In(delay) => now + delay,
            Self::At(time) => {
                let today = now.date_naive().and_time(time);
                let candidate = today
                    .and_local_timezone(Local)
                    .earliest()
                    .unwrap_or(now + Duration::days(1));
                if candidate > now {
                    candidate
                } else {
                    (today + Duration::days(1))
                        .and_local_timezone(Local)
                        .earliest()
                        .unwrap_or(now + Duration::days(1))
                }
            }
        }
    }
}

/// Closed set of things the user can ask for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    ReadEmail(EmailTarget),
    DraftReply { body: Option<String> },
    SetReminder(ReminderWhen),
    WhoEmailed { include_filtered: bool },
    Resume,
    StartOver,
    Reauthorize,
    EndConversation,
}

impl Intent {
    /// Intents that need a live, authorized mail channel
    #[must_use]
    pub const fn requires_mail(&self) -> bool {
        matches!(self, Self::ReadEmail(_) | Self::DraftReply { .. })
    }

    /// Short name for log lines
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ReadEmail(_) => "read_email",
            Self::DraftReply { .. } => "draft_reply",
            Self::SetReminder(_) => "set_reminder",
            Self::WhoEmailed { .. } => "who_emailed",
            Self::Resume => "resume",
            Self::StartOver => "start_over",
            Self::Reauthorize => "reauthorize",
            Self::EndConversation => "end_conversation",
        }
    }
}

/// Rule-based speech understanding over transcripts.
/// Rules are checked in order; the first match wins.
pub struct TranscriptRecognizer {
    start_over: Regex,
    resume: Regex,
    reauthorize: Regex,
    end_conversation: Regex,
    who_emailed: Regex,
    include_filtered: Regex,
    remind_in: Regex,
    remind_at: Regex,
    reply: Regex,
    read_from: Regex,
    read_current: Regex,
    read_latest: Regex,
    read_any: Regex,
}

impl TranscriptRecognizer {
    /// Compile the recognition rules
    ///
    /// # Errors
    ///
    /// Returns an error if any rule pattern fails to compile
    pub fn new() -> Result<Self> {
        Ok(Self {
            start_over: Regex::new(
                r"(?i)\b(start over|start again|forget (it|that|everything)|reset)\b",
            )?,
            resume: Regex::new(r"(?i)\b(go back|resume|where were we|never ?mind|back to what)\b")?,
            reauthorize: Regex::new(r"(?i)\b(reconnect|sign (me )?in|log (me )?in|re-?auth\w*)\b")?,
            end_conversation: Regex::new(
                r"(?i)\b(goodbye|bye|that'?s all|that is all|stop listening|thanks,? that'?s it)\b",
            )?,
            who_emailed: Regex::new(
                r"(?i)\b(who (has )?(e-?mailed|emailed|written|wrote)|any (new )?(mail|e-?mails?|messages)|what'?s new)\b",
            )?,
            include_filtered: Regex::new(r"(?i)\b(filtered|everything|all of them|including)\b")?,
            remind_in: Regex::new(
                r"(?i)\bremind me\b.*?\bin (\d{1,3}|an?) (minutes?|mins?|hours?)\b",
            )?,
            remind_at: Regex::new(
                r"(?i)\bremind me\b.*?\bat (\d{1,2})(?::(\d{2}))?\s*(am|pm|a\.m\.|p\.m\.)?",
            )?,
            reply: Regex::new(
                r"(?i)\b(reply|respond|answer|write back)\b(?:.*?\b(?:saying|that)\b\s+(.+))?",
            )?,
            read_from: Regex::new(r"(?i)\bread\b.*?\bfrom ([\w.@'-]+)")?,
            read_current: Regex::new(r"(?i)\bread (it|that|this)( one)?\b|\byes,? read\b")?,
            read_latest: Regex::new(r"(?i)\bread\b.*?\b(latest|last|newest|most recent)\b")?,
            read_any: Regex::new(r"(?i)\b(read|next)\b")?,
        })
    }

    /// Map a transcript to an intent
    ///
    /// # Errors
    ///
    /// Returns `IntentUnclear` when no rule matches
    pub fn parse(&self, transcript: &str) -> Recognition {
        let text = transcript.trim();
        let unclear = || IntentUnclear {
            heard: text.to_string(),
        };
        if text.is_empty() {
            return Err(unclear());
        }

        let intent = if self.start_over.is_match(text) {
            Intent::StartOver
        } else if self.end_conversation.is_match(text) {
            Intent::EndConversation
        } else if self.reauthorize.is_match(text) {
            Intent::Reauthorize
        } else if let Some(when) = self.parse_reminder(text) {
            Intent::SetReminder(when)
        } else if self.who_emailed.is_match(text) {
            Intent::WhoEmailed {
                include_filtered: self.include_filtered.is_match(text),
            }
        } else if let Some(caps) = self.reply.captures(text) {
            Intent::DraftReply {
                body: caps
                    .get(2)
                    .map(|m| m.as_str().trim().trim_end_matches(['.', '!']).to_string())
                    .filter(|body| !body.is_empty()),
            }
        } else if self.resume.is_match(text) {
            Intent::Resume
        } else if let Some(caps) = self.read_from.captures(text) {
            Intent::ReadEmail(EmailTarget::FromSender(caps[1].trim_end_matches('\'').to_string()))
        } else if self.read_current.is_match(text) {
            Intent::ReadEmail(EmailTarget::Current)
        } else if self.read_latest.is_match(text) {
            Intent::ReadEmail(EmailTarget::Latest)
        } else if self.read_any.is_match(text) {
            Intent::ReadEmail(EmailTarget::Next)
        } else {
            return Err(unclear());
        };

        log::debug!("Recognized '{text}' as {}", intent.name());
        Ok(intent)
    }

    fn parse_reminder(&self, text: &str) -> Option<ReminderWhen> {
        if let Some(caps) = self.remind_in.captures(text) {
            return Self::relative(&caps);
        }
        self.remind_at.captures(text).and_then(|caps| Self::absolute(&caps))
    }

    fn relative(caps: &Captures<'_>) -> Option<ReminderWhen> {
        let amount: i64 = match caps[1].to_lowercase().as_str() {
            "a" | "an" => 1,
            digits => digits.parse().ok()?,
        };
        let unit = caps[2].to_lowercase();
        let delay = if unit.starts_with('h') {
            Duration::hours(amount)
        } else {
            Duration::minutes(amount)
        };
        (amount > 0).then_some(ReminderWhen::In(delay))
    }

    fn absolute(caps: &Captures<'_>) -> Option<ReminderWhen> {
        let mut hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
        let suffix = caps.get(3).map(|m| m.as_str().to_lowercase().replace('.', ""));
        match suffix.as_deref() {
            Some("pm") if hour < 12 => hour += 12,
            Some("am") if hour == 12 => hour = 0,
            _ => {}
        }
        NaiveTime::from_hms_opt(hour, minute, 0).map(ReminderWhen::At)
    }
}

#[async_trait]
impl SpeechUnderstanding for TranscriptRecognizer {
    async fn recognize(&self, utterance: &Utterance) -> Recognition {
        self.parse(&utterance.transcript)
    }
}
