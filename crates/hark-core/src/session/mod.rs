//! Multi-turn conversation state: open turn, paused turns and dialogue context.
//!
//! Turn lifecycle: IDLE -> AWAITING_INTENT -> PROCESSING -> RESPONDING ->
//! AWAITING_INTENT ... -> IDLE. A proactive interrupt pushes the open turn onto
//! the paused stack together with the active topic; ending the nested turn pops
//! it and restores that topic.

mod context;

pub use context::{
    ConversationContext, Reminder, ReminderId, Topic, TurnOrigin, TurnOutcome, TurnRecord,
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::collaborators::EffectRequest;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{ClassifiedEvent, EventId, PriorityTier};
use crate::intent::{EmailTarget, Intent};
use crate::ledger::InboxLedger;

/// Names listed individually in a "who emailed" summary
const SUMMARY_NAME_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnHandle {
    id: u64,
}

impl TurnHandle {
    #[must_use]
    pub const fn id(self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingIntent,
    Processing,
    Responding,
}

/// Whether the turn stays open after the response is spoken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    End,
}

/// Text to speak plus the side effects to perform
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub text: String,
    pub effects: Vec<EffectRequest>,
    pub disposition: Disposition,
}

impl Response {
    fn say(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            effects: Vec::new(),
            disposition: Disposition::Continue,
        }
    }

    fn with_effect(mut self, effect: EffectRequest) -> Self {
        self.effects.push(effect);
        self
    }

    fn ending(mut self) -> Self {
        self.disposition = Disposition::End;
        self
    }
}

/// A paused turn came back to the top of the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeNotice {
    pub turn: TurnHandle,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnEnd {
    pub resumed: Option<ResumeNotice>,
}

/// Result of an utterance that mapped to no intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnclearOutcome {
    Retry {
        attempt: u32,
        limit: u32,
        prompt: String,
    },
    Abandoned {
        text: String,
        resumed: Option<ResumeNotice>,
    },
}

/// What housekeeping did to an idle session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleExpiry {
    /// The open turn timed out. A paused turn beneath it comes back.
    TurnTimedOut { resumed: Option<ResumeNotice> },
    /// Topic and history were discarded after a long idle period
    ContextReset,
}

#[derive(Debug, Clone)]
struct OpenTurn {
    handle: TurnHandle,
    origin: TurnOrigin,
    state: SessionState,
    opened_at: DateTime<Local>,
    last_activity: DateTime<Local>,
    unclear_attempts: u32,
}

#[derive(Debug, Clone)]
struct PausedTurn {
    turn: OpenTurn,
    topic: Option<Topic>,
}

pub struct ConversationSession {
    config: SessionConfig,
    context: ConversationContext,
    current: Option<OpenTurn>,
    paused: Vec<PausedTurn>,
    next_turn_id: u64,
    idle_since: Option<DateTime<Local>>,
}

impl ConversationSession {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            context: ConversationContext::default(),
            current: None,
            paused: Vec::new(),
            next_turn_id: 1,
            idle_since: None,
        }
    }

    // ==================== Accessors ====================

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.current
            .as_ref()
            .map_or(SessionState::Idle, |turn| turn.state)
    }

    #[must_use]
    pub fn current_turn(&self) -> Option<TurnHandle> {
        self.current.as_ref().map(|turn| turn.handle)
    }

    #[must_use]
    pub fn current_origin(&self) -> Option<TurnOrigin> {
        self.current.as_ref().map(|turn| turn.origin)
    }

    /// Whether a proactive interrupt would open a turn now
    #[must_use]
    pub fn has_interrupt_room(&self) -> bool {
        self.current.is_none() || self.paused.len() < self.config.max_interrupt_depth
    }

    #[must_use]
    pub const fn context(&self) -> &ConversationContext {
        &self.context
    }

    #[must_use]
    pub fn paused_depth(&self) -> usize {
        self.paused.len()
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Apply a reloaded session config. Shrinking `history_depth` evicts
    /// the oldest entries immediately.
    pub fn set_config(&mut self, config: SessionConfig) {
        self.context.trim_history(config.history_depth);
        self.config = config;
    }

    /// Load a persisted context. Email topics not present in `ledger` are dropped.
    pub fn restore_context(&mut self, mut context: ConversationContext, ledger: &InboxLedger) {
        context.normalize(self.config.history_depth);
        if context
            .active_topic
            .as_ref()
            .and_then(Topic::event_id)
            .is_some_and(|id| !ledger.contains(id))
        {
            context.active_topic = None;
        }
        log::info!(
            "Restored conversation context: {} reminder(s), {} history entries",
            context.pending_reminders.len(),
            context.history.len()
        );
        self.context = context;
    }

    // ==================== Turn lifecycle ====================

    /// Open a turn.
    ///
    /// A trigger while a turn is open keeps that turn. A proactive interrupt
    /// pauses the open turn and nests a new one, up to `max_interrupt_depth`.
    ///
    /// # Errors
    ///
    /// `NestingLimit` when an interrupt would exceed the nesting bound,
    /// `TurnInProgress` when a reminder turn is requested mid-turn
    pub fn begin_turn(
        &mut self,
        origin: TurnOrigin,
        now: DateTime<Local>,
    ) -> Result<TurnHandle, SessionError> {
        if let Some(open) = self.current.as_mut() {
            match origin {
                TurnOrigin::ActivationTrigger => {
                    open.last_activity = now;
                    return Ok(open.handle);
                }
                TurnOrigin::Reminder => return Err(SessionError::TurnInProgress),
                TurnOrigin::ProactiveInterrupt => {
                    let limit = self.config.max_interrupt_depth;
                    if self.paused.len() >= limit {
                        return Err(SessionError::NestingLimit { limit });
                    }
                }
            }
        }

        if let Some(turn) = self.current.take() {
            log::debug!("Pausing turn {} for an interrupt", turn.handle.id);
            self.paused.push(PausedTurn {
                turn,
                topic: self.context.active_topic.clone(),
            });
        }

        let handle = TurnHandle {
            id: self.next_turn_id,
        };
        self.next_turn_id += 1;
        self.current = Some(OpenTurn {
            handle,
            origin,
            state: SessionState::AwaitingIntent,
            opened_at: now,
            last_activity: now,
            unclear_attempts: 0,
        });
        self.idle_since = None;
        log::debug!("Opened turn {} ({origin:?})", handle.id);
        Ok(handle)
    }

    /// Speech arrived for the open turn
    ///
    /// # Errors
    ///
    /// Fails if `turn` is not the open turn
    pub fn start_processing(
        &mut self,
        turn: TurnHandle,
        now: DateTime<Local>,
    ) -> Result<(), SessionError> {
        let open = self.open_turn_mut(turn)?;
        open.state = SessionState::Processing;
        open.last_activity = now;
        Ok(())
    }

    /// The response for `turn` finished playing
    ///
    /// # Errors
    ///
    /// Fails if `turn` is not the open turn
    pub fn finish_response(
        &mut self,
        turn: TurnHandle,
        now: DateTime<Local>,
    ) -> Result<(), SessionError> {
        let open = self.open_turn_mut(turn)?;
        open.state = SessionState::AwaitingIntent;
        open.last_activity = now;
        Ok(())
    }

    /// Close `turn`, record it in history and resume a paused turn if any.
    /// The active topic is kept only while a pending reminder refers to it.
    ///
    /// # Errors
    ///
    /// Fails if `turn` is not the open turn
    pub fn end_turn(
        &mut self,
        turn: TurnHandle,
        outcome: TurnOutcome,
        now: DateTime<Local>,
    ) -> Result<TurnEnd, SessionError> {
        self.open_turn_mut(turn)?;
        self.close_current(outcome, now);
        if !self.context.has_pending_follow_up() {
            self.context.active_topic = None;
        }
        Ok(TurnEnd {
            resumed: self.resume_paused(now),
        })
    }

    /// Count an utterance that mapped to no intent. Reaching the attempt
    /// limit abandons the turn and clears the topic.
    ///
    /// # Errors
    ///
    /// Fails if `turn` is not the open turn
    pub fn record_unclear(
        &mut self,
        turn: TurnHandle,
        now: DateTime<Local>,
    ) -> Result<UnclearOutcome, SessionError> {
        let limit = self.config.unclear_attempt_limit;
        let open = self.open_turn_mut(turn)?;
        open.unclear_attempts += 1;
        open.last_activity = now;
        let attempt = open.unclear_attempts;

        if attempt < limit {
            open.state = SessionState::AwaitingIntent;
            return Ok(UnclearOutcome::Retry {
                attempt,
                limit,
                prompt: "Sorry, I didn't catch that. Could you say it again?".to_string(),
            });
        }

        log::info!("Abandoning turn {} after {attempt} unclear attempt(s)", turn.id);
        self.close_current(TurnOutcome::Abandoned, now);
        self.context.active_topic = None;
        Ok(UnclearOutcome::Abandoned {
            text: "Sorry, I still didn't get that. Let's try again later.".to_string(),
            resumed: self.resume_paused(now),
        })
    }

    /// End a turn that saw no activity for the idle timeout, resuming the turn
    /// it interrupted, and forget topic and history after a long idle period.
    /// Reminders are never discarded.
    pub fn expire_idle(&mut self, now: DateTime<Local>) -> Option<IdleExpiry> {
        if let Some(open) = &self.current {
            if now - open.last_activity < self.config.turn_idle_timeout() {
                return None;
            }
            log::info!("Turn {} idle, closing it", open.handle.id);
            self.close_current(TurnOutcome::TimedOut, now);
            if !self.context.has_pending_follow_up() {
                self.context.active_topic = None;
            }
            return Some(IdleExpiry::TurnTimedOut {
                resumed: self.resume_paused(now),
            });
        }

        let idle_since = self.idle_since?;
        let has_state = self.context.active_topic.is_some() || !self.context.history.is_empty();
        if has_state && now - idle_since >= self.config.context_reset_after() {
            log::info!("Session idle since {idle_since}, resetting conversation context");
            self.context.active_topic = None;
            self.context.history.clear();
            return Some(IdleExpiry::ContextReset);
        }
        None
    }

    // ==================== Context maintenance ====================

    /// An event left the ledger; drop every topic that points at it
    pub fn forget_event(&mut self, id: &EventId) {
        let points_at =
            |topic: &Option<Topic>| topic.as_ref().and_then(Topic::event_id) == Some(id);
        if points_at(&self.context.active_topic) {
            self.context.active_topic = None;
        }
        for paused in &mut self.paused {
            if points_at(&paused.topic) {
                paused.topic = None;
            }
        }
    }

    /// Remove a reminder that fired or was cancelled
    pub fn take_reminder(&mut self, id: ReminderId) -> Option<Reminder> {
        let reminder = self.context.remove_reminder(id)?;
        let points_at = |topic: &Option<Topic>| {
            matches!(topic, Some(Topic::Reminder { reminder_id, .. }) if *reminder_id == id)
        };
        if points_at(&self.context.active_topic) {
            self.context.active_topic = None;
        }
        for paused in &mut self.paused {
            if points_at(&paused.topic) {
                paused.topic = None;
            }
        }
        Some(reminder)
    }

    // ==================== Responses ====================

    /// Offer a newly arrived (or pending) email in `turn`
    ///
    /// # Errors
    ///
    /// Fails if `turn` is not the open turn
    pub fn announce_event(
        &mut self,
        turn: TurnHandle,
        classified: &ClassifiedEvent,
        pending_after: usize,
        now: DateTime<Local>,
    ) -> Result<Response, SessionError> {
        self.responding(turn, now)?;
        let event = &classified.event;
        let kind = match classified.tier {
            PriorityTier::Priority => "Priority email",
            PriorityTier::Regular | PriorityTier::Filtered => "New email",
        };
        let mut text = format!(
            "{kind} from {}: {}. Want me to read it?",
            event.sender_name(),
            event.subject
        );
        if pending_after > 0 {
            text.push_str(&format!(" {pending_after} more waiting."));
        }
        self.context.active_topic = Some(email_topic(classified));
        Ok(Response::say(text))
    }

    /// Speak a fired reminder, returning to its email when still known
    ///
    /// # Errors
    ///
    /// Fails if `turn` is not the open turn
    pub fn announce_reminder(
        &mut self,
        turn: TurnHandle,
        reminder: &Reminder,
        ledger: &InboxLedger,
        now: DateTime<Local>,
    ) -> Result<Response, SessionError> {
        self.responding(turn, now)?;
        let email = reminder
            .target_event_id
            .as_ref()
            .and_then(|id| ledger.get(id));
        let text = match email {
            Some(classified) => {
                self.context.active_topic = Some(email_topic(classified));
                format!("Reminder: {}. Want me to read it again?", reminder.label)
            }
            None => format!("Reminder: {}.", reminder.label),
        };
        Ok(Response::say(text))
    }

    /// Apply a recognized intent to the open turn
    ///
    /// # Errors
    ///
    /// Fails if `turn` is not the open turn
    pub fn apply_intent(
        &mut self,
        turn: TurnHandle,
        intent: &Intent,
        ledger: &mut InboxLedger,
        now: DateTime<Local>,
    ) -> Result<Response, SessionError> {
        let open = self.open_turn_mut(turn)?;
        open.state = SessionState::Processing;
        open.last_activity = now;
        open.unclear_attempts = 0;

        let response = match intent {
            Intent::ReadEmail(target) => self.read_email(target, ledger),
            Intent::DraftReply { body } => self.draft_reply(body.as_deref(), ledger),
            Intent::SetReminder(when) => self.set_reminder(when.resolve(now)),
            Intent::WhoEmailed { include_filtered } => self.who_emailed(*include_filtered, ledger),
            Intent::Resume => self.resume_request(),
            Intent::StartOver => {
                self.start_over();
                Response::say("Okay, starting over.")
            }
            Intent::Reauthorize => Response::say("Opening the mail sign-in flow.")
                .with_effect(EffectRequest::BeginReauth),
            Intent::EndConversation => Response::say("Okay, talk to you later.").ending(),
        };

        self.responding(turn, now)?;
        Ok(response)
    }

    /// Clear topic, history and paused turns. Pending reminders stay.
    pub fn start_over(&mut self) {
        log::info!("Starting over, dropping {} paused turn(s)", self.paused.len());
        self.paused.clear();
        self.context.active_topic = None;
        self.context.history.clear();
    }

    fn read_email(&mut self, target: &EmailTarget, ledger: &mut InboxLedger) -> Response {
        let found = match target {
            EmailTarget::Current => self
                .context
                .active_topic
                .as_ref()
                .and_then(Topic::event_id)
                .and_then(|id| ledger.get(id)),
            EmailTarget::Next => ledger.next_undelivered(),
            EmailTarget::Latest => ledger.latest(),
            EmailTarget::FromSender(name) => ledger.find_from_sender(name),
        }
        .cloned();

        let Some(classified) = found else {
            return Response::say(match target {
                EmailTarget::Current => {
                    "There's no email selected. Say \"read the next one\" to hear new mail."
                        .to_string()
                }
                EmailTarget::Next => "You have no new email.".to_string(),
                EmailTarget::Latest => "There's no email yet.".to_string(),
                EmailTarget::FromSender(name) => format!("I couldn't find an email from {name}."),
            });
        };

        ledger.mark_delivered(classified.id());
        self.context.active_topic = Some(email_topic(&classified));
        Response::say(format!(
            "Email from {}, subject: {}.",
            classified.event.sender_name(),
            classified.event.subject
        ))
    }

    fn draft_reply(&self, body: Option<&str>, ledger: &InboxLedger) -> Response {
        let Some(Topic::Email { event_id, sender, .. }) = &self.context.active_topic else {
            return Response::say("Which email should I reply to?");
        };
        if !ledger.contains(event_id) {
            return Response::say("That email is no longer available.");
        }
        match body {
            Some(body) => Response::say(format!("Drafted a reply to {sender}.")).with_effect(
                EffectRequest::DraftReply {
                    event_id: event_id.clone(),
                    body: body.to_string(),
                },
            ),
            None => Response::say("What would you like to say?"),
        }
    }

    fn set_reminder(&mut self, fire_at: DateTime<Local>) -> Response {
        let (target_event_id, label) = match &self.context.active_topic {
            Some(Topic::Email {
                event_id,
                sender,
                subject,
            }) => (Some(event_id.clone()), format!("{sender}'s email about {subject}")),
            Some(Topic::Reminder { label, .. }) => (None, label.clone()),
            None => (None, "your reminder".to_string()),
        };
        let reminder = Reminder {
            id: ReminderId::new(),
            target_event_id,
            label: label.clone(),
            fire_at,
        };
        if reminder.target_event_id.is_none() {
            self.context.active_topic = Some(Topic::Reminder {
                reminder_id: reminder.id,
                label: label.clone(),
            });
        }
        self.context.insert_reminder(reminder.clone());
        Response::say(format!(
            "Okay, I'll remind you about {label} at {}.",
            fire_at.format("%H:%M")
        ))
        .with_effect(EffectRequest::Schedule(reminder))
    }

    fn who_emailed(&mut self, include_filtered: bool, ledger: &mut InboxLedger) -> Response {
        let listed: Vec<ClassifiedEvent> = ledger
            .undelivered(include_filtered)
            .into_iter()
            .cloned()
            .collect();
        let hidden = if include_filtered {
            0
        } else {
            ledger.pending_count(PriorityTier::Filtered)
        };

        let mut text = if listed.is_empty() {
            "No new email.".to_string()
        } else {
            let names: Vec<&str> = listed
                .iter()
                .take(SUMMARY_NAME_LIMIT)
                .map(|c| c.event.sender_name())
                .collect();
            let mut summary = format!(
                "You have {} new message{}: from {}",
                listed.len(),
                plural(listed.len()),
                names.join(", from ")
            );
            if listed.len() > SUMMARY_NAME_LIMIT {
                summary.push_str(&format!(", and {} more", listed.len() - SUMMARY_NAME_LIMIT));
            }
            summary.push('.');
            summary
        };
        if hidden > 0 {
            text.push_str(&format!(
                " {hidden} filtered message{} not included.",
                plural(hidden)
            ));
        }

        for classified in &listed {
            ledger.mark_delivered(classified.id());
        }
        if let Some(first) = listed.first() {
            self.context.active_topic = Some(email_topic(first));
        }
        Response::say(text)
    }

    fn resume_request(&self) -> Response {
        if !self.paused.is_empty() {
            return Response::say("Okay.").ending();
        }
        match &self.context.active_topic {
            Some(topic) => Response::say(format!("We were talking about {}.", topic.describe())),
            None => Response::say("There's nothing to go back to."),
        }
    }

    // ==================== Internals ====================

    fn open_turn_mut(&mut self, turn: TurnHandle) -> Result<&mut OpenTurn, SessionError> {
        match self.current.as_mut() {
            None => Err(SessionError::NoOpenTurn),
            Some(open) if open.handle != turn => Err(SessionError::StaleTurn {
                given: turn.id,
                open: open.handle.id,
            }),
            Some(open) => Ok(open),
        }
    }

    fn responding(&mut self, turn: TurnHandle, now: DateTime<Local>) -> Result<(), SessionError> {
        let open = self.open_turn_mut(turn)?;
        open.state = SessionState::Responding;
        open.last_activity = now;
        Ok(())
    }

    /// Record the open turn in history and leave no turn open
    fn close_current(&mut self, outcome: TurnOutcome, now: DateTime<Local>) {
        let Some(turn) = self.current.take() else {
            return;
        };
        let record = TurnRecord {
            turn_id: turn.handle.id,
            origin: turn.origin,
            opened_at: turn.opened_at,
            closed_at: now,
            topic: self.context.active_topic.as_ref().map(Topic::describe),
            outcome,
        };
        self.context.push_history(record, self.config.history_depth);
        self.idle_since = Some(now);
        log::debug!("Closed turn {} ({outcome:?})", turn.handle.id);
    }

    fn resume_paused(&mut self, now: DateTime<Local>) -> Option<ResumeNotice> {
        let PausedTurn { mut turn, topic } = self.paused.pop()?;
        turn.state = SessionState::AwaitingIntent;
        turn.last_activity = now;
        turn.unclear_attempts = 0;
        let handle = turn.handle;
        self.current = Some(turn);
        self.idle_since = None;

        let text = match &topic {
            Some(topic) => format!("Back to what we were doing: {}.", topic.describe()),
            None => "Back to what we were doing.".to_string(),
        };
        self.context.active_topic = topic;
        log::debug!("Resumed turn {}", handle.id);
        Some(ResumeNotice { turn: handle, text })
    }
}

fn email_topic(classified: &ClassifiedEvent) -> Topic {
    Topic::Email {
        event_id: classified.event.id.clone(),
        sender: classified.event.sender_name().to_string(),
        subject: classified.event.subject.clone(),
    }
}

const fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}
