//! Top-level coordinator. One task owns the gate, the session, the ledger and
//! the connectivity monitor, and applies events to them one at a time.

mod effects;

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::attention::AttentionGate;
use crate::classifier::classify_event;
use crate::clock::Clock;
use crate::collaborators::{MailSource, SoundId, SpeechOutput};
use crate::config::AssistantConfig;
use crate::connectivity::{AuthChange, ConnectivityMonitor, ConnectivityState, ProbeResult};
use crate::error::AssistantError;
use crate::events::{AssistantEvent, AttentionDecision, ClassifiedEvent, InboxEvent, PriorityTier};
use crate::intent::Recognition;
use crate::ipc::{StatusIpcHandler, StatusSnapshot};
use crate::ledger::{InboxLedger, LedgerInsert};
use crate::persistence::ContextStore;
use crate::reminders::ReminderScheduler;
use crate::session::{
    ConversationContext, ConversationSession, IdleExpiry, ReminderId, SessionState, TurnHandle,
    TurnOrigin, UnclearOutcome,
};

/// Cadence of idle checks, quiet-hours transitions and persistence
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

pub struct Orchestrator {
    config: Arc<AssistantConfig>,
    clock: Arc<dyn Clock>,
    speech: Arc<dyn SpeechOutput>,
    mail: Arc<dyn MailSource>,
    scheduler: ReminderScheduler,
    gate: AttentionGate,
    session: ConversationSession,
    ledger: InboxLedger,
    connectivity: ConnectivityMonitor,
    store: Option<ContextStore>,
    saved_context: Option<ConversationContext>,
    status_board: Option<Arc<StatusIpcHandler>>,
    probe_delay: watch::Sender<Duration>,
    queued_reminders: VecDeque<ReminderId>,
    /// Set from the first LOST of an outage until recovery completes, so a
    /// relapse during RECOVERING stays silent
    lost_announced: bool,
    quiet_active: bool,
    started_at: DateTime<Local>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: Arc<AssistantConfig>,
        clock: Arc<dyn Clock>,
        speech: Arc<dyn SpeechOutput>,
        mail: Arc<dyn MailSource>,
        scheduler: ReminderScheduler,
    ) -> Self {
        let now = clock.now();
        let connectivity = ConnectivityMonitor::new(config.connectivity);
        let (probe_delay, _) = watch::channel(connectivity.next_probe_delay());
        Self {
            gate: AttentionGate::new(),
            session: ConversationSession::new(config.session.clone()),
            ledger: InboxLedger::new(config.mail.ledger_capacity),
            quiet_active: config.quiet_hours.is_quiet_at(now),
            connectivity,
            config,
            clock,
            speech,
            mail,
            scheduler,
            store: None,
            saved_context: None,
            status_board: None,
            probe_delay,
            queued_reminders: VecDeque::new(),
            lost_announced: false,
            started_at: now,
        }
    }

    /// Persist the conversation context through `store`, restoring the last
    /// snapshot and rescheduling its reminders
    #[must_use]
    pub fn with_context_store(mut self, store: ContextStore) -> Self {
        match store.load() {
            Ok(Some(context)) => {
                self.session.restore_context(context, &self.ledger);
                for reminder in &self.session.context().pending_reminders {
                    if let Err(e) = self.scheduler.schedule(reminder) {
                        log::warn!("Failed to reschedule reminder {}: {e}", reminder.id);
                    }
                }
                self.saved_context = Some(self.session.context().clone());
            }
            Ok(None) => log::debug!("No stored conversation context"),
            Err(e) => log::warn!("Failed to load conversation context: {e:#}"),
        }
        self.store = Some(store);
        self
    }

    /// Publish the status board to `handler` after every event
    #[must_use]
    pub fn with_status(mut self, handler: Arc<StatusIpcHandler>) -> Self {
        self.status_board = Some(handler);
        self
    }

    /// Delay the prober should wait before its next probe
    #[must_use]
    pub fn probe_delays(&self) -> watch::Receiver<Duration> {
        self.probe_delay.subscribe()
    }

    #[must_use]
    pub const fn session(&self) -> &ConversationSession {
        &self.session
    }

    #[must_use]
    pub const fn ledger(&self) -> &InboxLedger {
        &self.ledger
    }

    #[must_use]
    pub const fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    #[must_use]
    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    /// Consume events until `Shutdown` or until every producer handle is gone
    pub async fn run(mut self, mut events: mpsc::Receiver<AssistantEvent>) {
        let mut ticker = interval(HOUSEKEEPING_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Orchestrator started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(AssistantEvent::Shutdown) => {
                        log::info!("Shutdown requested");
                        break;
                    }
                    Some(event) => self.handle_event(event).await,
                    None => {
                        log::info!("All event producers closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.housekeeping().await,
            }
        }

        self.persist();
        log::info!("Orchestrator shut down gracefully.");
    }

    /// Apply one event. Never fails: every error degrades to a log line or a
    /// spoken explanation.
    pub async fn handle_event(&mut self, event: AssistantEvent) {
        log::debug!("Handling {} event", event.kind());
        match event {
            AssistantEvent::ActivationTrigger => self.on_trigger().await,
            AssistantEvent::Inbox(event) => self.on_inbox(event).await,
            AssistantEvent::Speech(recognition) => self.on_speech(recognition).await,
            AssistantEvent::Probe(result) => self.on_probe(&result).await,
            AssistantEvent::ReminderFired(id) => self.on_reminder(id).await,
            AssistantEvent::ConfigReloaded(config) => self.on_config(config),
            AssistantEvent::Shutdown => log::debug!("Shutdown is handled by the run loop"),
        }
        self.drain_reminders().await;
        self.after_event().await;
    }

    /// Periodic work: idle expiry, end of quiet hours, queued reminders
    pub async fn housekeeping(&mut self) {
        let now = self.clock.now();
        match self.session.expire_idle(now) {
            Some(IdleExpiry::TurnTimedOut { resumed }) => {
                log::info!("Closed an idle turn");
                if let Some(notice) = resumed {
                    self.speak(&notice.text).await;
                }
            }
            Some(IdleExpiry::ContextReset) => {
                log::info!("Conversation context reset after inactivity");
            }
            None => {}
        }

        let quiet = self.config.quiet_hours.is_quiet_at(now);
        if self.quiet_active && !quiet {
            log::info!("Quiet hours ended");
            self.deliver_deferred_priority().await;
        }
        self.quiet_active = quiet;

        self.drain_reminders().await;
        self.after_event().await;
    }

    /// Current status board
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let now = self.clock.now();
        StatusSnapshot {
            started_at: self.started_at,
            updated_at: now,
            session_state: self.session.state(),
            turn_origin: self.session.current_origin(),
            paused_turns: self.session.paused_depth(),
            connectivity: self.connectivity.state(),
            auth_expired: self.connectivity.auth_expired(),
            quiet_hours_active: self.config.quiet_hours.is_quiet_at(now),
            pending_priority: self.ledger.pending_count(PriorityTier::Priority),
            pending_regular: self.ledger.pending_count(PriorityTier::Regular),
            pending_filtered: self.ledger.pending_count(PriorityTier::Filtered),
            pending_reminders: self.session.context().pending_reminders.len(),
            interrupts_in_window: self
                .gate
                .rate_state()
                .count_in_window(now, self.config.rate_limit.window()),
        }
    }

    // ==================== Event handlers ====================

    async fn on_trigger(&mut self) {
        let now = self.clock.now();
        let was_idle = self.session.state() == SessionState::Idle;
        let turn = match self.session.begin_turn(TurnOrigin::ActivationTrigger, now) {
            Ok(turn) => turn,
            Err(e) => {
                log::warn!("Could not open a turn: {e}");
                return;
            }
        };
        if !was_idle {
            log::debug!("Trigger during turn {}, keeping it", turn.id());
            return;
        }

        if let Some(next) = self.ledger.next_undelivered().cloned() {
            self.offer(turn, &next).await;
        } else {
            self.speak("Yes?").await;
        }
    }

    async fn on_inbox(&mut self, event: InboxEvent) {
        let now = self.clock.now();
        let Some(classified) = self.record(event, now) else {
            return;
        };
        if classified.tier == PriorityTier::Priority && !self.session.has_interrupt_room() {
            log::info!(
                "Interrupt nesting limit reached, priority email {} stays pending",
                classified.id()
            );
            return;
        }

        let verdict = self.gate.decide(
            classified.tier,
            &self.config.quiet_hours,
            &self.config.rate_limit,
            now,
        );
        log::info!(
            "{} email {} from {}: {:?}",
            classified.tier,
            classified.id(),
            classified.event.sender,
            verdict.decision
        );

        if let Some(sound) = verdict.sound {
            self.play(sound).await;
        }
        if verdict.decision == AttentionDecision::InterruptNow {
            self.interrupt_with(&classified).await;
        }
    }

    async fn on_speech(&mut self, recognition: Recognition) {
        let Some(turn) = self.session.current_turn() else {
            log::debug!("Speech outside a turn, ignoring");
            return;
        };
        let now = self.clock.now();
        if let Err(e) = self.session.start_processing(turn, now) {
            log::warn!("Speech for turn {}: {e}", turn.id());
            return;
        }

        let intent = match recognition {
            Ok(intent) => intent,
            Err(unclear) => {
                log::info!("{}", AssistantError::from(unclear));
                self.on_unclear(turn, now).await;
                return;
            }
        };

        if intent.requires_mail() && !self.connectivity.mail_available() {
            let (reason, text) = if self.connectivity.auth_expired() {
                (
                    AssistantError::AuthExpired,
                    "Mail is unavailable until you sign in again. Say \"reconnect\" to start.",
                )
            } else {
                (
                    AssistantError::ConnectivityLost,
                    "Mail is unavailable right now, I'm offline. I'll let you know when it's back.",
                )
            };
            log::info!("Refusing {}: {reason}", intent.name());
            self.speak(text).await;
            if let Err(e) = self.session.finish_response(turn, self.clock.now()) {
                log::warn!("Turn {}: {e}", turn.id());
            }
            return;
        }

        match self
            .session
            .apply_intent(turn, &intent, &mut self.ledger, now)
        {
            Ok(response) => self.deliver(turn, response).await,
            Err(e) => log::warn!("Could not apply {}: {e}", intent.name()),
        }
    }

    async fn on_unclear(&mut self, turn: TurnHandle, now: DateTime<Local>) {
        match self.session.record_unclear(turn, now) {
            Ok(UnclearOutcome::Retry { attempt, limit, prompt }) => {
                log::debug!("Unclear attempt {attempt}/{limit}");
                self.speak(&prompt).await;
            }
            Ok(UnclearOutcome::Abandoned { text, resumed }) => {
                self.speak(&text).await;
                if let Some(notice) = resumed {
                    self.speak(&notice.text).await;
                }
            }
            Err(e) => log::warn!("Unclear speech for turn {}: {e}", turn.id()),
        }
    }

    async fn on_probe(&mut self, result: &ProbeResult) {
        let now = self.clock.now();
        let observation = self.connectivity.observe(result, now);
        self.probe_delay
            .send_replace(self.connectivity.next_probe_delay());

        match observation.auth {
            Some(AuthChange::Expired) => {
                log::warn!("{}", AssistantError::AuthExpired);
                self.speak(concat!(
                    "Your mail sign-in has expired. Say \"reconnect\" to sign in again. ",
                    "I can still help with everything else."
                ))
                .await;
            }
            Some(AuthChange::Restored) => self.speak("Mail access is back.").await,
            None => {}
        }

        if let Some(transition) = observation.transition {
            if transition.to == ConnectivityState::Lost && !self.lost_announced {
                log::warn!("{}", AssistantError::ConnectivityLost);
                self.lost_announced = true;
                self.speak(
                    "I've lost the connection to your mail. I'll keep trying in the background.",
                )
                .await;
            }
        }

        if self.connectivity.state() == ConnectivityState::Recovering {
            self.recover(now).await;
        }
    }

    async fn on_reminder(&mut self, id: ReminderId) {
        if !self
            .session
            .context()
            .pending_reminders
            .iter()
            .any(|r| r.id == id)
        {
            log::debug!("Reminder {id} is no longer pending");
            return;
        }
        if self.session.state() != SessionState::Idle {
            log::info!("Reminder {id} fired mid-turn, queueing it");
        }
        self.queued_reminders.push_back(id);
    }

    fn on_config(&mut self, config: Arc<AssistantConfig>) {
        log::info!("Configuration reloaded");
        self.session.set_config(config.session.clone());
        self.connectivity.set_config(config.connectivity);
        for evicted in self.ledger.set_capacity(config.mail.ledger_capacity) {
            self.session.forget_event(&evicted);
        }
        self.config = config;
        self.probe_delay
            .send_replace(self.connectivity.next_probe_delay());
    }

    // ==================== Flows ====================

    /// Classify and record an event. `None` for malformed or duplicate events.
    fn record(&mut self, event: InboxEvent, now: DateTime<Local>) -> Option<ClassifiedEvent> {
        let classified = match classify_event(event, &self.config.filters, now) {
            Ok(classified) => classified,
            Err(e) => {
                log::warn!("Dropping inbox event: {}", AssistantError::from(e));
                return None;
            }
        };
        match self.ledger.insert(classified.clone()) {
            LedgerInsert::Duplicate => {
                log::debug!("Email {} already recorded", classified.id());
                None
            }
            LedgerInsert::Inserted { evicted } => {
                if let Some(evicted) = evicted {
                    self.session.forget_event(&evicted);
                }
                Some(classified)
            }
        }
    }

    /// Open a proactive turn for `classified`. Callers check nesting room
    /// first; a refusal leaves the event pending.
    async fn interrupt_with(&mut self, classified: &ClassifiedEvent) {
        let now = self.clock.now();
        match self.session.begin_turn(TurnOrigin::ProactiveInterrupt, now) {
            Ok(turn) => self.offer(turn, classified).await,
            Err(e) => log::info!("{e}; email {} stays pending", classified.id()),
        }
    }

    /// Announce an email in `turn`. Offering counts as delivery.
    async fn offer(&mut self, turn: TurnHandle, classified: &ClassifiedEvent) {
        self.ledger.mark_delivered(classified.id());
        let pending_after = self.ledger.undelivered(false).len();
        let now = self.clock.now();
        match self
            .session
            .announce_event(turn, classified, pending_after, now)
        {
            Ok(response) => self.deliver(turn, response).await,
            Err(e) => log::warn!("Could not announce {}: {e}", classified.id()),
        }
    }

    /// Fetch what arrived during the outage, queue it without interrupting
    /// and announce the count
    async fn recover(&mut self, now: DateTime<Local>) {
        let since = self.connectivity.outage_started().unwrap_or(now);
        let Some(missed) = self.fetch_missed(since).await else {
            log::warn!("Missed-mail fetch failed, staying in recovery");
            return;
        };

        let recorded = missed
            .into_iter()
            .filter_map(|event| self.record(event, now))
            .count();
        if self.connectivity.complete_recovery(recorded).is_none() {
            return;
        }
        self.lost_announced = false;
        self.probe_delay
            .send_replace(self.connectivity.next_probe_delay());

        let text = match recorded {
            0 => "Connection restored. No new messages arrived while I was offline.".to_string(),
            1 => "Connection restored. 1 new message arrived while I was offline.".to_string(),
            n => format!("Connection restored. {n} new messages arrived while I was offline."),
        };
        self.speak(&text).await;
    }

    /// At the end of quiet hours the oldest deferred PRIORITY email interrupts,
    /// budget and nesting permitting. Its announcement counts the rest, which
    /// wait for a trigger rather than stacking interrupts back to back.
    async fn deliver_deferred_priority(&mut self) {
        let Some(deferred) = self
            .ledger
            .undelivered(false)
            .into_iter()
            .find(|c| c.tier == PriorityTier::Priority)
            .cloned()
        else {
            return;
        };
        if !self.session.has_interrupt_room() {
            log::info!("No room to interrupt, {} waits for a trigger", deferred.id());
            return;
        }
        let now = self.clock.now();
        if !self.gate.admit_deferred(&self.config.rate_limit, now) {
            log::info!("Interrupt budget spent, {} waits for a trigger", deferred.id());
            return;
        }
        self.play(SoundId::ArrivalPriority).await;
        self.interrupt_with(&deferred).await;
    }

    /// Fire queued reminders while no turn is open
    async fn drain_reminders(&mut self) {
        while self.session.state() == SessionState::Idle {
            let Some(id) = self.queued_reminders.pop_front() else {
                break;
            };
            let Some(reminder) = self.session.take_reminder(id) else {
                continue;
            };

            self.play(SoundId::Reminder).await;
            let now = self.clock.now();
            let turn = match self.session.begin_turn(TurnOrigin::Reminder, now) {
                Ok(turn) => turn,
                Err(e) => {
                    log::warn!("Could not open a reminder turn: {e}");
                    continue;
                }
            };
            match self
                .session
                .announce_reminder(turn, &reminder, &self.ledger, now)
            {
                Ok(response) => self.deliver(turn, response).await,
                Err(e) => log::warn!("Could not announce reminder {id}: {e}"),
            }
        }
    }

    async fn after_event(&mut self) {
        self.persist();
        if let Some(board) = &self.status_board {
            board.publish(self.status()).await;
        }
    }

    /// Save the context if it changed since the last write
    fn persist(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let context = self.session.context();
        if self.saved_context.as_ref() == Some(context) {
            return;
        }
        match store.save(context) {
            Ok(()) => self.saved_context = Some(context.clone()),
            Err(e) => log::warn!("Failed to persist conversation context: {e:#}"),
        }
    }
}
