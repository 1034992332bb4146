use chrono::{DateTime, Local};
use std::future::Future;

use super::Orchestrator;
use crate::collaborators::{EffectRequest, SoundId};
use crate::error::AssistantError;
use crate::events::InboxEvent;
use crate::session::{Disposition, Response, TurnHandle, TurnOutcome};

impl Orchestrator {
    pub(super) async fn speak(&self, text: &str) {
        log::info!("Speaking: {text}");
        self.acknowledge("speech", "speak", self.speech.speak(text))
            .await;
    }

    pub(super) async fn play(&self, sound: SoundId) {
        log::debug!("Playing {sound}");
        self.acknowledge("speech", "play_sound", self.speech.play_sound(sound))
            .await;
    }

    pub(super) async fn fetch_missed(&self, since: DateTime<Local>) -> Option<Vec<InboxEvent>> {
        self.acknowledge("mail", "fetch_missed", self.mail.fetch_missed(since))
            .await
    }

    /// Speak `response`, perform its effects and either keep the turn open or
    /// close it
    pub(super) async fn deliver(&mut self, turn: TurnHandle, response: Response) {
        self.speak(&response.text).await;
        for effect in response.effects {
            self.perform(effect).await;
        }

        match response.disposition {
            Disposition::Continue => {
                if let Err(e) = self.session.finish_response(turn, self.clock.now()) {
                    log::warn!("Turn {}: {e}", turn.id());
                }
            }
            Disposition::End => self.close_turn(turn, TurnOutcome::Completed).await,
        }
    }

    /// End `turn` and announce the turn it resumes, if any. Queued reminders
    /// are drained by the caller once the event is fully applied.
    pub(super) async fn close_turn(&mut self, turn: TurnHandle, outcome: TurnOutcome) {
        match self.session.end_turn(turn, outcome, self.clock.now()) {
            Ok(end) => {
                if let Some(notice) = end.resumed {
                    log::debug!("Resumed turn {}", notice.turn.id());
                    self.speak(&notice.text).await;
                }
            }
            Err(e) => log::warn!("Could not close turn {}: {e}", turn.id()),
        }
    }

    async fn perform(&self, effect: EffectRequest) {
        match effect {
            EffectRequest::Schedule(reminder) => {
                if let Err(e) = self.scheduler.schedule(&reminder) {
                    log::warn!("Failed to schedule reminder {}: {e}", reminder.id);
                }
            }
            EffectRequest::DraftReply { event_id, body } => {
                log::info!("Drafting reply to {event_id}");
                self.acknowledge("mail", "draft_reply", self.mail.draft_reply(&event_id, &body))
                    .await;
            }
            EffectRequest::BeginReauth => {
                log::info!("Starting mail re-authorization");
                self.acknowledge("mail", "begin_reauth", self.mail.begin_reauth())
                    .await;
            }
        }
    }

    /// Await `call` within the acknowledgement timeout. `None` when the
    /// collaborator failed or did not answer in time.
    async fn acknowledge<T>(
        &self,
        collaborator: &'static str,
        effect: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Option<T> {
        let waited = self.config.effects.ack_timeout();
        match tokio::time::timeout(waited, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                log::warn!("{effect}: {}", AssistantError::collaborator(collaborator, &e));
                None
            }
            Err(_) => {
                let err = AssistantError::SideEffectTimeout {
                    effect: effect.to_string(),
                    waited,
                };
                log::warn!("{err}, assuming delivered");
                None
            }
        }
    }
}
