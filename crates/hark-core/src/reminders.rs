use chrono::{DateTime, Local};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::AssistantError;
use crate::events::AssistantEvent;
use crate::handle::AssistantHandle;
use crate::session::{Reminder, ReminderId};

/// Request to the timer task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerCommand {
    pub id: ReminderId,
    pub fire_at: DateTime<Local>,
}

/// Orchestrator side of the timer task
#[derive(Debug, Clone)]
pub struct ReminderScheduler {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl ReminderScheduler {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TimerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// # Errors
    ///
    /// Returns `LoopClosed` if the timer task is gone
    pub fn schedule(&self, reminder: &Reminder) -> Result<(), AssistantError> {
        self.tx
            .send(TimerCommand {
                id: reminder.id,
                fire_at: reminder.fire_at,
            })
            .map_err(|_| AssistantError::LoopClosed)
    }
}

/// Run the timer until the scheduler is dropped or the orchestrator stops.
/// Reminders whose time already passed fire immediately.
pub fn spawn_timer(
    mut commands: mpsc::UnboundedReceiver<TimerCommand>,
    handle: AssistantHandle,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut due: BTreeSet<(DateTime<Local>, ReminderId)> = BTreeSet::new();

        loop {
            let wait = due
                .first()
                .map(|(at, _)| (*at - clock.now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                command = commands.recv() => match command {
                    Some(TimerCommand { id, fire_at }) => {
                        log::debug!("Reminder {id} scheduled for {fire_at}");
                        due.insert((fire_at, id));
                    }
                    None => break,
                },
                () = sleep_or_park(wait) => {
                    let Some((_, id)) = due.pop_first() else {
                        continue;
                    };
                    log::info!("Reminder {id} fired");
                    if handle.submit_event(AssistantEvent::ReminderFired(id)).await.is_err() {
                        break;
                    }
                }
            }
        }
        log::debug!("Reminder timer stopped");
    })
}

async fn sleep_or_park(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::handle::event_channel;

    fn reminder_in(millis: i64) -> Reminder {
        Reminder {
            id: ReminderId::new(),
            target_event_id: None,
            label: "stretch".to_string(),
            fire_at: Local::now() + chrono::Duration::milliseconds(millis),
        }
    }

    #[tokio::test]
    async fn test_reminders_fire_in_time_order() {
        let (handle, mut events) = event_channel(8);
        let (scheduler, commands) = ReminderScheduler::channel();
        let _timer = spawn_timer(commands, handle, Arc::new(SystemClock));

        let later = reminder_in(120);
        let sooner = reminder_in(40);
        scheduler.schedule(&later).unwrap();
        scheduler.schedule(&sooner).unwrap();

        let mut fired = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                AssistantEvent::ReminderFired(id) => fired.push(id),
                other => panic!("unexpected event {}", other.kind()),
            }
        }
        assert_eq!(fired, vec![sooner.id, later.id]);
    }

    #[tokio::test]
    async fn test_timer_stops_when_scheduler_dropped() {
        let (handle, _events) = event_channel(8);
        let (scheduler, commands) = ReminderScheduler::channel();
        let timer = spawn_timer(commands, handle, Arc::new(SystemClock));

        drop(scheduler);
        tokio::time::timeout(Duration::from_secs(1), timer)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_past_reminder_fires_immediately() {
        let (handle, mut events) = event_channel(8);
        let (scheduler, commands) = ReminderScheduler::channel();
        let _timer = spawn_timer(commands, handle, Arc::new(SystemClock));

        let overdue = reminder_in(-60_000);
        scheduler.schedule(&overdue).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(AssistantEvent::ReminderFired(id)) if id == overdue.id));
    }
}
