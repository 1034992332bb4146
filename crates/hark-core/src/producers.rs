use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::collaborators::{ConnectivityProbe, MailSource, SpeechUnderstanding, Utterance};
use crate::config::AssistantConfig;
use crate::events::AssistantEvent;
use crate::handle::AssistantHandle;

/// Quiet period after the last file change before the config is re-read
const CONFIG_DEBOUNCE: Duration = Duration::from_millis(300);

// ==================== Mail ====================

/// Poll `mail` every `every` and forward new messages as `Inbox` events.
/// Poll failures are logged; the prober is what reports outages.
pub fn spawn_mail_poller(
    mail: Arc<dyn MailSource>,
    handle: AssistantHandle,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'poll: loop {
            ticker.tick().await;
            if handle.is_closed() {
                break;
            }
            let batch = match mail.poll_new().await {
                Ok(batch) => batch,
                Err(e) => {
                    log::debug!("Mail poll failed: {e:#}");
                    continue;
                }
            };
            for event in batch {
                if handle.submit_event(AssistantEvent::Inbox(event)).await.is_err() {
                    break 'poll;
                }
            }
        }
        log::debug!("Mail poller stopped");
    })
}

// ==================== Connectivity ====================

/// Probe the mail channel, waiting whatever delay the orchestrator last
/// published between probes
pub fn spawn_prober(
    probe: Arc<dyn ConnectivityProbe>,
    handle: AssistantHandle,
    mut delays: watch::Receiver<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = *delays.borrow_and_update();
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    let result = probe.probe().await;
                    if handle.submit_event(AssistantEvent::Probe(result)).await.is_err() {
                        break;
                    }
                }
                changed = delays.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::debug!("Connectivity prober stopped");
    })
}

// ==================== Speech ====================

/// Recognize utterances in arrival order and forward the results
pub fn spawn_recognizer(
    mut utterances: mpsc::Receiver<Utterance>,
    understanding: Arc<dyn SpeechUnderstanding>,
    handle: AssistantHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(utterance) = utterances.recv().await {
            let recognition = understanding.recognize(&utterance).await;
            if handle
                .submit_event(AssistantEvent::Speech(recognition))
                .await
                .is_err()
            {
                break;
            }
        }
        log::debug!("Recognizer stopped");
    })
}

// ==================== Config ====================

/// Watch `path` and submit `ConfigReloaded` whenever it changes to a valid
/// configuration. Invalid edits are logged and the running config is kept.
/// The returned watcher must be kept alive.
///
/// # Errors
///
/// Returns an error if the watcher cannot be created or the directory
/// cannot be watched
pub fn watch_config(path: PathBuf, handle: AssistantHandle) -> Result<RecommendedWatcher> {
    let dir = path
        .parent()
        .map(std::path::Path::to_path_buf)
        .context("Config path has no parent directory")?;
    let file_name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .context("Config path has no file name")?;

    let (tx, mut changes) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_)
            ) && event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()));
            if relevant {
                // Receiver gone means the reload task stopped
                let _ = tx.send(());
            }
        }
        Err(e) => log::warn!("Config watch error: {e}"),
    })?;
    // Editors often replace the file, so watch the directory
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    log::info!("Watching {} for changes", path.display());

    tokio::spawn(async move {
        while changes.recv().await.is_some() {
            // Absorb the rest of the burst
            loop {
                match tokio::time::timeout(CONFIG_DEBOUNCE, changes.recv()).await {
                    Ok(Some(())) => {}
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            match AssistantConfig::load(&path) {
                Ok(config) => {
                    let event = AssistantEvent::ConfigReloaded(Arc::new(config));
                    if handle.submit_event(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Ignoring invalid configuration: {e}"),
            }
        }
        log::debug!("Config watcher stopped");
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ProbeResult;
    use crate::events::InboxEvent;
    use crate::handle::event_channel;
    use crate::intent::TranscriptRecognizer;
    use async_trait::async_trait;
    use chrono::{DateTime, Local};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(5);

    struct BatchMail {
        batches: Mutex<Vec<Vec<InboxEvent>>>,
    }

    #[async_trait]
    impl MailSource for BatchMail {
        async fn poll_new(&self) -> Result<Vec<InboxEvent>> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                anyhow::bail!("mailbox unreachable");
            }
            Ok(batches.remove(0))
        }

        async fn fetch_missed(&self, _since: DateTime<Local>) -> Result<Vec<InboxEvent>> {
            Ok(Vec::new())
        }

        async fn draft_reply(&self, _event_id: &crate::events::EventId, _body: &str) -> Result<()> {
            Ok(())
        }

        async fn begin_reauth(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FixedProbe(ProbeResult);

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn probe(&self) -> ProbeResult {
            self.0.clone()
        }
    }

    fn email(id: &str) -> InboxEvent {
        InboxEvent::new(id, "ana@example.com", "Lunch", Local::now())
    }

    async fn next(events: &mut mpsc::Receiver<AssistantEvent>) -> AssistantEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_mail_poller_forwards_batches_in_order() {
        let (handle, mut events) = event_channel(8);
        let mail = Arc::new(BatchMail {
            batches: Mutex::new(vec![vec![email("m-1"), email("m-2")], vec![email("m-3")]]),
        });
        let poller = spawn_mail_poller(mail, handle, Duration::from_millis(10));

        let mut ids = Vec::new();
        for _ in 0..3 {
            match next(&mut events).await {
                AssistantEvent::Inbox(event) => ids.push(event.id.to_string()),
                other => panic!("unexpected event {}", other.kind()),
            }
        }
        assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);

        drop(events);
        tokio::time::timeout(WAIT, poller).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_prober_reports_results() {
        let (handle, mut events) = event_channel(8);
        let (delays_tx, delays) = watch::channel(Duration::from_millis(5));
        let _prober = spawn_prober(Arc::new(FixedProbe(ProbeResult::AuthExpired)), handle, delays);

        assert!(matches!(
            next(&mut events).await,
            AssistantEvent::Probe(ProbeResult::AuthExpired)
        ));
        delays_tx.send_replace(Duration::from_millis(1));
        assert!(matches!(next(&mut events).await, AssistantEvent::Probe(_)));
    }

    #[tokio::test]
    async fn test_prober_stops_when_delays_closed() {
        let (handle, _events) = event_channel(8);
        let (delays_tx, delays) = watch::channel(Duration::from_secs(3600));
        let prober = spawn_prober(Arc::new(FixedProbe(ProbeResult::Healthy)), handle, delays);

        drop(delays_tx);
        tokio::time::timeout(WAIT, prober).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recognizer_forwards_intents() {
        let (handle, mut events) = event_channel(8);
        let (utterances_tx, utterances) = mpsc::channel(4);
        let recognizer = Arc::new(TranscriptRecognizer::new().unwrap());
        let _task = spawn_recognizer(utterances, recognizer, handle);

        utterances_tx.send(Utterance::new("mumble")).await.unwrap();
        utterances_tx
            .send(Utterance::new("read my latest email"))
            .await
            .unwrap();

        assert!(matches!(next(&mut events).await, AssistantEvent::Speech(Err(_))));
        assert!(matches!(next(&mut events).await, AssistantEvent::Speech(Ok(_))));
    }

    #[tokio::test]
    async fn test_config_watcher_skips_invalid_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        AssistantConfig::with_session(crate::config::SessionConfig::recommended())
            .save(&path)
            .unwrap();

        let (handle, mut events) = event_channel(8);
        let _watcher = watch_config(path.clone(), handle).unwrap();

        std::fs::write(&path, "this is = = not toml").unwrap();
        tokio::time::sleep(CONFIG_DEBOUNCE * 3).await;

        let mut edited = AssistantConfig::with_session(crate::config::SessionConfig::recommended());
        edited.rate_limit.max_interrupts = 7;
        edited.save(&path).unwrap();

        match next(&mut events).await {
            AssistantEvent::ConfigReloaded(config) => {
                assert_eq!(config.rate_limit.max_interrupts, 7);
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }
}
