use anyhow::{Context, Result};
use hark_core::clock::{Clock, SystemClock};
use hark_core::config::{config_path, get_data_dir};
use hark_core::handle::DEFAULT_EVENT_CAPACITY;
use hark_core::intent::TranscriptRecognizer;
use hark_core::ipc::{listen, StatusIpcHandler, SOCKET_NAME};
use hark_core::persistence::ContextStore;
use hark_core::producers::{spawn_mail_poller, spawn_prober, spawn_recognizer, watch_config};
use hark_core::reminders::{spawn_timer, ReminderScheduler};
use hark_core::{event_channel, AssistantConfig, AssistantEvent, Orchestrator};
use hark_storage::Database;
use std::fs;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::console::{self, ConsoleMail, ConsoleProbe, ConsoleSpeech, Mailbox};

/// Utterances buffered between the console and the recognizer
const UTTERANCE_CAPACITY: usize = 16;

pub async fn run_command() -> Result<()> {
    let config_path = config_path()?;
    let config = AssistantConfig::load(&config_path).with_context(|| {
        format!(
            "No usable config at {}. Run 'hark init' first",
            config_path.display()
        )
    })?;
    let data_dir = get_data_dir()?;
    fs::create_dir_all(&data_dir)?;
    let sock_path = data_dir.join(SOCKET_NAME);

    let db = Arc::new(Database::new(None)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mailbox = Mailbox::new();
    let mail = Arc::new(ConsoleMail::new(mailbox.clone()));
    let recognizer = Arc::new(TranscriptRecognizer::new()?);

    let (handle, events) = event_channel(DEFAULT_EVENT_CAPACITY);
    let (scheduler, timer_commands) = ReminderScheduler::channel();
    let status = Arc::new(StatusIpcHandler::new(handle.clone(), clock.now()));
    let poll_interval = config.mail.poll_interval();

    let orchestrator = Orchestrator::new(
        Arc::new(config),
        clock.clone(),
        Arc::new(ConsoleSpeech),
        mail.clone(),
        scheduler,
    )
    .with_context_store(ContextStore::new(db))
    .with_status(status.clone());

    let (utterance_tx, utterances) = mpsc::channel(UTTERANCE_CAPACITY);
    let mut tasks = vec![
        spawn_timer(timer_commands, handle.clone(), clock),
        spawn_mail_poller(mail, handle.clone(), poll_interval),
        spawn_prober(
            Arc::new(ConsoleProbe::new(mailbox.clone())),
            handle.clone(),
            orchestrator.probe_delays(),
        ),
        spawn_recognizer(utterances, recognizer, handle.clone()),
        tokio::spawn(console::drive(mailbox, utterance_tx, handle.clone())),
    ];

    let ipc_sock = sock_path.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = listen(status, &ipc_sock).await {
            log::error!("IPC listener failed: {e}");
        }
    }));

    let signal_handle = handle.clone();
    tasks.push(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl-C, shutting down...");
            if let Err(e) = signal_handle.submit_event(AssistantEvent::Shutdown).await {
                log::debug!("Ctrl-C after shutdown: {e}");
            }
        }
    }));

    // Keep the watcher alive for the whole run
    let _watcher = match watch_config(config_path, handle) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            log::warn!("Config reload disabled: {e:#}");
            None
        }
    };

    orchestrator.run(events).await;

    for task in tasks {
        task.abort();
    }
    if sock_path.exists() {
        fs::remove_file(&sock_path)?;
    }
    Ok(())
}
