use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use hark_core::collaborators::{
    ConnectivityProbe, MailSource, SoundId, SpeechOutput, Utterance,
};
use hark_core::connectivity::ProbeResult;
use hark_core::events::{EventId, InboxEvent, InboxPlacement};
use hark_core::{AssistantEvent, AssistantHandle};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const HELP: &str = "\
Commands:
  wake                                    activation trigger
  say <text>                              speak to the assistant
  mail <sender> | <subject> [| <folder>]  deliver an email (folder: inbox, promotions, social, updates, forums, spam)
  net up | down | auth                    restore the network, drop it, or expire the sign-in
  help                                    show this help
  quit                                    shut down";

// ==================== Simulated mailbox ====================

#[derive(Debug)]
struct MailboxState {
    online: bool,
    signed_in: bool,
    unseen: Vec<InboxEvent>,
    received: Vec<InboxEvent>,
}

/// Shared state behind the console mail source and probe
#[derive(Debug, Clone)]
pub struct Mailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl Mailbox {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MailboxState {
                online: true,
                signed_in: true,
                unseen: Vec::new(),
                received: Vec::new(),
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut MailboxState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Mail stays unseen until a poll or a missed-mail fetch returns it
    pub fn deliver(&self, event: InboxEvent) {
        self.with(|state| {
            state.unseen.push(event.clone());
            state.received.push(event);
        });
    }

    pub fn set_online(&self, online: bool) {
        self.with(|state| state.online = online);
    }

    pub fn expire_sign_in(&self) {
        self.with(|state| state.signed_in = false);
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConsoleMail {
    mailbox: Mailbox,
}

impl ConsoleMail {
    #[must_use]
    pub const fn new(mailbox: Mailbox) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl MailSource for ConsoleMail {
    async fn poll_new(&self) -> Result<Vec<InboxEvent>> {
        self.mailbox.with(|state| {
            if !state.online {
                bail!("network unreachable");
            }
            if !state.signed_in {
                bail!("sign-in expired");
            }
            Ok(std::mem::take(&mut state.unseen))
        })
    }

    async fn fetch_missed(&self, since: DateTime<Local>) -> Result<Vec<InboxEvent>> {
        self.mailbox.with(|state| {
            if !state.online {
                bail!("network unreachable");
            }
            let missed: Vec<InboxEvent> = state
                .received
                .iter()
                .filter(|event| event.received_at >= since)
                .cloned()
                .collect();
            state
                .unseen
                .retain(|event| !missed.iter().any(|m| m.id == event.id));
            Ok(missed)
        })
    }

    async fn draft_reply(&self, event_id: &EventId, body: &str) -> Result<()> {
        println!("  [draft saved in reply to {event_id}] {body}");
        Ok(())
    }

    async fn begin_reauth(&self) -> Result<()> {
        println!("  [sign-in page opened, signing in]");
        self.mailbox.with(|state| state.signed_in = true);
        Ok(())
    }
}

pub struct ConsoleProbe {
    mailbox: Mailbox,
}

impl ConsoleProbe {
    #[must_use]
    pub const fn new(mailbox: Mailbox) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl ConnectivityProbe for ConsoleProbe {
    async fn probe(&self) -> ProbeResult {
        self.mailbox.with(|state| {
            if !state.online {
                ProbeResult::Failed("network unreachable".to_string())
            } else if !state.signed_in {
                ProbeResult::AuthExpired
            } else {
                ProbeResult::Healthy
            }
        })
    }
}

// ==================== Speech ====================

pub struct ConsoleSpeech;

#[async_trait]
impl SpeechOutput for ConsoleSpeech {
    async fn speak(&self, text: &str) -> Result<()> {
        println!("hark> {text}");
        Ok(())
    }

    async fn play_sound(&self, sound: SoundId) -> Result<()> {
        println!("  [sound: {sound}]");
        Ok(())
    }
}

// ==================== Driver ====================

/// One parsed line of console input
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Wake,
    Say(String),
    Mail {
        sender: String,
        subject: String,
        placement: InboxPlacement,
    },
    Online(bool),
    ExpireSignIn,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match word.to_lowercase().as_str() {
        "wake" => Ok(Command::Wake),
        "say" if !rest.is_empty() => Ok(Command::Say(rest.to_string())),
        "mail" => {
            let parts: Vec<&str> = rest.split('|').map(str::trim).collect();
            match parts.as_slice() {
                [sender, subject] if !sender.is_empty() => Ok(Command::Mail {
                    sender: (*sender).to_string(),
                    subject: (*subject).to_string(),
                    placement: InboxPlacement::Primary,
                }),
                [sender, subject, folder] if !sender.is_empty() => Ok(Command::Mail {
                    sender: (*sender).to_string(),
                    subject: (*subject).to_string(),
                    placement: folder.parse().map_err(anyhow::Error::msg)?,
                }),
                _ => bail!("usage: mail <sender> | <subject> [| <folder>]"),
            }
        }
        "net" => match rest {
            "up" => Ok(Command::Online(true)),
            "down" => Ok(Command::Online(false)),
            "auth" => Ok(Command::ExpireSignIn),
            _ => bail!("usage: net up | down | auth"),
        },
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        _ => bail!("unknown command '{line}', try 'help'"),
    }
}

/// Read commands from stdin until `quit` or end of input
pub async fn drive(mailbox: Mailbox, utterances: mpsc::Sender<Utterance>, handle: AssistantHandle) {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read console input: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("  {e}");
                continue;
            }
        };

        let submitted = match command {
            Command::Wake => handle.submit_event(AssistantEvent::ActivationTrigger).await,
            Command::Say(text) => {
                if utterances.send(Utterance::new(text)).await.is_err() {
                    break;
                }
                Ok(())
            }
            Command::Mail {
                sender,
                subject,
                placement,
            } => {
                let id = uuid::Uuid::new_v4().to_string();
                mailbox.deliver(
                    InboxEvent::new(id, sender, subject, Local::now()).with_placement(placement),
                );
                Ok(())
            }
            Command::Online(online) => {
                mailbox.set_online(online);
                Ok(())
            }
            Command::ExpireSignIn => {
                mailbox.expire_sign_in();
                Ok(())
            }
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Quit => break,
        };
        if submitted.is_err() {
            break;
        }
    }

    if let Err(e) = handle.submit_event(AssistantEvent::Shutdown).await {
        log::debug!("Console exit after shutdown: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("wake").unwrap(), Command::Wake);
        assert_eq!(
            parse_command("say read my latest email").unwrap(),
            Command::Say("read my latest email".to_string())
        );
        assert_eq!(parse_command("net down").unwrap(), Command::Online(false));
        assert_eq!(parse_command("net auth").unwrap(), Command::ExpireSignIn);
        assert_eq!(
            parse_command("mail Ana <ana@example.com> | Lunch").unwrap(),
            Command::Mail {
                sender: "Ana <ana@example.com>".to_string(),
                subject: "Lunch".to_string(),
                placement: InboxPlacement::Primary,
            }
        );
        assert!(parse_command("say").is_err());
        assert!(parse_command("mail nobody").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[tokio::test]
    async fn test_mail_during_degraded_network_reaches_the_next_poll() {
        let mailbox = Mailbox::new();
        let mail = ConsoleMail::new(mailbox.clone());
        let probe = ConsoleProbe::new(mailbox.clone());

        mailbox.set_online(false);
        mailbox.deliver(InboxEvent::new("m-1", "ana@example.com", "Lunch", Local::now()));
        assert!(matches!(probe.probe().await, ProbeResult::Failed(_)));
        assert!(mail.poll_new().await.is_err());

        mailbox.set_online(true);
        let polled = mail.poll_new().await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].id, EventId::new("m-1"));
        assert!(mail.poll_new().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mail_during_expired_sign_in_survives_reauth() {
        let mailbox = Mailbox::new();
        let mail = ConsoleMail::new(mailbox.clone());

        mailbox.expire_sign_in();
        mailbox.deliver(InboxEvent::new("m-1", "ana@example.com", "Lunch", Local::now()));
        assert!(mail.poll_new().await.is_err());

        mail.begin_reauth().await.unwrap();
        assert_eq!(mail.poll_new().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missed_fetch_consumes_what_it_returns() {
        let mailbox = Mailbox::new();
        let mail = ConsoleMail::new(mailbox.clone());
        let since = Local::now() - chrono::Duration::minutes(1);

        mailbox.set_online(false);
        mailbox.deliver(InboxEvent::new("m-1", "ana@example.com", "Lunch", Local::now()));
        mailbox.set_online(true);

        assert_eq!(mail.fetch_missed(since).await.unwrap().len(), 1);
        assert!(mail.poll_new().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reauth_restores_sign_in() {
        let mailbox = Mailbox::new();
        let mail = ConsoleMail::new(mailbox.clone());
        let probe = ConsoleProbe::new(mailbox.clone());

        mailbox.expire_sign_in();
        assert_eq!(probe.probe().await, ProbeResult::AuthExpired);
        mail.begin_reauth().await.unwrap();
        assert_eq!(probe.probe().await, ProbeResult::Healthy);
    }
}
