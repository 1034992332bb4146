pub mod attention;
pub mod classifier;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod handle;
pub mod intent;
pub mod ipc;
pub mod ledger;
pub mod orchestrator;
pub mod persistence;
pub mod producers;
pub mod reminders;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AssistantConfig;
pub use error::AssistantError;
pub use events::{AssistantEvent, InboxEvent, PriorityTier};
pub use handle::{event_channel, AssistantHandle};
pub use orchestrator::Orchestrator;
pub use session::SessionState;
