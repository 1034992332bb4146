/// Persisted conversation state commands
use anyhow::Result;
use chrono::Local;
use hark_core::persistence::ContextStore;
use hark_core::session::ConversationContext;
use hark_storage::{Database, StateRecord};
use std::sync::Arc;

fn open_db() -> Result<Arc<Database>> {
    Ok(Arc::new(Database::new(None)?))
}

fn open_store() -> Result<ContextStore> {
    Ok(ContextStore::new(open_db()?))
}

pub fn handle_state_show() -> Result<()> {
    let db = open_db()?;
    match ContextStore::new(db.clone()).load()? {
        Some(context) => print_context(&context),
        None => println!("No saved conversation state."),
    }
    print_records(&db.list_records()?);
    Ok(())
}

/// Forget topic, history and reminders. Only safe while the assistant is stopped.
pub fn handle_state_reset() -> Result<()> {
    if open_store()?.clear()? {
        println!("Conversation state cleared.");
    } else {
        println!("No saved conversation state.");
    }
    Ok(())
}

fn print_context(context: &ConversationContext) {
    match &context.active_topic {
        Some(topic) => println!("Topic: {}", topic.describe()),
        None => println!("Topic: none"),
    }

    println!("\nReminders ({}):", context.pending_reminders.len());
    for reminder in &context.pending_reminders {
        println!(
            "  {}  {}",
            reminder.fire_at.format("%Y-%m-%d %H:%M"),
            reminder.label
        );
    }

    println!("\nRecent turns ({}):", context.history.len());
    for record in &context.history {
        println!(
            "  #{:<4} {}  {:?} / {:?}  {}",
            record.turn_id,
            record.opened_at.format("%m-%d %H:%M:%S"),
            record.origin,
            record.outcome,
            record.topic.as_deref().unwrap_or("-")
        );
    }
}

fn print_records(records: &[StateRecord]) {
    println!("\nStored records ({}):", records.len());
    for record in records {
        println!(
            "  {:<24} v{}  {:>6} bytes  updated {}",
            record.key,
            record.schema_version,
            record.payload_len(),
            record
                .updated_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
        );
    }
}
