use anyhow::Result;
use hark_storage::Database;
use std::sync::Arc;

use crate::session::ConversationContext;

/// Store key of the context snapshot
pub const CONTEXT_KEY: &str = "conversation_context";

/// Bump when `ConversationContext`'s serialized shape changes
pub const CONTEXT_SCHEMA_VERSION: u32 = 1;

#[derive(Clone)]
pub struct ContextStore {
    db: Arc<Database>,
}

impl ContextStore {
    #[must_use]
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// # Errors
    ///
    /// Returns an error if serialization or the write fails
    pub fn save(&self, context: &ConversationContext) -> Result<()> {
        self.db.put_json(CONTEXT_KEY, CONTEXT_SCHEMA_VERSION, context)
    }

    /// Load the last snapshot. Snapshots written by a newer schema are
    /// ignored rather than misread.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the payload is corrupted
    pub fn load(&self) -> Result<Option<ConversationContext>> {
        let Some(record) = self.db.get_record(CONTEXT_KEY)? else {
            return Ok(None);
        };
        if record.schema_version > CONTEXT_SCHEMA_VERSION {
            log::warn!(
                "Ignoring stored context: schema v{} is newer than v{CONTEXT_SCHEMA_VERSION}",
                record.schema_version
            );
            return Ok(None);
        }
        record.decode().map(Some)
    }

    /// # Errors
    ///
    /// Returns an error if the delete fails
    pub fn clear(&self) -> Result<bool> {
        self.db.delete_record(CONTEXT_KEY)
    }
}
