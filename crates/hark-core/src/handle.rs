use tokio::sync::mpsc;

use crate::error::AssistantError;
use crate::events::AssistantEvent;

/// Events buffered between producers and the orchestrator
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Cloneable producer side of the orchestrator's event stream
#[derive(Debug, Clone)]
pub struct AssistantHandle {
    tx: mpsc::Sender<AssistantEvent>,
}

impl AssistantHandle {
    /// Queue an event, waiting while the stream is full
    ///
    /// # Errors
    ///
    /// Returns `LoopClosed` once the orchestrator has stopped
    pub async fn submit_event(&self, event: AssistantEvent) -> Result<(), AssistantError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| AssistantError::LoopClosed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create the bounded event stream: producers get the handle, the
/// orchestrator's `run` gets the receiver
#[must_use]
pub fn event_channel(capacity: usize) -> (AssistantHandle, mpsc::Receiver<AssistantEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (AssistantHandle { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_after_receiver_dropped_fails() {
        let (handle, rx) = event_channel(4);
        handle
            .submit_event(AssistantEvent::ActivationTrigger)
            .await
            .unwrap();
        drop(rx);
        assert!(handle.is_closed());
        assert!(matches!(
            handle.submit_event(AssistantEvent::Shutdown).await,
            Err(AssistantError::LoopClosed)
        ));
    }
}
