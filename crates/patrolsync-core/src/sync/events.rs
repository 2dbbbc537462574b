//! Sync event types broadcast to observers
//!
//! The engine emits one event per entry outcome plus drain boundaries.
//! `EntrySynced` carries the confirmed event (with its server id set) so the
//! realtime broadcaster can republish it without re-reading the queue.

use crate::types::{EventId, FieldEvent};

/// Events emitted during queue drains
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A drain cycle began
    DrainStarted {
        /// Entries eligible at the start of the cycle
        eligible: usize,
    },
    /// A drain cycle ended
    DrainFinished {
        synced: usize,
        failed: usize,
        rejected: usize,
    },
    /// An entry was delivered and confirmed
    EntrySynced {
        /// The confirmed event, `server_id` set
        event: FieldEvent,
        server_id: String,
        /// Whether the server reported it as an idempotent duplicate
        duplicate: bool,
    },
    /// An entry failed transiently and will be retried
    EntryFailed {
        event_id: EventId,
        attempts: u32,
        error: String,
    },
    /// The server rejected an entry; it will not be retried automatically
    EntryRejected { event_id: EventId, reason: String },
    /// An in-flight entry was reverted to pending (connectivity loss)
    EntryReverted { event_id: EventId },
}

impl SyncEvent {
    /// The event id this sync event refers to, if any
    pub fn event_id(&self) -> Option<EventId> {
        match self {
            SyncEvent::EntrySynced { event, .. } => Some(event.id),
            SyncEvent::EntryFailed { event_id, .. } => Some(*event_id),
            SyncEvent::EntryRejected { event_id, .. } => Some(*event_id),
            SyncEvent::EntryReverted { event_id } => Some(*event_id),
            SyncEvent::DrainStarted { .. } | SyncEvent::DrainFinished { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_accessor() {
        let id = EventId::new();
        let event = SyncEvent::EntryFailed {
            event_id: id,
            attempts: 1,
            error: "timeout".into(),
        };
        assert_eq!(event.event_id(), Some(id));

        let event = SyncEvent::DrainStarted { eligible: 3 };
        assert_eq!(event.event_id(), None);
    }
}
