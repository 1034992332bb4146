use std::collections::VecDeque;

use crate::events::{ClassifiedEvent, EventId, PriorityTier};

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub classified: ClassifiedEvent,
    pub delivered: bool,
}

/// Result of recording an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerInsert {
    /// Stored. `evicted` is the oldest event dropped to make room, if any.
    Inserted { evicted: Option<EventId> },
    /// The provider re-reported an id already in the ledger
    Duplicate,
}

/// Arrival-ordered store of classified events, FILTERED ones included.
/// The undelivered non-filtered entries form the pending queue.
#[derive(Debug)]
pub struct InboxLedger {
    entries: VecDeque<LedgerEntry>,
    capacity: usize,
}

impl InboxLedger {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, classified: ClassifiedEvent) -> LedgerInsert {
        if self.contains(classified.id()) {
            return LedgerInsert::Duplicate;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|e| e.classified.event.id)
        } else {
            None
        };
        self.entries.push_back(LedgerEntry {
            classified,
            delivered: false,
        });
        LedgerInsert::Inserted { evicted }
    }

    /// Shrink or grow; returns the ids evicted by a shrink
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<EventId> {
        self.capacity = capacity.max(1);
        let excess = self.entries.len().saturating_sub(self.capacity);
        self.entries
            .drain(..excess)
            .map(|e| e.classified.event.id)
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &EventId) -> Option<&ClassifiedEvent> {
        self.entry(id).map(|e| &e.classified)
    }

    #[must_use]
    pub fn contains(&self, id: &EventId) -> bool {
        self.entry(id).is_some()
    }

    /// Mark an event spoken or summarized. Returns false if it was already.
    pub fn mark_delivered(&mut self, id: &EventId) -> bool {
        match self.entries.iter_mut().find(|e| e.classified.id() == id) {
            Some(entry) if !entry.delivered => {
                entry.delivered = true;
                true
            }
            _ => false,
        }
    }

    /// Undelivered events, PRIORITY first then REGULAR (then FILTERED when
    /// asked for), each in arrival order
    #[must_use]
    pub fn undelivered(&self, include_filtered: bool) -> Vec<&ClassifiedEvent> {
        let tiers: &[PriorityTier] = if include_filtered {
            &[PriorityTier::Priority, PriorityTier::Regular, PriorityTier::Filtered]
        } else {
            &[PriorityTier::Priority, PriorityTier::Regular]
        };
        tiers
            .iter()
            .flat_map(|tier| {
                self.entries
                    .iter()
                    .filter(move |e| !e.delivered && e.classified.tier == *tier)
                    .map(|e| &e.classified)
            })
            .collect()
    }

    /// Head of the pending queue
    #[must_use]
    pub fn next_undelivered(&self) -> Option<&ClassifiedEvent> {
        self.undelivered(false).into_iter().next()
    }

    /// Most recent non-filtered event, delivered or not
    #[must_use]
    pub fn latest(&self) -> Option<&ClassifiedEvent> {
        self.entries
            .iter()
            .rev()
            .map(|e| &e.classified)
            .find(|c| c.tier != PriorityTier::Filtered)
    }

    /// Most recent event whose sender header contains `needle` (case-insensitive)
    #[must_use]
    pub fn find_from_sender(&self, needle: &str) -> Option<&ClassifiedEvent> {
        let needle = needle.to_lowercase();
        self.entries
            .iter()
            .rev()
            .map(|e| &e.classified)
            .find(|c| c.event.sender.to_lowercase().contains(&needle))
    }

    /// Undelivered entries of `tier`
    #[must_use]
    pub fn pending_count(&self, tier: PriorityTier) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.delivered && e.classified.tier == tier)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, id: &EventId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.classified.id() == id)
    }
}
