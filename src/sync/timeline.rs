//! Ordered, de-duplicated message sequence for one open conversation.
//!
//! DESIGN
//! ======
//! Entries are kept sorted by `(created_at, arrival)` where `arrival` is a
//! counter assigned the first time an id is seen. Re-delivery of a known id
//! never creates a second entry, so history, broadcast and persisted-row
//! deliveries can overlap freely.
//!
//! The one exception to "first arrival wins" is confirmation: a confirmed
//! copy of an optimistic entry replaces it in place, keeping its arrival
//! slot.

use crate::model::{Message, MessageId, UiMessage};

/// Which path delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    History,
    Broadcast,
    Persisted,
    /// Locally composed, not yet persisted.
    Local,
}

impl Source {
    fn is_optimistic(self) -> bool {
        matches!(self, Self::Local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// An optimistic entry was replaced by its confirmed copy.
    Confirmed,
    Ignored,
}

#[derive(Debug, Clone)]
struct Entry {
    message: UiMessage,
    arrival: u64,
}

impl Entry {
    fn key(&self) -> (i64, u64) {
        (self.message.message.created_at, self.arrival)
    }
}

#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<Entry>,
    next_arrival: u64,
}

impl Timeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Single entry point for any arriving message.
    pub fn merge(&mut self, message: Message, source: Source) -> MergeOutcome {
        let optimistic = source.is_optimistic();

        if let Some(pos) = self.position(message.id) {
            if !self.entries[pos].message.optimistic || optimistic {
                return MergeOutcome::Ignored;
            }
            let existing = self.entries.remove(pos);
            self.insert(Entry { message: UiMessage::confirmed(message), arrival: existing.arrival });
            return MergeOutcome::Confirmed;
        }

        let arrival = self.next_arrival;
        self.next_arrival += 1;
        let message = if optimistic { UiMessage::optimistic(message) } else { UiMessage::confirmed(message) };
        self.insert(Entry { message, arrival });
        MergeOutcome::Inserted
    }

    /// Flip an optimistic entry to confirmed. Returns false if absent.
    pub fn confirm(&mut self, id: MessageId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.entries[pos].message.optimistic = false;
                true
            }
            None => false,
        }
    }

    /// Remove an entry by id (optimistic rollback).
    pub fn remove(&mut self, id: MessageId) -> Option<UiMessage> {
        self.position(id).map(|pos| self.entries.remove(pos).message)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.position(id).is_some()
    }

    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&UiMessage> {
        self.position(id).map(|pos| &self.entries[pos].message)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current sequence, in display order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UiMessage> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id() == id)
    }

    fn insert(&mut self, entry: Entry) {
        let key = entry.key();
        let at = self.entries.partition_point(|e| e.key() < key);
        self.entries.insert(at, entry);
    }
}

#[cfg(test)]
#[path = "timeline_test.rs"]
mod tests;
