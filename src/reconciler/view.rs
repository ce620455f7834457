use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{EntryKey, ViewEntry};

#[derive(Debug, Clone)]
struct Slot {
    entry: ViewEntry,
    seq: u64,
}

impl Slot {
    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.entry.created_at, self.seq)
    }
}

/// Deduplicated entries kept sorted by `(created_at, arrival)`.
///
/// `index` maps each key to the sort key of its slot, so lookups are a hash
/// probe followed by a binary search.
#[derive(Debug, Default, Clone)]
pub struct ConversationView {
    slots: Vec<Slot>,
    index: HashMap<EntryKey, (DateTime<Utc>, u64)>,
    next_seq: u64,
}

impl ConversationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &EntryKey) -> Option<&ViewEntry> {
        self.position(key).map(|pos| &self.slots[pos].entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViewEntry> {
        self.slots.iter().map(|s| &s.entry)
    }

    pub fn snapshot(&self) -> Vec<ViewEntry> {
        self.iter().cloned().collect()
    }

    /// Inserts `entry` in order. Returns `false` if its key is already present.
    pub fn insert(&mut self, entry: ViewEntry) -> bool {
        if self.index.contains_key(&entry.key) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.place(Slot { entry, seq });
        true
    }

    /// Replaces the entry under the same key, keeping its arrival rank.
    /// Returns `false` if the key is unknown.
    pub fn replace(&mut self, entry: ViewEntry) -> bool {
        let Some(pos) = self.position(&entry.key) else {
            return false;
        };
        let seq = self.slots[pos].seq;
        if self.slots[pos].entry.created_at == entry.created_at {
            self.slots[pos].entry = entry;
        } else {
            let old = self.slots.remove(pos);
            self.index.remove(&old.entry.key);
            self.place(Slot { entry, seq });
        }
        true
    }

    pub fn remove(&mut self, key: &EntryKey) -> Option<ViewEntry> {
        let pos = self.position(key)?;
        self.index.remove(key);
        Some(self.slots.remove(pos).entry)
    }

    fn place(&mut self, slot: Slot) {
        let key = slot.order_key();
        let pos = self.slots.partition_point(|s| s.order_key() < key);
        self.index.insert(slot.entry.key.clone(), key);
        self.slots.insert(pos, slot);
    }

    fn position(&self, key: &EntryKey) -> Option<usize> {
        let order = *self.index.get(key)?;
        let pos = self.slots.partition_point(|s| s.order_key() < order);
        (pos < self.slots.len() && self.slots[pos].entry.key == *key).then_some(pos)
    }
}
