use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use knc_wire_spec::WORK_ID_MASK;

use crate::work::WorkItem;

struct Entry {
    seq: u64,
    work: Arc<WorkItem>,
}

/// Work the hardware has accepted, keyed by 15-bit wrapping id. Insertion
/// order is kept alongside the id map so the newest live entry is known
/// after arbitrary removals.
#[derive(Default)]
pub struct DeviceTable {
    entries: HashMap<u16, Entry>,
    order: BTreeMap<u64, u16>,
    next_seq: u64,
    next_id: u16,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id the item `offset` places behind the next insertion will get.
    pub fn speculative_id(&self, offset: usize) -> u16 {
        (self.next_id as usize).wrapping_add(offset) as u16 & WORK_ID_MASK
    }

    pub fn insert_next(&mut self, work: Arc<WorkItem>) -> (u16, Option<Arc<WorkItem>>) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1) & WORK_ID_MASK;

        let seq = self.next_seq;
        self.next_seq += 1;

        let displaced = self.entries.insert(id, Entry { seq, work }).map(|old| {
            self.order.remove(&old.seq);
            old.work
        });
        self.order.insert(seq, id);
        (id, displaced)
    }

    pub fn get(&self, id: u16) -> Option<&Arc<WorkItem>> {
        self.entries.get(&id).map(|entry| &entry.work)
    }

    pub fn remove(&mut self, id: u16) -> Option<Arc<WorkItem>> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&entry.seq);
        Some(entry.work)
    }

    pub fn newest(&self) -> Option<&Arc<WorkItem>> {
        let (_, id) = self.order.last_key_value()?;
        self.get(*id)
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.order.clear();
        dropped
    }

    #[cfg(test)]
    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.order.values().copied()
    }
}
