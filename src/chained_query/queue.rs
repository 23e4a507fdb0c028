//! Ordered registry of operations waiting for their turn

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::QueryKey;

/// Activation callback handed to the sequencer.
///
/// May be called more than once; it must not re-enter the sequencer.
pub type GrantFn = Arc<dyn Fn() + Send + Sync>;

/// One registered operation
#[derive(Clone)]
pub struct QueueEntry {
    pub query_key: QueryKey,
    pub entry_id: Uuid,
    on_granted: GrantFn,
}

impl QueueEntry {
    pub fn new<F>(query_key: QueryKey, entry_id: Uuid, on_granted: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            query_key,
            entry_id,
            on_granted: Arc::new(on_granted),
        }
    }

    pub fn grant(&self) {
        (self.on_granted)();
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("query_key", &self.query_key)
            .field("entry_id", &self.entry_id)
            .finish_non_exhaustive()
    }
}

/// Entries in declaration order. Ids are unique, keys may repeat.
#[derive(Debug, Default)]
pub struct QueryQueue {
    entries: VecDeque<QueueEntry>,
}

impl QueryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    /// Remove an entry wherever it sits. Returns the removed entry.
    pub fn remove(&mut self, entry_id: Uuid) -> Option<QueueEntry> {
        let position = self.position(entry_id)?;
        self.entries.remove(position)
    }

    /// Drop the head
    pub fn shift(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub fn head(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    pub fn position(&self, entry_id: Uuid) -> Option<usize> {
        self.entries.iter().position(|entry| entry.entry_id == entry_id)
    }

    pub fn contains(&self, entry_id: Uuid) -> bool {
        self.position(entry_id).is_some()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|entry| entry.entry_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(name: &str) -> QueueEntry {
        QueueEntry::new(QueryKey::from(name), Uuid::new_v4(), || {})
    }

    #[test]
    fn test_push_keeps_declaration_order() {
        let mut queue = QueryQueue::new();
        let (a, b, c) = (entry("a"), entry("b"), entry("c"));
        let ids = vec![a.entry_id, b.entry_id, c.entry_id];
        queue.push(a);
        queue.push(b);
        queue.push(c);

        assert_eq!(queue.ids(), ids);
        assert_eq!(queue.head().map(|e| e.entry_id), Some(ids[0]));
    }

    #[test]
    fn test_remove_from_middle() {
        let mut queue = QueryQueue::new();
        let (a, b, c) = (entry("a"), entry("b"), entry("c"));
        let (a_id, b_id, c_id) = (a.entry_id, b.entry_id, c.entry_id);
        queue.push(a);
        queue.push(b);
        queue.push(c);

        assert!(queue.remove(b_id).is_some());
        assert!(queue.remove(b_id).is_none());
        assert_eq!(queue.ids(), vec![a_id, c_id]);
        assert!(!queue.contains(b_id));

        assert_eq!(queue.shift().map(|e| e.entry_id), Some(a_id));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_same_key_gets_separate_slots() {
        let mut queue = QueryQueue::new();
        queue.push(entry("same"));
        queue.push(entry("same"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_grant_invokes_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let entry = QueueEntry::new(QueryKey::from("a"), Uuid::new_v4(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        entry.grant();
        entry.grant();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
