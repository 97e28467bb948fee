//! Bounded recently-seen set for drawing operations.
//!
//! The same operation can arrive over the mesh and again over the relay.
//! Every remote operation passes through one `RecentlySeen` before it is
//! rendered, so each point is drawn once whichever path delivers first.

use std::collections::{HashSet, VecDeque};

use inkboard_core::OperationId;

pub const DEFAULT_CAPACITY: usize = 4096;

/// FIFO-evicting set of operation ids.
#[derive(Debug)]
pub struct RecentlySeen {
    order: VecDeque<OperationId>,
    set: HashSet<OperationId>,
    capacity: usize,
}

impl Default for RecentlySeen {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RecentlySeen {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            set: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Record `id`. Returns `true` the first time an id is seen.
    pub fn check_and_insert(&mut self, id: &OperationId) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.set.insert(id.clone());
        true
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkboard_core::UserId;

    fn id(seq: u64) -> OperationId {
        OperationId::new(UserId::from("a"), 1_000, seq)
    }

    #[test]
    fn test_first_sighting_only() {
        let mut seen = RecentlySeen::default();
        assert!(seen.check_and_insert(&id(0)));
        assert!(!seen.check_and_insert(&id(0)));
        assert!(seen.check_and_insert(&id(1)));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_same_timestamp_different_users() {
        let mut seen = RecentlySeen::default();
        let a = OperationId::new(UserId::from("a"), 5, 0);
        let b = OperationId::new(UserId::from("b"), 5, 0);
        assert!(seen.check_and_insert(&a));
        assert!(seen.check_and_insert(&b));
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let mut seen = RecentlySeen::new(3);
        for seq in 0..4 {
            assert!(seen.check_and_insert(&id(seq)));
        }
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(&id(0)));
        assert!(seen.contains(&id(3)));
        // Evicted ids count as new again.
        assert!(seen.check_and_insert(&id(0)));
    }

    #[test]
    fn test_clear() {
        let mut seen = RecentlySeen::new(8);
        seen.check_and_insert(&id(0));
        seen.clear();
        assert!(seen.is_empty());
        assert!(seen.check_and_insert(&id(0)));
    }
}
