use std::collections::{HashSet, VecDeque};

use super::entry::Priority;

/// One FIFO queue per priority tier, deduplicated by id.
#[derive(Debug, Default)]
pub(crate) struct PriorityQueues {
    tiers: [VecDeque<String>; 5],
    queued: HashSet<String>,
}

impl PriorityQueues {
    /// Returns false if the id was already queued.
    pub(crate) fn push(&mut self, id: &str, priority: Priority) -> bool {
        if !self.queued.insert(id.to_string()) {
            return false;
        }
        self.tiers[priority.index()].push_back(id.to_string());
        true
    }

    pub(crate) fn pop(&mut self, priority: Priority) -> Option<String> {
        let id = self.tiers[priority.index()].pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.queued.len()
    }

    pub(crate) fn tier_len(&self, priority: Priority) -> usize {
        self.tiers[priority.index()].len()
    }

    pub(crate) fn clear(&mut self) {
        self.tiers.iter_mut().for_each(VecDeque::clear);
        self.queued.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_per_tier_and_dedup() {
        let mut queues = PriorityQueues::default();
        assert!(queues.push("a", Priority::Low));
        assert!(queues.push("b", Priority::Low));
        assert!(!queues.push("a", Priority::Low));
        assert!(queues.push("c", Priority::Critical));

        assert_eq!(queues.len(), 3);
        assert_eq!(queues.tier_len(Priority::Low), 2);
        assert_eq!(queues.pop(Priority::Low).as_deref(), Some("a"));
        assert_eq!(queues.pop(Priority::Critical).as_deref(), Some("c"));
        assert_eq!(queues.pop(Priority::Critical), None);

        // Popped ids may be queued again.
        assert!(queues.push("a", Priority::Low));
        queues.clear();
        assert_eq!(queues.len(), 0);
    }
}
