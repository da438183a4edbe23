use std::collections::BTreeSet;

/// Dense id pool. Ids start at 1; freed ids are handed out again before the
/// counter grows, smallest first.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u32,
    free: BTreeSet<u32>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            free: BTreeSet::new(),
        }
    }

    pub fn grab_next_id(&mut self) -> u32 {
        if let Some(id) = self.free.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Return `id` to the pool. Ids that were never handed out, or are already
    /// free, are ignored and `false` is returned.
    pub fn free_id(&mut self, id: u32) -> bool {
        if id == 0 || id >= self.next || !self.free.insert(id) {
            return false;
        }
        // Shrink the counter over a free tail so the pool stays dense.
        while self.next > 1 && self.free.remove(&(self.next - 1)) {
            self.next -= 1;
        }
        true
    }

    pub fn in_use(&self) -> usize {
        (self.next - 1) as usize - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_dense_ids_from_one() {
        let mut ids = IdAllocator::new();
        assert_eq!(
            (0..4).map(|_| ids.grab_next_id()).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(ids.in_use(), 4);
    }

    #[test]
    fn reuses_smallest_free_id() {
        let mut ids = IdAllocator::new();
        for _ in 0..5 {
            ids.grab_next_id();
        }
        assert!(ids.free_id(4));
        assert!(ids.free_id(2));
        assert_eq!(ids.grab_next_id(), 2);
        assert_eq!(ids.grab_next_id(), 4);
        assert_eq!(ids.grab_next_id(), 6);
    }

    #[test]
    fn freeing_the_tail_rewinds_the_counter() {
        let mut ids = IdAllocator::new();
        for _ in 0..3 {
            ids.grab_next_id();
        }
        ids.free_id(2);
        ids.free_id(3);
        assert_eq!(ids.in_use(), 1);
        assert_eq!(ids.grab_next_id(), 2);
        assert_eq!(ids.grab_next_id(), 3);
        assert_eq!(ids.grab_next_id(), 4);
    }

    #[test]
    fn ignores_unknown_and_double_frees() {
        let mut ids = IdAllocator::new();
        ids.grab_next_id();
        ids.grab_next_id();
        assert!(!ids.free_id(0));
        assert!(!ids.free_id(9));
        assert!(ids.free_id(1));
        assert!(!ids.free_id(1));
        assert_eq!(ids.grab_next_id(), 1);
    }
}
