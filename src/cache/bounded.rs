use std::collections::VecDeque;

/// Fixed-capacity, insertion-ordered ring buffer. Oldest entry is evicted on overflow.
#[derive(Debug, Clone)]
pub struct BoundedSequence<T> {
    items: VecDeque<T>,
    capacity: usize,
    new_updates: usize,
}

impl<T> BoundedSequence<T> {
    pub fn new(capacity: usize) -> Self {
        // A zero-capacity tape would drop everything, clamp to one slot.
        let capacity = capacity.max(1);
        Self { items: VecDeque::with_capacity(capacity), capacity, new_updates: 0 }
    }

    pub fn append(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
        self.new_updates = (self.new_updates + 1).min(self.capacity);
    }

    /// Number of items appended since the previous call, capped at what is still held.
    pub fn take_new_updates(&mut self) -> usize {
        std::mem::take(&mut self.new_updates)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BoundedSequence<T> {
    /// Current contents, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn test_evicts_oldest() {
        let mut seq = BoundedSequence::new(3);
        for x in ["A", "B", "C", "D"] {
            seq.append(x);
        }
        assert_eq!(seq.to_vec(), vec!["B", "C", "D"]);
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut seq = BoundedSequence::new(0);
        seq.append(1);
        seq.append(2);
        assert_eq!(seq.capacity(), 1);
        assert_eq!(seq.to_vec(), vec![2]);
    }

    #[test]
    fn test_new_updates_counter() {
        let mut seq = BoundedSequence::new(2);
        seq.append(1);
        seq.append(2);
        seq.append(3);
        // three appends, only two survive
        assert_eq!(seq.take_new_updates(), 2);
        assert_eq!(seq.take_new_updates(), 0);
        seq.append(4);
        assert_eq!(seq.take_new_updates(), 1);
        assert_eq!(seq.last(), Some(&4));
    }

    quickcheck! {
        fn prop_keeps_most_recent(items: Vec<u32>, cap: u8) -> bool {
            let cap = (cap as usize % 16) + 1;
            let mut seq = BoundedSequence::new(cap);
            for &x in &items {
                seq.append(x);
            }
            let expected: Vec<u32> = items.iter().skip(items.len().saturating_sub(cap)).cloned().collect();
            seq.len() == items.len().min(cap) && seq.to_vec() == expected
        }
    }
}
