//! Fixed-capacity FIFO used to retain the most recent output lines.
//!
//! The backing store is allocated once in [`CircularBuffer::new`]; pushes
//! past capacity overwrite the oldest slot instead of shifting or
//! reallocating, so memory stays bounded no matter how much a process prints.

#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    size: usize,
}

impl<T> CircularBuffer<T> {
    /// Create a buffer holding at most `capacity` items.
    ///
    /// A zero capacity is bumped to one so `push` always has a slot to write.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            tail: 0,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size == self.slots.len()
    }

    /// Append `item`, evicting the oldest entry when the buffer is full.
    pub fn push(&mut self, item: T) {
        let capacity = self.slots.len();
        if let Some(slot) = self.slots.get_mut(self.tail) {
            *slot = Some(item);
        }
        self.tail = (self.tail + 1) % capacity;
        if self.size == capacity {
            self.head = (self.head + 1) % capacity;
        } else {
            self.size += 1;
        }
    }

    /// Iterate from oldest to newest without copying.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.slots.len();
        (0..self.size).filter_map(move |offset| {
            self.slots
                .get((self.head + offset) % capacity)
                .and_then(Option::as_ref)
        })
    }

    /// Reset the logical pointers. Storage is kept for reuse; stale slots are
    /// overwritten by later pushes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.size = 0;
    }
}

impl<T: Clone> CircularBuffer<T> {
    /// Items from oldest to newest.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::CircularBuffer;

    #[test]
    fn keeps_last_items_when_over_capacity() {
        let mut buffer = CircularBuffer::new(3);
        for value in 1..=5 {
            buffer.push(value);
        }
        assert_eq!(buffer.to_vec(), vec![3, 4, 5]);
        assert_eq!(buffer.len(), 3);
        assert!(buffer.is_full());
    }

    #[test]
    fn long_runs_retain_only_the_tail() {
        let mut buffer = CircularBuffer::new(5);
        for value in 1..=100 {
            buffer.push(value);
        }
        assert_eq!(buffer.to_vec(), vec![96, 97, 98, 99, 100]);
    }

    #[test]
    fn partial_fill_preserves_push_order() {
        let mut buffer = CircularBuffer::new(4);
        assert!(buffer.is_empty());
        buffer.push("a");
        buffer.push("b");
        assert_eq!(buffer.to_vec(), vec!["a", "b"]);
        assert!(!buffer.is_full());
    }

    #[test]
    fn clear_keeps_capacity_and_allows_reuse() {
        let mut buffer = CircularBuffer::new(2);
        buffer.push(1);
        buffer.push(2);
        buffer.push(3);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 2);
        assert!(buffer.to_vec().is_empty());

        buffer.push(9);
        assert_eq!(buffer.to_vec(), vec![9]);
    }

    #[test]
    fn zero_capacity_behaves_like_one() {
        let mut buffer = CircularBuffer::new(0);
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.to_vec(), vec![2]);
        assert_eq!(buffer.capacity(), 1);
    }
}
