//! Fixed-capacity ring buffer used by the spike filter and the
//! clock-quality aggregator.
//!
//! Writes are O(1) and always succeed by overwriting the oldest slot once
//! the buffer is full. The write cursor is `writes mod capacity`.

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    cursor: usize,
    writes: u64,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        RingBuffer {
            slots: vec![None; capacity],
            cursor: 0,
            writes: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.writes >= self.capacity() as u64
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, value: T) {
        let cap = self.capacity();
        self.slots[self.cursor] = Some(value);
        self.cursor = (self.cursor + 1) % cap;
        self.writes += 1;
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.cursor = 0;
        self.writes = 0;
    }

    /// Oldest-first iteration over whatever is currently populated.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = &T> {
        let cap = self.capacity();
        let start = if self.is_full() { self.cursor } else { 0 };
        (0..cap)
            .map(move |i| &self.slots[(start + i) % cap])
            .filter_map(|slot| slot.as_ref())
    }

    /// Materialized-as-is snapshot (insertion order within the slot array,
    /// including `None` holes before the buffer first fills).
    pub fn snapshot(&self) -> Vec<Option<T>> {
        self.slots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_n_most_recent() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(3);
        for v in 0..7 {
            rb.push(v);
        }
        let vals: Vec<i32> = rb.iter_oldest_first().cloned().collect();
        assert_eq!(vals, vec![4, 5, 6]);
    }

    #[test]
    fn cursor_matches_writes_mod_capacity() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(4);
        for v in 0..10 {
            rb.push(v);
        }
        assert_eq!(rb.cursor, 10 % 4);
    }

    #[test]
    fn not_full_until_n_writes() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(5);
        for v in 0..4 {
            rb.push(v);
            assert!(!rb.is_full());
        }
        rb.push(4);
        assert!(rb.is_full());
    }
}
