//! The buffer behind a [`Queue`](super::Queue).

use std::collections::VecDeque;

/// A FIFO ring buffer with an optional capacity. It never holds more than
/// its capacity.
#[derive(Debug)]
pub(super) struct RingBuffer<A> {
    items: VecDeque<A>,
    capacity: Option<usize>,
}

impl<A> RingBuffer<A> {
    pub(super) fn bounded(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    pub(super) fn unbounded() -> Self {
        Self {
            items: VecDeque::new(),
            capacity: None,
        }
    }

    pub(super) const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub(super) fn len(&self) -> usize {
        self.items.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(super) fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|capacity| self.items.len() >= capacity)
    }

    /// Appends `item`, or hands it back if the buffer is full.
    pub(super) fn offer(&mut self, item: A) -> Result<(), A> {
        if self.is_full() {
            Err(item)
        } else {
            self.items.push_back(item);
            Ok(())
        }
    }

    /// Puts `item` back at the head, or hands it back if the buffer is full.
    pub(super) fn push_front(&mut self, item: A) -> Result<(), A> {
        if self.is_full() {
            Err(item)
        } else {
            self.items.push_front(item);
            Ok(())
        }
    }

    pub(super) fn poll(&mut self) -> Option<A> {
        self.items.pop_front()
    }

    pub(super) fn poll_up_to(&mut self, limit: usize) -> Vec<A> {
        let count = limit.min(self.items.len());
        self.items.drain(..count).collect()
    }

    pub(super) fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn bounded_buffer_rejects_when_full() {
        let mut buffer = RingBuffer::bounded(2);
        assert_eq!(buffer.offer(1), Ok(()));
        assert_eq!(buffer.offer(2), Ok(()));
        assert_eq!(buffer.offer(3), Err(3));
        assert!(buffer.is_full());
        assert_eq!(buffer.poll(), Some(1));
        assert_eq!(buffer.offer(3), Ok(()));
        assert_eq!(buffer.poll_up_to(5), vec![2, 3]);
        assert!(buffer.is_empty());
    }

    #[rstest]
    fn push_front_respects_the_capacity() {
        let mut buffer = RingBuffer::bounded(2);
        assert_eq!(buffer.offer(2), Ok(()));
        assert_eq!(buffer.push_front(1), Ok(()));
        assert_eq!(buffer.push_front(0), Err(0));
        assert_eq!(buffer.poll_up_to(2), vec![1, 2]);
    }

    #[rstest]
    fn unbounded_buffer_never_fills() {
        let mut buffer = RingBuffer::unbounded();
        for item in 0..1_000 {
            assert_eq!(buffer.offer(item), Ok(()));
        }
        assert!(!buffer.is_full());
        assert_eq!(buffer.len(), 1_000);
        assert_eq!(buffer.capacity(), None);
    }
}
