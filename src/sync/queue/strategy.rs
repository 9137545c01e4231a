//! What a bounded queue does with an item that does not fit.

use super::ring_buffer::RingBuffer;

/// The surplus policy of a bounded [`Queue`](super::Queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Suspend the offering fiber until there is room.
    BackPressure,
    /// Discard the new item; the offer reports `false`.
    Dropping,
    /// Discard the oldest buffered item to make room.
    Sliding,
}

/// The result of [`Strategy::handle_surplus`].
#[derive(Debug)]
pub(super) enum Surplus<A> {
    /// The item is in the buffer.
    Accepted,
    /// The item was discarded.
    Dropped,
    /// The offering fiber has to wait with its item.
    Park(A),
}

impl Strategy {
    /// Deals with `item` when `buffer` is full.
    pub(super) fn handle_surplus<A>(self, buffer: &mut RingBuffer<A>, item: A) -> Surplus<A> {
        match self {
            Self::BackPressure => Surplus::Park(item),
            Self::Dropping => Surplus::Dropped,
            Self::Sliding => {
                buffer.poll();
                match buffer.offer(item) {
                    Ok(()) => Surplus::Accepted,
                    Err(_) => Surplus::Dropped,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn sliding_discards_the_oldest_item() {
        let mut buffer = RingBuffer::bounded(2);
        buffer.offer(1).expect("room");
        buffer.offer(2).expect("room");
        assert!(matches!(
            Strategy::Sliding.handle_surplus(&mut buffer, 3),
            Surplus::Accepted
        ));
        assert_eq!(buffer.poll_up_to(2), vec![2, 3]);
    }

    #[rstest]
    #[case(Strategy::Dropping)]
    #[case(Strategy::BackPressure)]
    fn other_strategies_leave_the_buffer_alone(#[case] strategy: Strategy) {
        let mut buffer = RingBuffer::bounded(1);
        buffer.offer(1).expect("room");
        let surplus = strategy.handle_surplus(&mut buffer, 2);
        assert!(matches!(surplus, Surplus::Dropped | Surplus::Park(2)));
        assert_eq!(buffer.poll_up_to(2), vec![1]);
    }
}
