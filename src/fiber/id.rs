//! Fiber identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identifies a fiber by its start time and a process-wide sequence number.
///
/// Ids are totally ordered by `(start_time_millis, sequence)`.
/// [`FiberId::NONE`] stands for interruption issued from outside any fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    start_time_millis: u64,
    sequence: u64,
}

impl FiberId {
    /// The id used when no fiber is responsible.
    pub const NONE: Self = Self {
        start_time_millis: 0,
        sequence: 0,
    };

    /// Creates an id from its raw parts.
    pub const fn new(start_time_millis: u64, sequence: u64) -> Self {
        Self {
            start_time_millis,
            sequence,
        }
    }

    pub(crate) fn next() -> Self {
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let start_time_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        Self {
            start_time_millis,
            sequence,
        }
    }

    /// Milliseconds since the Unix epoch at which the fiber was created.
    pub const fn start_time_millis(&self) -> u64 {
        self.start_time_millis
    }

    /// The process-wide creation sequence number.
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns `true` for [`FiberId::NONE`].
    pub const fn is_none(&self) -> bool {
        self.start_time_millis == 0 && self.sequence == 0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "#{}", self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn ids_are_unique_and_increasing() {
        let first = FiberId::next();
        let second = FiberId::next();
        assert_ne!(first, second);
        assert!(first.sequence() < second.sequence());
        assert!(!first.is_none());
    }

    #[rstest]
    fn ordering_compares_time_first() {
        let earlier = FiberId::new(1, 100);
        let later = FiberId::new(2, 1);
        assert!(earlier < later);
    }

    #[rstest]
    fn display_shows_sequence() {
        assert_eq!(FiberId::new(5, 42).to_string(), "#42");
    }
}
