use std::sync::Arc;
use std::time::Duration;

/// The ordered backoff schedule a service sleeps through between failures.
///
/// Cheap to clone; every worker holds one alongside its own [`RetryState`].
#[derive(Clone, Debug)]
pub struct RetrySchedule {
    intervals: Arc<[Duration]>,
}

impl RetrySchedule {
    pub fn new(intervals: Vec<Duration>) -> Self {
        let intervals = if intervals.is_empty() {
            // An empty schedule would stall the retry loop.
            vec![Duration::from_secs(5)]
        } else {
            intervals
        };

        RetrySchedule {
            intervals: intervals.into(),
        }
    }

    fn len(&self) -> usize {
        self.intervals.len()
    }

    fn interval_at(&self, index: usize) -> Duration {
        self.intervals[index % self.intervals.len()]
    }
}

/// Per-worker position in the retry schedule.
///
/// The index advances on every failure and wraps after the last entry; it is
/// deliberately not reset on success, matching the consumer's historical
/// behaviour.
#[derive(Debug, Default)]
pub struct RetryState {
    index: usize,
}

impl RetryState {
    /// The interval to sleep for the current failure; advances the index.
    pub fn next_interval(&mut self, schedule: &RetrySchedule) -> Duration {
        let interval = schedule.interval_at(self.index);
        self.index = (self.index + 1) % schedule.len();
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kth_failure_sleeps_k_mod_n() {
        let schedule = RetrySchedule::new(vec![
            Duration::from_secs(5),
            Duration::from_secs(15),
            Duration::from_secs(30),
        ]);
        let mut state = RetryState::default();

        let observed: Vec<_> = (0..7).map(|_| state.next_interval(&schedule)).collect();
        let expected: Vec<_> = [5, 15, 30, 5, 15, 30, 5]
            .into_iter()
            .map(Duration::from_secs)
            .collect();

        assert_eq!(observed, expected);
    }

    #[test]
    fn index_persists_across_messages() {
        let schedule = RetrySchedule::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
        ]);
        let mut state = RetryState::default();

        // First message fails once...
        assert_eq!(state.next_interval(&schedule), Duration::from_secs(1));
        // ...and the next message's first failure continues from there.
        assert_eq!(state.next_interval(&schedule), Duration::from_secs(2));
    }

    #[test]
    fn empty_schedule_falls_back_to_a_sane_interval() {
        let schedule = RetrySchedule::new(Vec::new());
        let mut state = RetryState::default();
        assert_eq!(state.next_interval(&schedule), Duration::from_secs(5));
    }
}
