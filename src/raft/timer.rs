use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::raft::message::Timer;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Deadlines for the named timers a node has armed.
///
/// Arming a timer that is already pending replaces its deadline, so at most
/// one instance of each timer exists.
#[derive(Debug, Default)]
pub struct TimerSet {
    deadlines: HashMap<Timer, Instant>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, timer: Timer, after: Duration) {
        self.deadlines.insert(timer, Instant::now() + after);
    }

    pub fn cancel(&mut self, timer: Timer) {
        self.deadlines.remove(&timer);
    }

    /// Earliest pending timer and its deadline.
    pub fn next_deadline(&self) -> Option<(Timer, Instant)> {
        self.deadlines
            .iter()
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(timer, deadline)| (*timer, *deadline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_timeout_in_range() {
        for _ in 0..100 {
            let timeout = random_election_timeout(150, 300);
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout <= Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_deadline() {
        let mut timers = TimerSet::new();
        timers.arm(Timer::Election, Duration::from_millis(100));
        timers.arm(Timer::Election, Duration::from_millis(500));
        timers.arm(Timer::Heartbeat, Duration::from_millis(200));

        let (timer, _) = timers.next_deadline().unwrap();
        assert_eq!(timer, Timer::Heartbeat);

        timers.cancel(Timer::Heartbeat);
        let (timer, deadline) = timers.next_deadline().unwrap();
        assert_eq!(timer, Timer::Election);
        assert_eq!(
            deadline,
            tokio::time::Instant::now() + Duration::from_millis(500)
        );

        timers.cancel(Timer::Election);
        assert!(timers.next_deadline().is_none());
    }
}
