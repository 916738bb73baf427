//! Deadline arithmetic for bounded loops.

use std::time::{Duration, Instant};

/// True once `now` has reached `started + budget`.
pub fn exhausted(started: Instant, budget: Duration, now: Instant) -> bool {
    now.saturating_duration_since(started) >= budget
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_is_inclusive_of_the_budget() {
        let start = Instant::now();
        let budget = Duration::from_millis(300);
        assert!(!exhausted(start, budget, start + Duration::from_millis(299)));
        assert!(exhausted(start, budget, start + budget));
    }
}
