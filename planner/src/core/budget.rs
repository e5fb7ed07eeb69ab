//! Shared time budget helpers for sandbox runs.

use std::time::{Duration, Instant};

/// Time left until `deadline`, saturating at zero.
pub fn remaining(deadline: Instant) -> Duration {
    deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO)
}

/// The earlier of an optional existing deadline and `now + timeout`.
pub fn tighten(deadline: Option<Instant>, timeout: Duration) -> Instant {
    let candidate = Instant::now() + timeout;
    match deadline {
        Some(existing) if existing < candidate => existing,
        _ => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_has_no_budget() {
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(remaining(past), Duration::ZERO);
    }

    #[test]
    fn tighten_keeps_earlier_deadline() {
        let soon = Instant::now() + Duration::from_secs(1);
        assert_eq!(tighten(Some(soon), Duration::from_secs(60)), soon);
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(tighten(Some(later), Duration::from_secs(1)) < later);
        assert!(remaining(tighten(None, Duration::from_secs(60))) > Duration::from_secs(30));
    }
}
