//! Timestamp utilities

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Duration as whole milliseconds, saturating at `u64::MAX`
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Add a std duration to a UTC timestamp, saturating on overflow
pub fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Wall-clock timestamps that follow tokio's clock
///
/// Anchored to `Utc::now()` at construction and advanced by
/// `tokio::time::Instant`, so TTLs and retention windows run on the same
/// clock as deadlines, including paused test time.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        add_duration(self.anchor_wall, self.anchor.elapsed())
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip_is_exact() {
        let millis = 12345u64;
        assert_eq!(duration_to_millis(millis_to_duration(millis)), millis);
    }

    #[test]
    fn test_duration_to_millis_saturates() {
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_add_duration_advances_timestamp() {
        let start = Utc::now();
        let later = add_duration(start, Duration::from_secs(3600));
        assert_eq!((later - start).num_seconds(), 3600);
    }

    #[test]
    fn test_add_duration_saturates_on_overflow() {
        let start = Utc::now();
        assert_eq!(add_duration(start, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_follows_paused_time() {
        let clock = WallClock::new();
        let start = clock.now();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }
}
