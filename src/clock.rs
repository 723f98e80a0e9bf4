//! Paired monotonic/wall-clock timestamps
//!
//! Every decision in the controller core takes a [`Moment`] instead of reading
//! the clock itself. Timers and debounce windows use the monotonic half; planner
//! windows, cooldowns that must survive restarts and midnight rollover use the
//! wall half.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    pub mono: Instant,
    pub wall: DateTime<Utc>,
}

impl Moment {
    pub fn now() -> Self {
        Self {
            mono: Instant::now(),
            wall: Utc::now(),
        }
    }

    pub const fn at(mono: Instant, wall: DateTime<Utc>) -> Self {
        Self { mono, wall }
    }

    /// Both clocks advanced by the same amount
    #[must_use]
    pub fn after(&self, d: Duration) -> Self {
        let wall = chrono::Duration::from_std(d)
            .ok()
            .and_then(|cd| self.wall.checked_add_signed(cd))
            .unwrap_or(self.wall);
        Self {
            mono: self.mono + d,
            wall,
        }
    }

    #[must_use]
    pub fn after_secs(&self, secs: u64) -> Self {
        self.after(Duration::from_secs(secs))
    }

    /// Monotonic instant corresponding to a wall-clock timestamp.
    ///
    /// Timestamps in the past map to "now"; used to rebuild deadlines from
    /// persisted wall-clock values.
    pub fn mono_for(&self, wall: DateTime<Utc>) -> Instant {
        match (wall - self.wall).to_std() {
            Ok(ahead) => self.mono + ahead,
            Err(_) => self.mono,
        }
    }

    /// Wall-clock timestamp for a monotonic instant
    pub fn wall_for(&self, mono: Instant) -> DateTime<Utc> {
        if mono >= self.mono {
            let ahead = chrono::Duration::from_std(mono - self.mono).unwrap_or_else(|_| chrono::Duration::zero());
            self.wall + ahead
        } else {
            let behind = chrono::Duration::from_std(self.mono - mono).unwrap_or_else(|_| chrono::Duration::zero());
            self.wall - behind
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_moves_both_clocks() {
        let m = Moment::now();
        let later = m.after_secs(90);
        assert_eq!(later.mono - m.mono, Duration::from_secs(90));
        assert_eq!((later.wall - m.wall).num_seconds(), 90);
    }

    #[test]
    fn mono_for_past_timestamp_is_now() {
        let m = Moment::now();
        let past = m.wall - chrono::Duration::seconds(30);
        assert_eq!(m.mono_for(past), m.mono);
        let future = m.wall + chrono::Duration::seconds(30);
        assert_eq!(m.mono_for(future) - m.mono, Duration::from_secs(30));
    }

    #[test]
    fn wall_for_roundtrips_offsets() {
        let m = Moment::now();
        let ahead = m.mono + Duration::from_secs(12);
        assert_eq!((m.wall_for(ahead) - m.wall).num_seconds(), 12);
    }
}
