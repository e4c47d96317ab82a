//! Virtual race clock for historical replay.
//!
//! The clock maps real elapsed time onto race time at a fixed speed
//! multiplier. Every [`RaceClock::advance`] returns the half-open window of
//! race time that just elapsed, so consecutive windows tile the timeline
//! with no gaps and no overlap.
//!
//! All arithmetic is checked; an advance that would overflow the timestamp
//! range is an error rather than a wrap.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// Speed multiplier is zero, negative or not a number.
    #[error("invalid replay speed {speed}: must be a positive finite number")]
    InvalidSpeed {
        /// The rejected multiplier.
        speed: f64,
    },

    /// Race time would leave the representable range.
    #[error("race clock overflow")]
    Overflow,
}

/// Half-open race-time interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceWindow {
    /// Inclusive start.
    pub from: DateTime<Utc>,
    /// Exclusive end.
    pub to: DateTime<Utc>,
}

impl RaceWindow {
    /// `true` when the window covers no time.
    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }
}

/// Simulated race time advancing at `speed` times real time.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceClock {
    anchor: DateTime<Utc>,
    current: DateTime<Utc>,
    speed: f64,
}

impl RaceClock {
    /// Start a clock at `anchor`.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidSpeed`] unless `speed` is finite and positive.
    pub fn new(anchor: DateTime<Utc>, speed: f64) -> Result<Self, ClockError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(ClockError::InvalidSpeed { speed });
        }
        Ok(Self {
            anchor,
            current: anchor,
            speed,
        })
    }

    /// Current race time.
    pub const fn now(&self) -> DateTime<Utc> {
        self.current
    }

    /// Race time the clock started from.
    pub const fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    /// Race time elapsed since the anchor.
    pub fn elapsed(&self) -> TimeDelta {
        self.current.signed_duration_since(self.anchor)
    }

    /// Advance by `real` wall-clock time scaled by the speed multiplier.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Overflow`] if the scaled step or the resulting
    /// timestamp is out of range.
    pub fn advance(&mut self, real: Duration) -> Result<RaceWindow, ClockError> {
        let step = self.scale(real)?;
        let from = self.current;
        let to = from.checked_add_signed(step).ok_or(ClockError::Overflow)?;
        self.current = to;
        Ok(RaceWindow { from, to })
    }

    /// Race time left until `end`, clamped at zero.
    pub fn remaining(&self, end: DateTime<Utc>) -> TimeDelta {
        end.signed_duration_since(self.current).max(TimeDelta::zero())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn scale(&self, real: Duration) -> Result<TimeDelta, ClockError> {
        let millis = (real.as_secs_f64() * self.speed * 1000.0).round();
        if !millis.is_finite() || millis > 1.0e15 {
            return Err(ClockError::Overflow);
        }
        // Bounded above, well inside i64.
        TimeDelta::try_milliseconds(millis as i64).ok_or(ClockError::Overflow)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-02T15:03:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn rejects_bad_speed() {
        assert!(RaceClock::new(start(), 0.0).is_err());
        assert!(RaceClock::new(start(), -2.0).is_err());
        assert!(RaceClock::new(start(), f64::INFINITY).is_err());
    }

    #[test]
    fn windows_tile_without_gaps() {
        let mut clock = RaceClock::new(start(), 4.0).unwrap();
        let first = clock.advance(Duration::from_secs(1)).unwrap();
        let second = clock.advance(Duration::from_millis(500)).unwrap();
        assert_eq!(first.from, start());
        assert_eq!(first.to, second.from);
        assert_eq!(second.to - start(), TimeDelta::seconds(6));
        assert_eq!(clock.elapsed(), TimeDelta::seconds(6));
    }

    #[test]
    fn zero_advance_gives_empty_window() {
        let mut clock = RaceClock::new(start(), 1.0).unwrap();
        assert!(clock.advance(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn remaining_clamps_at_zero() {
        let mut clock = RaceClock::new(start(), 10.0).unwrap();
        let end = start() + TimeDelta::seconds(30);
        assert_eq!(clock.remaining(end), TimeDelta::seconds(30));
        clock.advance(Duration::from_secs(5)).unwrap();
        assert_eq!(clock.remaining(end), TimeDelta::zero());
    }
}
