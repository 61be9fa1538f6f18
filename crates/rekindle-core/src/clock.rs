// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wall-clock abstraction.
//!
//! Watchdogs and the in-memory store read time through [`Clock`] so that tests
//! can drive postponement and crash detection with a [`ManualClock`].

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock fixed at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock fixed at the current system time.
    pub fn at_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = saturating_add(*now, by);
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Convert a std duration into a chrono delta, saturating at `TimeDelta::MAX`.
pub(crate) fn to_time_delta(duration: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}

/// `at + duration`, clamped to the latest representable instant.
pub(crate) fn saturating_add(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_time_delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_when_advanced() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(6));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(6));
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::at_now();
        let target = Utc::now() + chrono::Duration::days(1);
        clock.set(target);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn test_to_time_delta_saturates() {
        assert_eq!(to_time_delta(Duration::MAX), chrono::TimeDelta::MAX);
        assert_eq!(
            to_time_delta(Duration::from_secs(90)),
            chrono::Duration::seconds(90)
        );
    }

    #[test]
    fn test_far_future_clamps_instead_of_overflowing() {
        let now = Utc::now();
        // Centuries past the calendar range but within TimeDelta's.
        let far = Duration::from_millis(10u64.pow(16));
        assert_eq!(saturating_add(now, far), DateTime::<Utc>::MAX_UTC);
        assert_eq!(saturating_add(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);

        let clock = ManualClock::new(now);
        clock.advance(far);
        assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
    }
}
