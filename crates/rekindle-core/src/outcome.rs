// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::saturating_add;
use crate::types::StoredError;

/// What a handler asks the runtime to do with its function instance.
///
/// Returning `Err` from a handler (or panicking) is equivalent to `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Finished with a result.
    Completed(T),
    /// Park until the given time; the postponed watchdog resumes it.
    Postponed(DateTime<Utc>),
    /// Park until the message log holds at least this many messages.
    Suspended(i64),
    /// Finished with an error.
    Failed(StoredError),
}

impl<T> Outcome<T> {
    /// Complete with `value`.
    pub fn completed(value: T) -> Self {
        Self::Completed(value)
    }

    /// Postpone until `until`.
    pub fn postpone_until(until: DateTime<Utc>) -> Self {
        Self::Postponed(until)
    }

    /// Postpone for `delay` counted from `now`. Delays past the calendar
    /// range postpone until the latest representable instant.
    pub fn postpone_for(now: DateTime<Utc>, delay: Duration) -> Self {
        Self::Postponed(saturating_add(now, delay))
    }

    /// Suspend until `expected_interrupt_count` messages have been appended.
    pub fn suspend_until(expected_interrupt_count: i64) -> Self {
        Self::Suspended(expected_interrupt_count)
    }

    /// Fail with a handler error.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Failed(StoredError::new("handler", message))
    }

    /// Whether the function will reach a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

impl<T> From<T> for Outcome<T> {
    fn from(value: T) -> Self {
        Self::Completed(value)
    }
}
