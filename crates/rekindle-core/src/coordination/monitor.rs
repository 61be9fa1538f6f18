// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed mutual-exclusion lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::store::{RegisterKind, UnderlyingRegister};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Lock over `(group, name)` keys held in the register.
///
/// Acquisition is re-entrant for the same holder token: a function that crashed
/// while holding a lock re-acquires it after restart by presenting the same token.
#[derive(Clone)]
pub struct Monitor {
    register: Arc<dyn UnderlyingRegister>,
    retry_interval: Duration,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Create a monitor polling every 100ms while contended.
    pub fn new(register: Arc<dyn UnderlyingRegister>) -> Self {
        Self {
            register,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Override the polling interval used while waiting for a held lock.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Acquire the lock for `holder`.
    ///
    /// Succeeds if the key is free or already held by `holder`. With
    /// `max_wait = None` waits indefinitely, with `Some(Duration::ZERO)` makes a
    /// single attempt. Waits too long to represent as a deadline are treated
    /// like `None`. Returns `None` when the wait elapsed.
    pub async fn acquire(
        &self,
        group: &str,
        name: &str,
        holder: &str,
        max_wait: Option<Duration>,
    ) -> Result<Option<MonitorLock>> {
        // A wait past the representable range means no deadline.
        let deadline = max_wait.and_then(|wait| Instant::now().checked_add(wait));

        loop {
            let acquired = self
                .register
                .compare_and_swap(RegisterKind::Monitor, group, name, holder, holder, true)
                .await?;
            if acquired {
                debug!(group, name, holder, "Monitor lock acquired");
                return Ok(Some(MonitorLock {
                    register: self.register.clone(),
                    group: group.to_string(),
                    name: name.to_string(),
                    holder: holder.to_string(),
                }));
            }

            let sleep_for = match deadline {
                None => self.retry_interval,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!(group, name, holder, "Monitor lock wait elapsed");
                        return Ok(None);
                    }
                    remaining.min(self.retry_interval)
                }
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Whether any holder currently owns `(group, name)`.
    pub async fn is_locked(&self, group: &str, name: &str) -> Result<bool> {
        self.register.exists(RegisterKind::Monitor, group, name).await
    }
}

/// Held monitor lock. Must be released explicitly; dropping it keeps the lock
/// held so that a restarted execution can re-acquire it with the same token.
#[must_use = "a lock that is never released stays held"]
pub struct MonitorLock {
    register: Arc<dyn UnderlyingRegister>,
    group: String,
    name: String,
    holder: String,
}

impl std::fmt::Debug for MonitorLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorLock")
            .field("group", &self.group)
            .field("name", &self.name)
            .field("holder", &self.holder)
            .finish()
    }
}

impl MonitorLock {
    /// Group of the locked key.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Name of the locked key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token of the holder.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release the lock. Returns false if it was no longer held by this holder.
    pub async fn release(self) -> Result<bool> {
        let released = self
            .register
            .delete(
                RegisterKind::Monitor,
                &self.group,
                &self.name,
                Some(&self.holder),
            )
            .await?;
        debug!(group = %self.group, name = %self.name, released, "Monitor lock released");
        Ok(released)
    }
}
