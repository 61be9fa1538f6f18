// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background loops that detect abandoned or due work and re-drive it.
//!
//! ```text
//!                       ┌──────────────────────┐
//!                       │   ReplicaWatchdog    │  one per process
//!                       │ heartbeat + strikes  │
//!                       └──────────┬───────────┘
//!                                  │ watch<ReplicaAssignment>
//!          ┌───────────────┬───────┴───────┬─────────────────┐
//!          ▼               ▼               ▼                 ▼
//!   CrashedWatchdog  PostponedWatchdog  SuspendedWatchdog  RetentionWatchdog
//!          │               │               │           one set per function type
//!          └───────────────┴───────┬───────┘
//!                                  ▼
//!                   restart_execution(expected_epoch)
//!                   + background re-invocation
//! ```
//!
//! Every restart is conditioned on the epoch observed during the scan, so a
//! function scanned by two replicas at once is still resumed by only one.

pub mod replica;

mod crashed;
mod postponed;
mod retention;
mod suspended;

pub use replica::{ReplicaAssignment, ReplicaWatchdog, shard};

pub(crate) use crashed::CrashedWatchdog;
pub(crate) use postponed::PostponedWatchdog;
pub(crate) use retention::RetentionWatchdog;
pub(crate) use suspended::SuspendedWatchdog;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::sink::{Component, ExceptionSink, FrameworkError};
use crate::store::{StatusEntry, Stores};
use crate::types::{Epoch, FunctionId, FunctionTypeId};

/// Takes over a function at `expected_epoch` and runs it in the background.
///
/// The permit bounds concurrent re-invocations and must be held until the
/// background run finishes.
#[async_trait]
pub(crate) trait ReInvoker: Send + Sync {
    async fn restart(
        self: Arc<Self>,
        function_id: FunctionId,
        expected_epoch: Epoch,
        permit: OwnedSemaphorePermit,
    ) -> Result<()>;
}

/// Shared dependencies of the per-type watchdogs.
pub(crate) struct WatchdogContext {
    pub type_id: FunctionTypeId,
    pub stores: Stores,
    pub reinvoker: Arc<dyn ReInvoker>,
    pub assignment: watch::Receiver<ReplicaAssignment>,
    pub clock: Arc<dyn Clock>,
    pub sink: ExceptionSink,
    pub permits: Arc<Semaphore>,
    pub shutdown: CancellationToken,
}

impl WatchdogContext {
    /// Whether this replica is responsible for `function_id` right now.
    pub fn owns(&self, function_id: &FunctionId) -> bool {
        self.assignment.borrow().owns(function_id)
    }

    /// Restart `entry` at its scanned epoch. Ownership loss is expected and
    /// skipped; anything else goes to the sink. Returns whether the scan may
    /// continue.
    pub async fn resume(&self, entry: &StatusEntry, component: Component) -> bool {
        let permit = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => return false,

            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        match self
            .reinvoker
            .clone()
            .restart(entry.function_id.clone(), entry.epoch, permit)
            .await
        {
            Ok(()) => {
                info!(
                    component = %component,
                    function_id = %entry.function_id,
                    epoch = entry.epoch + 1,
                    "Function resumed"
                );
            }
            Err(e) if e.is_ownership_loss() => {
                debug!(
                    component = %component,
                    function_id = %entry.function_id,
                    expected_epoch = entry.epoch,
                    "Function taken over elsewhere, skipping"
                );
            }
            Err(e) => {
                self.sink.report(
                    FrameworkError::new(component, format!("failed to resume function: {e}"))
                        .with_function(&entry.function_id),
                );
            }
        }
        true
    }
}

/// Drive `check` every `frequency` until `shutdown` fires.
///
/// A zero frequency disables the loop. Check failures are reported and the
/// loop keeps going.
pub(crate) async fn run_loop<F, Fut>(
    component: Component,
    type_id: Option<FunctionTypeId>,
    frequency: Duration,
    delay_startup: Duration,
    shutdown: CancellationToken,
    sink: ExceptionSink,
    mut check: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if frequency.is_zero() {
        debug!(component = %component, "Watchdog disabled");
        return;
    }

    if !delay_startup.is_zero() {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return,

            _ = tokio::time::sleep(delay_startup) => {}
        }
    }

    info!(
        component = %component,
        type_id = ?type_id.as_ref().map(|t| t.as_str()),
        interval_ms = frequency.as_millis() as u64,
        "Watchdog started"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                break;
            }

            _ = tokio::time::sleep(frequency) => {
                if let Err(e) = check().await {
                    let mut report = FrameworkError::new(component, format!("check failed: {e}"));
                    if let Some(type_id) = &type_id {
                        report = report.with_type(type_id);
                    }
                    sink.report(report);
                }
            }
        }
    }

    info!(component = %component, "Watchdog stopped");
}
