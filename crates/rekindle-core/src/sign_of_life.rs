// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-execution heartbeat loop.
//!
//! While a handler runs, [`SignOfLifeUpdater`] periodically writes an increasing
//! beat counter under the execution's epoch. The crashed watchdog treats an
//! unchanged (epoch, beat) pair as evidence that the executor died.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sink::{Component, ExceptionSink, FrameworkError};
use crate::store::FunctionStore;
use crate::types::{Epoch, FunctionId};

/// Lifecycle of a heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOfLifeState {
    /// Not started, or disabled by a zero frequency.
    Idle,
    /// Beating.
    Running,
    /// Disposed, lost ownership, or hit a store error.
    Stopped,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct Shared {
    state: AtomicU8,
    beats: AtomicI64,
}

/// Handle to one execution's heartbeat loop. Dropping it stops the loop.
pub struct SignOfLifeUpdater {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SignOfLifeUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignOfLifeUpdater")
            .field("state", &self.state())
            .field("beats", &self.beats())
            .finish()
    }
}

impl SignOfLifeUpdater {
    /// Start heartbeating `function_id` at `epoch` every `frequency`.
    ///
    /// A zero frequency returns an idle updater that never writes.
    pub fn start(
        store: Arc<dyn FunctionStore>,
        function_id: FunctionId,
        epoch: Epoch,
        frequency: Duration,
        sink: ExceptionSink,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(IDLE),
            beats: AtomicI64::new(0),
        });
        let cancel = CancellationToken::new();

        if frequency.is_zero() {
            return Self { shared, cancel };
        }

        shared.state.store(RUNNING, Ordering::SeqCst);
        let task_shared = shared.clone();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            debug!(
                function_id = %function_id,
                epoch,
                interval_ms = frequency.as_millis() as u64,
                "Sign of life started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = task_cancel.cancelled() => break,

                    _ = tokio::time::sleep(frequency) => {}
                }

                if task_cancel.is_cancelled() {
                    break;
                }

                let beat = task_shared.beats.load(Ordering::SeqCst) + 1;
                match store.update_sign_of_life(&function_id, epoch, beat).await {
                    Ok(true) => {
                        task_shared.beats.store(beat, Ordering::SeqCst);
                    }
                    Ok(false) => {
                        debug!(
                            function_id = %function_id,
                            epoch,
                            "Ownership lost, sign of life stopped"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(function_id = %function_id, epoch, error = %e, "Sign of life update failed");
                        sink.report(
                            FrameworkError::new(
                                Component::SignOfLife,
                                format!("sign of life update failed at epoch {epoch}: {e}"),
                            )
                            .with_function(&function_id),
                        );
                        break;
                    }
                }
            }

            task_shared.state.store(STOPPED, Ordering::SeqCst);
        });

        Self { shared, cancel }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SignOfLifeState {
        match self.shared.state.load(Ordering::SeqCst) {
            IDLE => SignOfLifeState::Idle,
            RUNNING => SignOfLifeState::Running,
            _ => SignOfLifeState::Stopped,
        }
    }

    /// Beats written so far.
    pub fn beats(&self) -> i64 {
        self.shared.beats.load(Ordering::SeqCst)
    }

    /// Stop the loop before its next write. Idempotent.
    pub fn dispose(&self) {
        self.cancel.cancel();
        self.shared.state.store(STOPPED, Ordering::SeqCst);
    }
}

impl Drop for SignOfLifeUpdater {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
