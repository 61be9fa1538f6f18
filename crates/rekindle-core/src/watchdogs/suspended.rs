// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resumes Suspended functions once enough messages arrived.

use std::sync::Arc;
use std::time::Duration;

use super::{WatchdogContext, run_loop};
use crate::error::Result;
use crate::sink::Component;
use crate::types::Status;

pub(crate) struct SuspendedWatchdog {
    ctx: Arc<WatchdogContext>,
    frequency: Duration,
}

impl SuspendedWatchdog {
    pub fn new(ctx: Arc<WatchdogContext>, frequency: Duration) -> Self {
        Self { ctx, frequency }
    }

    pub async fn run(self: Arc<Self>, delay_startup: Duration) {
        let ctx = self.ctx.clone();
        run_loop(
            Component::SuspendedWatchdog,
            Some(ctx.type_id.clone()),
            self.frequency,
            delay_startup,
            ctx.shutdown.clone(),
            ctx.sink.clone(),
            || self.check(),
        )
        .await;
    }

    pub async fn check(&self) -> Result<()> {
        let suspended = self
            .ctx
            .stores
            .functions
            .get_functions_with_status(&self.ctx.type_id, Status::Suspended, None)
            .await?;

        let resumable = suspended.iter().filter(|e| {
            e.expected_interrupt_count
                .is_some_and(|expected| e.interrupt_count >= expected)
                && self.ctx.owns(&e.function_id)
        });
        for entry in resumable {
            if !self.ctx.resume(entry, Component::SuspendedWatchdog).await {
                break;
            }
        }
        Ok(())
    }
}
