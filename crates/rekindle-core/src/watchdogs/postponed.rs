// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resumes Postponed functions once they are due.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{WatchdogContext, run_loop};
use crate::error::Result;
use crate::sink::Component;
use crate::types::Status;

pub(crate) struct PostponedWatchdog {
    ctx: Arc<WatchdogContext>,
    frequency: Duration,
}

impl PostponedWatchdog {
    pub fn new(ctx: Arc<WatchdogContext>, frequency: Duration) -> Self {
        Self { ctx, frequency }
    }

    pub async fn run(self: Arc<Self>, delay_startup: Duration) {
        let ctx = self.ctx.clone();
        run_loop(
            Component::PostponedWatchdog,
            Some(ctx.type_id.clone()),
            self.frequency,
            delay_startup,
            ctx.shutdown.clone(),
            ctx.sink.clone(),
            || self.check(),
        )
        .await;
    }

    /// One scan. Due functions are resumed in due order, ties by function id.
    pub async fn check(&self) -> Result<()> {
        let now = self.ctx.clock.now();
        let due = self
            .ctx
            .stores
            .functions
            .get_functions_with_status(&self.ctx.type_id, Status::Postponed, Some(now))
            .await?;

        if !due.is_empty() {
            debug!(type_id = %self.ctx.type_id, count = due.len(), "Postponed functions due");
        }
        for entry in due.iter().filter(|e| self.ctx.owns(&e.function_id)) {
            if !self.ctx.resume(entry, Component::PostponedWatchdog).await {
                break;
            }
        }
        Ok(())
    }
}
