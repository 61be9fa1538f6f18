// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deletes terminal functions older than the retention period.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::{WatchdogContext, run_loop};
use crate::clock::to_time_delta;
use crate::error::Result;
use crate::sink::Component;

const BATCH_SIZE: usize = 100;

pub(crate) struct RetentionWatchdog {
    ctx: Arc<WatchdogContext>,
    frequency: Duration,
    period: Duration,
}

impl RetentionWatchdog {
    pub fn new(ctx: Arc<WatchdogContext>, frequency: Duration, period: Duration) -> Self {
        Self {
            ctx,
            frequency,
            period,
        }
    }

    pub async fn run(self: Arc<Self>, delay_startup: Duration) {
        let ctx = self.ctx.clone();
        run_loop(
            Component::RetentionWatchdog,
            Some(ctx.type_id.clone()),
            self.frequency,
            delay_startup,
            ctx.shutdown.clone(),
            ctx.sink.clone(),
            || self.check(),
        )
        .await;
    }

    /// Delete expired functions with their effects and messages, in batches.
    pub async fn check(&self) -> Result<()> {
        let Some(cutoff) = self
            .ctx
            .clock
            .now()
            .checked_sub_signed(to_time_delta(self.period))
        else {
            // The period reaches back past the calendar range; nothing has expired.
            return Ok(());
        };
        let mut total = 0usize;

        loop {
            let batch = self
                .ctx
                .stores
                .functions
                .get_terminal_functions(&self.ctx.type_id, cutoff, BATCH_SIZE)
                .await?;

            let mut deleted = 0usize;
            for entry in &batch {
                if self
                    .ctx
                    .stores
                    .purge_function(&entry.function_id, entry.epoch)
                    .await?
                {
                    deleted += 1;
                }
            }
            total += deleted;

            // A short batch was the last one; a batch with nothing deleted is
            // being handled by another replica.
            if batch.len() < BATCH_SIZE || deleted == 0 || self.ctx.shutdown.is_cancelled() {
                break;
            }
        }

        if total > 0 {
            info!(type_id = %self.ctx.type_id, deleted = total, "Expired functions deleted");
        }
        Ok(())
    }
}
