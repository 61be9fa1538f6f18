// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restarts Executing functions whose heartbeat stopped moving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{WatchdogContext, run_loop};
use crate::error::Result;
use crate::sink::Component;
use crate::store::StatusEntry;
use crate::types::{Epoch, FunctionId, Status};

struct Observation {
    epoch: Epoch,
    sign_of_life: i64,
    since: Instant,
}

pub(crate) struct CrashedWatchdog {
    ctx: Arc<WatchdogContext>,
    frequency: Duration,
    window: Duration,
    observations: Mutex<HashMap<FunctionId, Observation>>,
}

impl CrashedWatchdog {
    pub fn new(ctx: Arc<WatchdogContext>, frequency: Duration, tolerance_factor: u32) -> Self {
        Self {
            ctx,
            frequency,
            window: frequency.saturating_mul(tolerance_factor),
            observations: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, delay_startup: Duration) {
        let ctx = self.ctx.clone();
        run_loop(
            Component::CrashedWatchdog,
            Some(ctx.type_id.clone()),
            self.frequency,
            delay_startup,
            ctx.shutdown.clone(),
            ctx.sink.clone(),
            || self.check(),
        )
        .await;
    }

    /// One scan. An instance is restarted once its (epoch, sign of life) pair
    /// stayed unchanged for the whole tolerance window.
    pub async fn check(&self) -> Result<()> {
        let entries = self
            .ctx
            .stores
            .functions
            .get_functions_with_status(&self.ctx.type_id, Status::Executing, None)
            .await?;
        let now = Instant::now();

        let crashed: Vec<StatusEntry> = {
            let mut observations = self.observations.lock().await;
            observations.retain(|id, _| entries.iter().any(|e| &e.function_id == id));

            let mut crashed = Vec::new();
            for entry in entries {
                if !self.ctx.owns(&entry.function_id) {
                    observations.remove(&entry.function_id);
                    continue;
                }

                let observation = observations
                    .entry(entry.function_id.clone())
                    .or_insert_with(|| Observation {
                        epoch: entry.epoch,
                        sign_of_life: entry.sign_of_life,
                        since: now,
                    });
                if observation.epoch != entry.epoch
                    || observation.sign_of_life != entry.sign_of_life
                {
                    *observation = Observation {
                        epoch: entry.epoch,
                        sign_of_life: entry.sign_of_life,
                        since: now,
                    };
                }

                if now.duration_since(observation.since) >= self.window {
                    observations.remove(&entry.function_id);
                    crashed.push(entry);
                }
            }
            crashed
        };

        if !crashed.is_empty() {
            debug!(type_id = %self.ctx.type_id, count = crashed.len(), "Crashed functions detected");
        }
        for entry in &crashed {
            if !self.ctx.resume(entry, Component::CrashedWatchdog).await {
                break;
            }
        }
        Ok(())
    }
}
