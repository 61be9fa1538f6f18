// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rekindle demo - crash recovery against the in-memory store
//!
//! Seeds a function instance as if its executor had died mid-run, with one
//! effect already recorded, then starts a registry and waits for the crashed
//! watchdog to take the instance over and finish it. The recorded effect is
//! reused instead of running again.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use rekindle_core::store::{EffectState, InitialStatus, StoredEffect};
use rekindle_core::{
    FunctionId, FunctionsRegistry, JsonSerializer, Outcome, Serializer, Settings, Status, Stores,
};

const FUNCTION_TYPE: &str = "charge-order";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rekindle_core=info".parse()?),
        )
        .init();

    info!("Starting rekindle demo");

    let settings = Settings::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let settings = Settings {
        crashed_check_frequency: settings
            .crashed_check_frequency
            .min(Duration::from_millis(250)),
        ..settings
    };

    info!(
        crashed_check_frequency_ms = settings.crashed_check_frequency.as_millis() as u64,
        crashed_tolerance_factor = settings.crashed_tolerance_factor,
        "Configuration loaded"
    );

    let stores = Stores::in_memory();
    let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);
    let function_id = FunctionId::new(FUNCTION_TYPE, "order-1001");

    // Leave an Executing instance at epoch 0 whose executor never heartbeats
    stores
        .functions
        .create_function(
            &function_id,
            serializer.as_ref().to_payload(&1999u64)?,
            InitialStatus::Executing,
        )
        .await?;
    stores
        .effects
        .set_effect(
            &function_id,
            StoredEffect {
                effect_id: "charge".into(),
                state: EffectState::Completed(serializer.as_ref().to_payload(&"ch_0001".to_string())?),
            },
            0,
        )
        .await?;
    info!(function_id = %function_id, "Seeded abandoned function");

    let registry = FunctionsRegistry::builder()
        .stores(stores.clone())
        .settings(settings)
        .serializer(serializer)
        .build()?
        .start()
        .await?;

    let charges = Arc::new(AtomicUsize::new(0));
    let counter = charges.clone();
    let orders = registry.register(FUNCTION_TYPE, move |amount: u64, wf| {
        let counter = counter.clone();
        async move {
            let charge_id: String = wf
                .effect()
                .capture("charge", || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("ch_{amount}"))
                })
                .await?;
            info!(epoch = wf.epoch(), charge_id = %charge_id, "Order charged");
            Ok(Outcome::Completed(charge_id))
        }
    })?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let stored = loop {
        if let Some(stored) = orders.get_function("order-1001").await?
            && stored.status == Status::Succeeded
        {
            break Some(stored);
        }
        if tokio::time::Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    match stored {
        Some(stored) => {
            let result = orders.result("order-1001").await?;
            info!(
                function_id = %function_id,
                epoch = stored.epoch,
                result = ?result,
                charges = charges.load(Ordering::SeqCst),
                "Abandoned function recovered"
            );
        }
        None => error!(function_id = %function_id, "Function was not recovered in time"),
    }

    registry.shutdown(Duration::from_secs(10)).await?;
    info!("Rekindle demo finished");
    Ok(())
}
