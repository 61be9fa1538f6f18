// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for rekindle-core integration tests.
//!
//! Provides TestContext wiring an in-memory store, a manual wall clock and a
//! registry with fast watchdog loops.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use rekindle_core::store::{FunctionStore, StoredFunction};
use rekindle_core::{
    ExceptionSink, FrameworkError, FunctionId, FunctionsRegistry, InMemoryStore, JsonSerializer,
    ManualClock, Serializer, Settings, Status, StoredPayload, Stores,
};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rekindle_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Encode `value` the way the registry's default serializer does.
pub fn payload<T: Serialize>(value: &T) -> StoredPayload {
    let serializer: &dyn Serializer = &JsonSerializer;
    serializer.to_payload(value).unwrap()
}

/// Settings with every loop ticking every 100ms and no startup delay.
pub fn fast_settings() -> Settings {
    Settings {
        crashed_check_frequency: Duration::from_millis(100),
        crashed_tolerance_factor: 2,
        postponed_check_frequency: Duration::from_millis(100),
        suspended_check_frequency: Duration::from_millis(100),
        replica_check_frequency: Duration::from_millis(100),
        replica_strike_threshold: 3,
        sign_of_life_frequency: Duration::from_millis(50),
        delay_startup: Duration::ZERO,
        max_parallel_retry_invocations: 10,
        retention_check_frequency: Duration::from_millis(100),
        retention_period: None,
    }
}

/// Test context holding a shared in-memory backend and a manual clock.
pub struct TestContext {
    pub store: Arc<InMemoryStore>,
    pub stores: Stores,
    pub clock: Arc<ManualClock>,
    pub reports: Arc<Mutex<Vec<FrameworkError>>>,
}

impl TestContext {
    pub fn new() -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::at_now());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        Self {
            stores: Stores::from_backend(store.clone()),
            store,
            clock,
            reports: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sink collecting every reported background failure.
    pub fn sink(&self) -> ExceptionSink {
        let reports = self.reports.clone();
        ExceptionSink::new(move |report| {
            reports.lock().unwrap().push(report.clone());
        })
    }

    /// Start a registry on the shared stores with [`fast_settings`].
    pub async fn registry(&self) -> FunctionsRegistry {
        self.registry_with(fast_settings()).await
    }

    /// Start a registry on the shared stores with `settings`.
    pub async fn registry_with(&self, settings: Settings) -> FunctionsRegistry {
        FunctionsRegistry::builder()
            .stores(self.stores.clone())
            .settings(settings)
            .clock(self.clock.clone())
            .exception_sink(self.sink())
            .build()
            .expect("valid registry config")
            .start()
            .await
            .expect("registry starts")
    }

    pub async fn function(&self, function_id: &FunctionId) -> Option<StoredFunction> {
        self.store.get_function(function_id).await.unwrap()
    }

    /// Poll until the function reaches `status`, failing after `timeout`.
    pub async fn wait_for_status(
        &self,
        function_id: &FunctionId,
        status: Status,
        timeout: Duration,
    ) -> StoredFunction {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(function) = self.function(function_id).await
                && function.status == status
            {
                return function;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{function_id} did not reach {status} within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until `predicate` holds, failing after `timeout`.
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while !predicate() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn reports(&self) -> Vec<FrameworkError> {
        self.reports.lock().unwrap().clone()
    }
}
