// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function registry and invocation engine.
//!
//! [`FunctionsRegistry`] maps function types to handlers, runs invocations and
//! owns the watchdog loops that resume abandoned work.
//!
//! # Example
//!
//! ```rust,ignore
//! use rekindle_core::{FunctionsRegistry, Outcome, Stores};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = FunctionsRegistry::builder()
//!         .stores(Stores::in_memory())
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let orders = registry.register("orders", |order_id: String, wf| async move {
//!         let receipt: String = wf
//!             .effect()
//!             .capture("charge", || async { Ok(format!("charged {order_id}")) })
//!             .await?;
//!         Ok(Outcome::Completed(receipt))
//!     })?;
//!
//!     let receipt = orders.invoke("o-1", &"o-1".to_string()).await?;
//!
//!     registry.shutdown(std::time::Duration::from_secs(10)).await?;
//!     Ok(())
//! }
//! ```

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::clock::{Clock, SystemClock};
use crate::context::Workflow;
use crate::error::{CoreError, Result};
use crate::messages::MessageWriter;
use crate::outcome::Outcome;
use crate::serializer::{JsonSerializer, Serializer};
use crate::settings::Settings;
use crate::sign_of_life::SignOfLifeUpdater;
use crate::sink::{Component, ExceptionSink, FrameworkError};
use crate::store::{InitialStatus, StatusUpdate, StoredFunction, Stores};
use crate::types::{
    Epoch, FunctionId, FunctionInstanceId, FunctionTypeId, ReplicaId, StoredError,
};
use crate::watchdogs::{
    CrashedWatchdog, PostponedWatchdog, ReInvoker, ReplicaAssignment, ReplicaWatchdog,
    RetentionWatchdog, SuspendedWatchdog, WatchdogContext,
};

// ============================================================================
// Builder
// ============================================================================

/// Builder for creating a [`FunctionsRegistry`].
pub struct FunctionsRegistryBuilder {
    stores: Option<Stores>,
    settings: Settings,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    sink: ExceptionSink,
    replica_id: Option<ReplicaId>,
}

impl std::fmt::Debug for FunctionsRegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionsRegistryBuilder")
            .field("stores", &self.stores.as_ref().map(|_| "..."))
            .field("settings", &self.settings)
            .field("replica_id", &self.replica_id)
            .finish_non_exhaustive()
    }
}

impl Default for FunctionsRegistryBuilder {
    fn default() -> Self {
        Self {
            stores: None,
            settings: Settings::default(),
            serializer: Arc::new(JsonSerializer),
            clock: Arc::new(SystemClock),
            sink: ExceptionSink::logging(),
            replica_id: None,
        }
    }
}

impl FunctionsRegistryBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stores (required).
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Set the loop and heartbeat settings.
    ///
    /// Default: [`Settings::default`]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the payload serializer.
    ///
    /// Default: [`JsonSerializer`]
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Set the wall clock used for postponement and retention.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the sink receiving background failures.
    ///
    /// Default: [`ExceptionSink::logging`]
    pub fn exception_sink(mut self, sink: ExceptionSink) -> Self {
        self.sink = sink;
        self
    }

    /// Set this process's replica id.
    ///
    /// Default: a random id
    pub fn replica_id(mut self, replica_id: ReplicaId) -> Self {
        self.replica_id = Some(replica_id);
        self
    }

    /// Build the registry configuration.
    ///
    /// Returns an error if required fields are missing or settings are invalid.
    pub fn build(self) -> anyhow::Result<RegistryConfig> {
        let stores = self
            .stores
            .ok_or_else(|| anyhow::anyhow!("stores are required"))?;
        if self.settings.max_parallel_retry_invocations == 0 {
            anyhow::bail!("max_parallel_retry_invocations must be positive");
        }

        Ok(RegistryConfig {
            stores,
            settings: self.settings,
            serializer: self.serializer,
            clock: self.clock,
            sink: self.sink,
            replica_id: self.replica_id.unwrap_or_else(ReplicaId::random),
        })
    }
}

/// Configuration for a [`FunctionsRegistry`].
pub struct RegistryConfig {
    stores: Stores,
    settings: Settings,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    sink: ExceptionSink,
    replica_id: ReplicaId,
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("settings", &self.settings)
            .field("replica_id", &self.replica_id)
            .finish_non_exhaustive()
    }
}

impl RegistryConfig {
    /// Initialize the stores, register this replica and start its watchdog.
    pub async fn start(self) -> anyhow::Result<FunctionsRegistry> {
        self.stores.functions.initialize().await?;

        let replica = Arc::new(ReplicaWatchdog::new(
            self.replica_id,
            self.stores.functions.clone(),
            &self.settings,
            self.sink.clone(),
        ));
        replica.initialize().await?;

        let shared = Arc::new(Shared {
            permits: Arc::new(Semaphore::new(self.settings.max_parallel_retry_invocations)),
            stores: self.stores,
            settings: self.settings,
            serializer: self.serializer,
            clock: self.clock,
            sink: self.sink,
            replica: replica.clone(),
            shutdown: CancellationToken::new(),
            hard_stop: CancellationToken::new(),
            tracker: Arc::new(InvocationTracker::default()),
            types: Mutex::new(HashSet::new()),
            loops: Mutex::new(Vec::new()),
        });

        let handle = tokio::spawn(
            replica.run(shared.settings.delay_startup, shared.shutdown.clone()),
        );
        shared.track_loop(handle);

        info!(replica_id = %shared.replica.replica_id(), "FunctionsRegistry started");
        Ok(FunctionsRegistry { shared })
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct InvocationTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl InvocationTracker {
    fn enter(self: &Arc<Self>) -> ActiveInvocation {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveInvocation {
            tracker: self.clone(),
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct ActiveInvocation {
    tracker: Arc<InvocationTracker>,
}

impl Drop for ActiveInvocation {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

struct Shared {
    stores: Stores,
    settings: Settings,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    sink: ExceptionSink,
    replica: Arc<ReplicaWatchdog>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    hard_stop: CancellationToken,
    tracker: Arc<InvocationTracker>,
    types: Mutex<HashSet<FunctionTypeId>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn track_loop(&self, handle: JoinHandle<()>) {
        self.loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }
}

/// Running registry. Cheap to clone.
#[derive(Clone)]
pub struct FunctionsRegistry {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FunctionsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionsRegistry")
            .field("replica_id", &self.shared.replica.replica_id())
            .field("active_invocations", &self.shared.tracker.active())
            .finish_non_exhaustive()
    }
}

impl FunctionsRegistry {
    /// Create a new builder.
    pub fn builder() -> FunctionsRegistryBuilder {
        FunctionsRegistryBuilder::new()
    }

    /// This process's replica id.
    pub fn replica_id(&self) -> ReplicaId {
        self.shared.replica.replica_id()
    }

    /// This replica's current slice of the function space.
    pub fn assignment(&self) -> ReplicaAssignment {
        self.shared.replica.assignment()
    }

    /// The stores in use.
    pub fn stores(&self) -> &Stores {
        &self.shared.stores
    }

    /// The settings in use.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Invocations currently running in this process.
    pub fn active_invocations(&self) -> usize {
        self.shared.tracker.active()
    }

    /// Check if the registry still accepts invocations.
    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.is_cancelled()
    }

    /// Register `handler` for `type_id` and start the type's watchdogs.
    pub fn register<P, R, F, Fut>(
        &self,
        type_id: impl Into<FunctionTypeId>,
        handler: F,
    ) -> Result<RegisteredFunction<P, R>>
    where
        P: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(P, Workflow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Outcome<R>>> + Send + 'static,
    {
        let type_id = type_id.into();
        if self.shared.shutdown.is_cancelled() {
            return Err(CoreError::ShuttingDown);
        }
        if !self
            .shared
            .types
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(type_id.clone())
        {
            return Err(CoreError::FunctionTypeAlreadyRegistered { type_id });
        }

        let handler: Handler<P, R> = Arc::new(
            move |parameter: P, workflow: Workflow| -> BoxFuture<'static, anyhow::Result<Outcome<R>>> {
                Box::pin(handler(parameter, workflow))
            },
        );
        let invoker = Arc::new(TypedInvoker {
            shared: self.shared.clone(),
            type_id: type_id.clone(),
            handler,
            _types: PhantomData,
        });

        self.start_watchdogs(&type_id, invoker.clone());
        info!(type_id = %type_id, "Function type registered");

        Ok(RegisteredFunction { invoker })
    }

    fn start_watchdogs(&self, type_id: &FunctionTypeId, reinvoker: Arc<dyn ReInvoker>) {
        let shared = &self.shared;
        let settings = &shared.settings;
        let delay = settings.delay_startup;
        let ctx = Arc::new(WatchdogContext {
            type_id: type_id.clone(),
            stores: shared.stores.clone(),
            reinvoker,
            assignment: shared.replica.subscribe(),
            clock: shared.clock.clone(),
            sink: shared.sink.clone(),
            permits: shared.permits.clone(),
            shutdown: shared.shutdown.clone(),
        });

        let crashed = Arc::new(CrashedWatchdog::new(
            ctx.clone(),
            settings.crashed_check_frequency,
            settings.crashed_tolerance_factor,
        ));
        shared.track_loop(tokio::spawn(crashed.run(delay)));

        let postponed = Arc::new(PostponedWatchdog::new(
            ctx.clone(),
            settings.postponed_check_frequency,
        ));
        shared.track_loop(tokio::spawn(postponed.run(delay)));

        let suspended = Arc::new(SuspendedWatchdog::new(
            ctx.clone(),
            settings.suspended_check_frequency,
        ));
        shared.track_loop(tokio::spawn(suspended.run(delay)));

        if let Some(period) = settings.retention_period {
            let retention = Arc::new(RetentionWatchdog::new(
                ctx,
                settings.retention_check_frequency,
                period,
            ));
            shared.track_loop(tokio::spawn(retention.run(delay)));
        }
    }

    /// Stop the watchdogs and wait up to `timeout` for running invocations to
    /// finish. On timeout background invocations are aborted and
    /// [`CoreError::ShutdownTimeout`] is returned.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        info!(
            active_invocations = self.shared.tracker.active(),
            "Shutting down FunctionsRegistry"
        );
        self.shared.shutdown.cancel();

        let drained = tokio::time::timeout(timeout, self.shared.tracker.wait_idle())
            .await
            .is_ok();
        let result = if drained {
            Ok(())
        } else {
            let active_invocations = self.shared.tracker.active();
            warn!(
                active_invocations,
                timeout_ms = timeout.as_millis() as u64,
                "Graceful shutdown timed out, stopping invocations"
            );
            self.shared.hard_stop.cancel();
            Err(CoreError::ShutdownTimeout {
                timeout,
                active_invocations,
            })
        };

        let handles: Vec<_> = self
            .shared
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Watchdog task panicked");
            }
        }

        if let Err(e) = self.shared.replica.deregister().await {
            warn!(error = %e, "Failed to deregister replica");
        }

        info!("FunctionsRegistry shutdown complete");
        result
    }
}

// ============================================================================
// Invocation engine
// ============================================================================

type Handler<P, R> =
    Arc<dyn Fn(P, Workflow) -> BoxFuture<'static, anyhow::Result<Outcome<R>>> + Send + Sync>;

struct TypedInvoker<P, R> {
    shared: Arc<Shared>,
    type_id: FunctionTypeId,
    handler: Handler<P, R>,
    _types: PhantomData<fn(P) -> R>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl<P, R> TypedInvoker<P, R>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    fn function_id(&self, instance_id: FunctionInstanceId) -> FunctionId {
        FunctionId {
            type_id: self.type_id.clone(),
            instance_id,
        }
    }

    /// Run the handler against `function` at its current epoch.
    async fn execute(&self, function: StoredFunction) -> Result<R> {
        let _active = self.shared.tracker.enter();
        let shared = &self.shared;
        let function_id = function.function_id.clone();
        let epoch = function.epoch;

        let heartbeat = SignOfLifeUpdater::start(
            shared.stores.functions.clone(),
            function_id.clone(),
            epoch,
            shared.settings.sign_of_life_frequency,
            shared.sink.clone(),
        );

        let workflow = Workflow::load(
            &function,
            shared.stores.clone(),
            shared.serializer.clone(),
            shared.clock.clone(),
            shared.sink.clone(),
        )
        .await?;
        let span = info_span!(
            "invocation",
            function_id = %function_id,
            epoch,
            correlation_id = %workflow.correlation_id()
        );

        let outcome = self
            .run_handler(&function, workflow)
            .instrument(span)
            .await;
        heartbeat.dispose();

        let (update, result) = match outcome {
            Ok(Outcome::Completed(value)) => match shared.serializer.as_ref().to_payload(&value) {
                Ok(payload) => (
                    StatusUpdate::Succeeded {
                        result: Some(payload),
                    },
                    Ok(value),
                ),
                Err(e) => self.failed(&function_id, StoredError::new("serialization", e.to_string())),
            },
            Ok(Outcome::Postponed(until)) => (
                StatusUpdate::Postponed { until },
                Err(CoreError::FunctionPostponed {
                    function_id: function_id.clone(),
                    until,
                }),
            ),
            Ok(Outcome::Suspended(expected_interrupt_count)) => (
                StatusUpdate::Suspended {
                    expected_interrupt_count,
                },
                Err(CoreError::FunctionSuspended {
                    function_id: function_id.clone(),
                    expected_interrupt_count,
                }),
            ),
            Ok(Outcome::Failed(error)) | Err(error) => self.failed(&function_id, error),
        };

        let status = update.status();
        if !shared
            .stores
            .functions
            .set_function_state(&function_id, update, epoch)
            .await?
        {
            warn!(
                function_id = %function_id,
                epoch,
                "Function taken over during execution, outcome discarded"
            );
            return Err(CoreError::ConcurrentModification {
                function_id,
                expected_epoch: epoch,
            });
        }

        info!(function_id = %function_id, epoch, status = %status, "Function execution finished");
        result
    }

    fn failed(&self, function_id: &FunctionId, error: StoredError) -> (StatusUpdate, Result<R>) {
        (
            StatusUpdate::Failed {
                error: error.clone(),
            },
            Err(CoreError::FunctionFailed {
                function_id: function_id.clone(),
                error,
            }),
        )
    }

    /// Decode the parameter and run the handler, turning errors and panics
    /// into a stored failure.
    async fn run_handler(
        &self,
        function: &StoredFunction,
        workflow: Workflow,
    ) -> std::result::Result<Outcome<R>, StoredError> {
        let parameter: P = self
            .shared
            .serializer
            .as_ref()
            .from_payload(&function.parameter)
            .map_err(|e| StoredError::new("serialization", e.to_string()))?;

        let future = std::panic::catch_unwind(AssertUnwindSafe(|| {
            (self.handler)(parameter, workflow)
        }))
        .map_err(|panic| StoredError::new("panic", panic_message(&*panic)))?;

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(StoredError::from_anyhow("handler", &e)),
            Err(panic) => Err(StoredError::new("panic", panic_message(&*panic))),
        }
    }

    /// Run `function` on a background task, holding `permit` until it ends.
    fn spawn_background(
        self: &Arc<Self>,
        function: StoredFunction,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let this = self.clone();
        let hard_stop = self.shared.hard_stop.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let function_id = function.function_id.clone();

            tokio::select! {
                biased;

                _ = hard_stop.cancelled() => {
                    warn!(function_id = %function_id, "Background invocation aborted by hard stop");
                }

                result = this.execute(function) => match result {
                    Ok(_) => {}
                    Err(e) if e.is_parked() || e.is_ownership_loss() => {
                        debug!(function_id = %function_id, reason = %e, "Background invocation parked");
                    }
                    Err(CoreError::FunctionFailed { error, .. }) => {
                        info!(function_id = %function_id, error = %error, "Background invocation failed");
                    }
                    Err(e) => {
                        this.shared.sink.report(
                            FrameworkError::new(Component::Invocation, e.to_string())
                                .with_function(&function_id),
                        );
                    }
                },
            }
        });
    }
}

#[async_trait]
impl<P, R> ReInvoker for TypedInvoker<P, R>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    async fn restart(
        self: Arc<Self>,
        function_id: FunctionId,
        expected_epoch: Epoch,
        permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        let function = self
            .shared
            .stores
            .functions
            .restart_execution(&function_id, expected_epoch)
            .await?;
        self.spawn_background(function, Some(permit));
        Ok(())
    }
}

// ============================================================================
// Typed handle
// ============================================================================

/// Typed handle to a registered function type.
pub struct RegisteredFunction<P, R> {
    invoker: Arc<TypedInvoker<P, R>>,
}

impl<P, R> Clone for RegisteredFunction<P, R> {
    fn clone(&self) -> Self {
        Self {
            invoker: self.invoker.clone(),
        }
    }
}

impl<P, R> std::fmt::Debug for RegisteredFunction<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("type_id", &self.invoker.type_id)
            .finish()
    }
}

impl<P, R> RegisteredFunction<P, R>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    /// The function type.
    pub fn type_id(&self) -> &FunctionTypeId {
        &self.invoker.type_id
    }

    fn ensure_running(&self) -> Result<()> {
        if self.invoker.shared.shutdown.is_cancelled() {
            return Err(CoreError::ShuttingDown);
        }
        Ok(())
    }

    async fn create(
        &self,
        instance_id: impl Into<FunctionInstanceId>,
        parameter: &P,
        initial: InitialStatus,
    ) -> Result<FunctionId> {
        self.ensure_running()?;
        let function_id = self.invoker.function_id(instance_id.into());
        let payload = self.invoker.shared.serializer.as_ref().to_payload(parameter)?;
        self.invoker
            .shared
            .stores
            .functions
            .create_function(&function_id, payload, initial)
            .await?;
        debug!(function_id = %function_id, initial = ?initial, "Function created");
        Ok(function_id)
    }

    async fn load(&self, function_id: &FunctionId) -> Result<StoredFunction> {
        self.invoker
            .shared
            .stores
            .functions
            .get_function(function_id)
            .await?
            .ok_or_else(|| CoreError::FunctionNotFound {
                function_id: function_id.clone(),
            })
    }

    /// Create the instance and run it to its first outcome.
    ///
    /// Returns the result, or an error naming the instance when it failed,
    /// was postponed, was suspended, or was taken over by another executor.
    pub async fn invoke(
        &self,
        instance_id: impl Into<FunctionInstanceId>,
        parameter: &P,
    ) -> Result<R> {
        let function_id = self
            .create(instance_id, parameter, InitialStatus::Executing)
            .await?;
        let function = self.load(&function_id).await?;
        self.invoker.execute(function).await
    }

    /// Create the instance and run it on a background task.
    pub async fn schedule(
        &self,
        instance_id: impl Into<FunctionInstanceId>,
        parameter: &P,
    ) -> Result<()> {
        let function_id = self
            .create(instance_id, parameter, InitialStatus::Executing)
            .await?;
        let function = self.load(&function_id).await?;
        self.invoker.spawn_background(function, None);
        Ok(())
    }

    /// Create the instance Postponed until `until`; the postponed watchdog
    /// starts it once due.
    pub async fn schedule_at(
        &self,
        instance_id: impl Into<FunctionInstanceId>,
        parameter: &P,
        until: DateTime<Utc>,
    ) -> Result<()> {
        self.create(instance_id, parameter, InitialStatus::Postponed { until })
            .await?;
        Ok(())
    }

    /// Take over the instance at `expected_epoch` and run it again.
    pub async fn reinvoke(
        &self,
        instance_id: impl Into<FunctionInstanceId>,
        expected_epoch: Epoch,
    ) -> Result<R> {
        self.ensure_running()?;
        let function_id = self.invoker.function_id(instance_id.into());
        let function = self
            .invoker
            .shared
            .stores
            .functions
            .restart_execution(&function_id, expected_epoch)
            .await?;
        self.invoker.execute(function).await
    }

    /// Load the stored record of an instance.
    pub async fn get_function(
        &self,
        instance_id: impl Into<FunctionInstanceId>,
    ) -> Result<Option<StoredFunction>> {
        let function_id = self.invoker.function_id(instance_id.into());
        self.invoker
            .shared
            .stores
            .functions
            .get_function(&function_id)
            .await
    }

    /// Decoded result of a Succeeded instance.
    pub async fn result(&self, instance_id: impl Into<FunctionInstanceId>) -> Result<Option<R>> {
        match self.get_function(instance_id).await? {
            Some(StoredFunction {
                result: Some(payload),
                ..
            }) => Ok(Some(
                self.invoker.shared.serializer.as_ref().from_payload(&payload)?,
            )),
            _ => Ok(None),
        }
    }

    /// Writer appending messages to an instance's log.
    pub fn message_writer(&self, instance_id: impl Into<FunctionInstanceId>) -> MessageWriter {
        let shared = &self.invoker.shared;
        MessageWriter::new(
            self.invoker.function_id(instance_id.into()),
            shared.stores.messages.clone(),
            shared.stores.functions.clone(),
            shared.serializer.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;

    async fn registry() -> FunctionsRegistry {
        FunctionsRegistry::builder()
            .stores(Stores::in_memory())
            .settings(Settings {
                crashed_check_frequency: Duration::ZERO,
                postponed_check_frequency: Duration::ZERO,
                suspended_check_frequency: Duration::ZERO,
                replica_check_frequency: Duration::ZERO,
                sign_of_life_frequency: Duration::ZERO,
                ..Settings::default()
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap()
    }

    #[test]
    fn test_builder_requires_stores() {
        let err = FunctionsRegistry::builder().build().unwrap_err();
        assert!(err.to_string().contains("stores are required"));
    }

    #[test]
    fn test_builder_rejects_zero_parallelism() {
        let err = FunctionsRegistry::builder()
            .stores(Stores::in_memory())
            .settings(Settings {
                max_parallel_retry_invocations: 0,
                ..Settings::default()
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_parallel_retry_invocations"));
    }

    #[tokio::test]
    async fn test_invoke_completes() {
        let registry = registry().await;
        let double = registry
            .register("double", |n: u32, _wf| async move { Ok(Outcome::Completed(n * 2)) })
            .unwrap();

        assert_eq!(double.invoke("a", &21).await.unwrap(), 42);
        let stored = double.get_function("a").await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Succeeded);
        assert_eq!(double.result("a").await.unwrap(), Some(42));

        let err = double.invoke("a", &1).await.unwrap_err();
        assert_eq!(err.error_code(), "FUNCTION_ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn test_duplicate_type_registration_fails() {
        let registry = registry().await;
        registry
            .register("t", |n: u32, _wf| async move { Ok(Outcome::Completed(n)) })
            .unwrap();
        let err = registry
            .register("t", |n: u32, _wf| async move { Ok(Outcome::Completed(n)) })
            .unwrap_err();
        assert_eq!(err.error_code(), "FUNCTION_TYPE_ALREADY_REGISTERED");
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_failed() {
        let registry = registry().await;
        let failing = registry
            .register("failing", |n: u32, _wf| async move {
                if n == 0 {
                    panic!("division by zero");
                }
                Err::<Outcome<u32>, _>(anyhow::anyhow!("no stock for {n}"))
            })
            .unwrap();

        match failing.invoke("err", &3).await.unwrap_err() {
            CoreError::FunctionFailed { error, .. } => {
                assert_eq!(error.kind, "handler");
                assert!(error.message.contains("no stock for 3"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        match failing.invoke("panic", &0).await.unwrap_err() {
            CoreError::FunctionFailed { error, .. } => {
                assert_eq!(error.kind, "panic");
                assert!(error.message.contains("division by zero"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(registry.active_invocations(), 0);
    }

    #[tokio::test]
    async fn test_postpone_and_suspend_are_reported() {
        let registry = registry().await;
        let parked: RegisteredFunction<String, ()> = registry
            .register("parked", |mode: String, wf: Workflow| async move {
                if mode == "later" {
                    Ok(Outcome::postpone_for(wf.now(), Duration::from_secs(60)))
                } else {
                    Ok(Outcome::Suspended(wf.next_message_count().await))
                }
            })
            .unwrap();

        let err = parked.invoke("p", &"later".to_string()).await.unwrap_err();
        assert_eq!(err.error_code(), "FUNCTION_POSTPONED");
        let stored = parked.get_function("p").await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Postponed);
        assert!(stored.postponed_until.is_some());

        let err = parked.invoke("s", &"wait".to_string()).await.unwrap_err();
        match err {
            CoreError::FunctionSuspended {
                expected_interrupt_count,
                ..
            } => assert_eq!(expected_interrupt_count, 1),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reinvoke_requires_matching_epoch() {
        let registry = registry().await;
        let parked = registry
            .register("later", |_: (), wf: Workflow| async move {
                if wf.epoch() == 0 {
                    Ok(Outcome::postpone_for(wf.now(), Duration::from_secs(60)))
                } else {
                    Ok(Outcome::Completed(wf.epoch()))
                }
            })
            .unwrap();

        assert!(parked.invoke("x", &()).await.unwrap_err().is_parked());
        let err = parked.reinvoke("x", 5).await.unwrap_err();
        assert_eq!(err.error_code(), "CONCURRENT_MODIFICATION");
        assert_eq!(parked.reinvoke("x", 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_invocations() {
        let registry = registry().await;
        let echo = registry
            .register("echo", |s: String, _wf| async move { Ok(Outcome::Completed(s)) })
            .unwrap();

        registry.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(!registry.is_running());
        let err = echo.invoke("late", &"x".to_string()).await.unwrap_err();
        assert_eq!(err.error_code(), "SHUTTING_DOWN");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_times_out_on_stuck_invocation() {
        let registry = registry().await;
        let stuck = registry
            .register("stuck", |_: (), _wf| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Outcome::Completed(()))
            })
            .unwrap();

        stuck.schedule("s", &()).await.unwrap();
        while registry.active_invocations() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.active_invocations(), 1);

        let err = registry.shutdown(Duration::from_secs(1)).await.unwrap_err();
        match err {
            CoreError::ShutdownTimeout {
                active_invocations, ..
            } => assert_eq!(active_invocations, 1),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
