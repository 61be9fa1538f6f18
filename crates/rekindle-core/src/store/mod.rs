// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store contracts consumed by the core and the in-memory reference backend.
//!
//! Every mutation of a function record is conditioned on the caller's expected
//! epoch. Backends must apply each operation atomically (single row / single
//! key); the core never takes a global lock.

pub mod in_memory;

pub use self::in_memory::InMemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{
    EffectId, Epoch, FunctionId, FunctionTypeId, ReplicaId, Status, StoredError, StoredPayload,
};

// ============================================================================
// Function records
// ============================================================================

/// Full function record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFunction {
    /// Key of the record.
    pub function_id: FunctionId,
    /// Serialized parameter.
    pub parameter: StoredPayload,
    /// Current status.
    pub status: Status,
    /// Current ownership generation.
    pub epoch: Epoch,
    /// Heartbeat counter of the current epoch.
    pub sign_of_life: i64,
    /// Result, once Succeeded.
    pub result: Option<StoredPayload>,
    /// Error, once Failed.
    pub error: Option<StoredError>,
    /// Due time, only while Postponed.
    pub postponed_until: Option<DateTime<Utc>>,
    /// Resume threshold, only while Suspended.
    pub expected_interrupt_count: Option<i64>,
    /// Number of messages appended to the function's log.
    pub interrupt_count: i64,
    /// Caller-defined state snapshot.
    pub state: Option<StoredState>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

/// Versioned state snapshot saved at explicit save points.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    /// Serialized state.
    pub payload: StoredPayload,
    /// Incremented on every save.
    pub version: i64,
}

/// Status a function is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialStatus {
    /// Owned by the creating executor at epoch 0.
    Executing,
    /// Left for the postponed watchdog to start.
    Postponed {
        /// When the function becomes due.
        until: DateTime<Utc>,
    },
}

/// Conditional status transition written by the current epoch's executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Completed with an optional result.
    Succeeded {
        /// Serialized result.
        result: Option<StoredPayload>,
    },
    /// Completed with an error.
    Failed {
        /// The failure.
        error: StoredError,
    },
    /// Parked until `until`.
    Postponed {
        /// Due time.
        until: DateTime<Utc>,
    },
    /// Parked until the interrupt count reaches `expected_interrupt_count`.
    Suspended {
        /// Resume threshold.
        expected_interrupt_count: i64,
    },
}

impl StatusUpdate {
    /// Status the function will have after the update.
    pub fn status(&self) -> Status {
        match self {
            Self::Succeeded { .. } => Status::Succeeded,
            Self::Failed { .. } => Status::Failed,
            Self::Postponed { .. } => Status::Postponed,
            Self::Suspended { .. } => Status::Suspended,
        }
    }
}

/// Lightweight row returned by status scans.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    /// The function.
    pub function_id: FunctionId,
    /// Epoch at scan time.
    pub epoch: Epoch,
    /// Heartbeat at scan time.
    pub sign_of_life: i64,
    /// Due time, for Postponed entries.
    pub postponed_until: Option<DateTime<Utc>>,
    /// Messages appended so far.
    pub interrupt_count: i64,
    /// Resume threshold, for Suspended entries.
    pub expected_interrupt_count: Option<i64>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl From<&StoredFunction> for StatusEntry {
    fn from(f: &StoredFunction) -> Self {
        Self {
            function_id: f.function_id.clone(),
            epoch: f.epoch,
            sign_of_life: f.sign_of_life,
            postponed_until: f.postponed_until,
            interrupt_count: f.interrupt_count,
            expected_interrupt_count: f.expected_interrupt_count,
            updated_at: f.updated_at,
        }
    }
}

/// Replica membership entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReplica {
    /// The replica.
    pub replica_id: ReplicaId,
    /// Heartbeat counter, bumped by the replica itself.
    pub heartbeat: i64,
}

/// Persistence contract for function instances and replica membership.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// Prepare the backing storage (schema, tables). Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Remove every function, effect, message and replica. Test/ops tooling.
    async fn truncate(&self) -> Result<()>;

    /// Create a function at epoch 0.
    ///
    /// Fails with `FunctionAlreadyExists` if the id is taken.
    async fn create_function(
        &self,
        function_id: &FunctionId,
        parameter: StoredPayload,
        initial: InitialStatus,
    ) -> Result<()>;

    /// Take over a function: epoch += 1, sign of life := 0, status := Executing.
    ///
    /// Only applies if the current epoch equals `expected_epoch` and the status
    /// is Executing, Postponed or Suspended. Returns the updated record.
    async fn restart_execution(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
    ) -> Result<StoredFunction>;

    /// Conditionally transition the function. Returns false on epoch mismatch.
    async fn set_function_state(
        &self,
        function_id: &FunctionId,
        update: StatusUpdate,
        expected_epoch: Epoch,
    ) -> Result<bool>;

    /// Conditionally save the state snapshot. Returns false on epoch mismatch.
    async fn save_state(
        &self,
        function_id: &FunctionId,
        state: StoredPayload,
        expected_epoch: Epoch,
    ) -> Result<bool>;

    /// Conditionally write a heartbeat. Returns false on epoch mismatch.
    async fn update_sign_of_life(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
        new_beat: i64,
    ) -> Result<bool>;

    /// Record that a message arrived. Returns false if the function does not exist.
    async fn increment_interrupt_count(&self, function_id: &FunctionId) -> Result<bool>;

    /// Load the full record.
    async fn get_function(&self, function_id: &FunctionId) -> Result<Option<StoredFunction>>;

    /// Functions of `type_id` currently in `status`.
    ///
    /// For Postponed, `postponed_before` limits results to entries due at or
    /// before that time, and results are ordered by due time ascending with
    /// ties broken by function id. Other statuses are ordered by function id.
    async fn get_functions_with_status(
        &self,
        type_id: &FunctionTypeId,
        status: Status,
        postponed_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEntry>>;

    /// Terminal functions of `type_id` last updated before `completed_before`,
    /// oldest first.
    async fn get_terminal_functions(
        &self,
        type_id: &FunctionTypeId,
        completed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StatusEntry>>;

    /// Conditionally delete the function record. Returns false on epoch mismatch.
    async fn delete_function(&self, function_id: &FunctionId, expected_epoch: Epoch)
    -> Result<bool>;

    /// Add a replica with heartbeat 0. Re-registering resets the heartbeat.
    async fn register_replica(&self, replica_id: ReplicaId) -> Result<()>;

    /// Bump the replica's heartbeat. Returns false if it was struck out.
    async fn update_replica_heartbeat(&self, replica_id: ReplicaId) -> Result<bool>;

    /// All replicas, ordered by id.
    async fn get_replicas(&self) -> Result<Vec<StoredReplica>>;

    /// Remove a replica. Returns false if it was already gone.
    async fn delete_replica(&self, replica_id: ReplicaId) -> Result<bool>;
}

// ============================================================================
// Effects
// ============================================================================

/// Memoized effect state.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectState {
    /// Work began but no outcome was recorded.
    Started,
    /// Work finished with a value.
    Completed(StoredPayload),
    /// Work finished with an error.
    Failed(StoredError),
}

/// Memo record of one effect.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEffect {
    /// The effect.
    pub effect_id: EffectId,
    /// Its state.
    pub state: EffectState,
}

/// Persistence contract for memoized effects.
#[async_trait]
pub trait EffectStore: Send + Sync {
    /// Insert or replace an effect record.
    ///
    /// Fails with [`CoreError::ConcurrentModification`](crate::CoreError::ConcurrentModification)
    /// unless `expected_epoch` is the function's current epoch.
    async fn set_effect(
        &self,
        function_id: &FunctionId,
        effect: StoredEffect,
        expected_epoch: Epoch,
    ) -> Result<()>;

    /// All effects of a function, in first-insertion order.
    async fn get_effects(&self, function_id: &FunctionId) -> Result<Vec<StoredEffect>>;

    /// Remove one effect. Epoch-guarded like [`set_effect`](Self::set_effect).
    async fn delete_effect(
        &self,
        function_id: &FunctionId,
        effect_id: &EffectId,
        expected_epoch: Epoch,
    ) -> Result<()>;

    /// Remove every effect of a function.
    async fn remove_effects(&self, function_id: &FunctionId) -> Result<()>;
}

// ============================================================================
// Messages
// ============================================================================

/// Entry of a function's message log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Zero-based position within the log.
    pub position: i64,
    /// Serialized message.
    pub payload: StoredPayload,
    /// Producer-supplied deduplication key.
    pub idempotency_key: Option<String>,
}

/// Persistence contract for per-function message logs.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message. Returns false (and stores nothing) if the idempotency
    /// key is already present in this function's log.
    async fn append_message(
        &self,
        function_id: &FunctionId,
        payload: StoredPayload,
        idempotency_key: Option<String>,
    ) -> Result<bool>;

    /// Messages at positions `skip..`, in position order.
    async fn get_messages(&self, function_id: &FunctionId, skip: usize)
    -> Result<Vec<StoredMessage>>;

    /// Remove a function's log.
    async fn remove_messages(&self, function_id: &FunctionId) -> Result<()>;

    /// Change feed: yields the function id after every successful append.
    fn subscribe_to_changes(&self) -> broadcast::Receiver<FunctionId>;
}

// ============================================================================
// Register
// ============================================================================

/// Namespace of register entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterKind {
    /// Lock holders.
    Monitor,
    /// One-time decisions.
    Arbitrator,
}

/// Key/value compare-and-swap primitive.
#[async_trait]
pub trait UnderlyingRegister: Send + Sync {
    /// Set `value` if the key is empty. Returns whether it was set.
    async fn set_if_empty(
        &self,
        kind: RegisterKind,
        group: &str,
        name: &str,
        value: &str,
    ) -> Result<bool>;

    /// Replace `expected_value` with `new_value`; when `set_if_empty` is true an
    /// empty key also accepts the new value.
    async fn compare_and_swap(
        &self,
        kind: RegisterKind,
        group: &str,
        name: &str,
        new_value: &str,
        expected_value: &str,
        set_if_empty: bool,
    ) -> Result<bool>;

    /// Current value.
    async fn get(&self, kind: RegisterKind, group: &str, name: &str) -> Result<Option<String>>;

    /// Delete the key, only if it holds `expected_value` when one is given.
    async fn delete(
        &self,
        kind: RegisterKind,
        group: &str,
        name: &str,
        expected_value: Option<&str>,
    ) -> Result<bool>;

    /// Whether the key holds a value.
    async fn exists(&self, kind: RegisterKind, group: &str, name: &str) -> Result<bool>;
}

// ============================================================================
// Bundle
// ============================================================================

/// The four store contracts the core consumes.
#[derive(Clone)]
pub struct Stores {
    /// Function records and replica membership.
    pub functions: Arc<dyn FunctionStore>,
    /// Memoized effects.
    pub effects: Arc<dyn EffectStore>,
    /// Message logs.
    pub messages: Arc<dyn MessageStore>,
    /// Compare-and-swap register.
    pub register: Arc<dyn UnderlyingRegister>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

impl Stores {
    /// Use one backend for all four contracts.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: FunctionStore + EffectStore + MessageStore + UnderlyingRegister + 'static,
    {
        Self {
            functions: backend.clone(),
            effects: backend.clone(),
            messages: backend.clone(),
            register: backend,
        }
    }

    /// Fresh in-memory backend on the system clock.
    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(InMemoryStore::new()))
    }

    /// Delete everything the core keeps for a function.
    pub(crate) async fn purge_function(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        if !self
            .functions
            .delete_function(function_id, expected_epoch)
            .await?
        {
            return Ok(false);
        }
        self.effects.remove_effects(function_id).await?;
        self.messages.remove_messages(function_id).await?;
        Ok(true)
    }
}
