// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory implementation of every store contract.
//!
//! One `tokio::sync::Mutex` guards the whole state, so each operation is
//! trivially atomic. Intended for tests, demos and single-process embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};

use super::{
    EffectStore, FunctionStore, InitialStatus, MessageStore, RegisterKind, StatusEntry,
    StatusUpdate, StoredEffect, StoredFunction, StoredMessage, StoredReplica, StoredState,
    UnderlyingRegister,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::types::{
    EffectId, Epoch, FunctionId, FunctionTypeId, ReplicaId, Status, StoredPayload,
};

const CHANGE_FEED_CAPACITY: usize = 1024;

type RegisterKey = (RegisterKind, String, String);

#[derive(Default)]
struct State {
    functions: HashMap<FunctionId, StoredFunction>,
    effects: HashMap<FunctionId, Vec<StoredEffect>>,
    messages: HashMap<FunctionId, Vec<StoredMessage>>,
    replicas: BTreeMap<ReplicaId, i64>,
    register: HashMap<RegisterKey, String>,
}

impl State {
    fn check_epoch(&self, function_id: &FunctionId, expected_epoch: Epoch) -> Result<()> {
        let function =
            self.functions
                .get(function_id)
                .ok_or_else(|| CoreError::FunctionNotFound {
                    function_id: function_id.clone(),
                })?;
        if function.epoch != expected_epoch {
            return Err(CoreError::ConcurrentModification {
                function_id: function_id.clone(),
                expected_epoch,
            });
        }
        Ok(())
    }
}

/// In-memory store backing all four contracts.
pub struct InMemoryStore {
    state: Mutex<State>,
    changes: broadcast::Sender<FunctionId>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl InMemoryStore {
    /// Empty store stamped by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamped by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            changes,
            clock,
        }
    }
}

fn register_key(kind: RegisterKind, group: &str, name: &str) -> RegisterKey {
    (kind, group.to_string(), name.to_string())
}

#[async_trait]
impl FunctionStore for InMemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn truncate(&self) -> Result<()> {
        *self.state.lock().await = State::default();
        Ok(())
    }

    async fn create_function(
        &self,
        function_id: &FunctionId,
        parameter: StoredPayload,
        initial: InitialStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.functions.contains_key(function_id) {
            return Err(CoreError::FunctionAlreadyExists {
                function_id: function_id.clone(),
            });
        }

        let now = self.clock.now();
        let (status, postponed_until) = match initial {
            InitialStatus::Executing => (Status::Executing, None),
            InitialStatus::Postponed { until } => (Status::Postponed, Some(until)),
        };
        state.functions.insert(
            function_id.clone(),
            StoredFunction {
                function_id: function_id.clone(),
                parameter,
                status,
                epoch: 0,
                sign_of_life: 0,
                result: None,
                error: None,
                postponed_until,
                expected_interrupt_count: None,
                interrupt_count: 0,
                state: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn restart_execution(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
    ) -> Result<StoredFunction> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let function =
            state
                .functions
                .get_mut(function_id)
                .ok_or_else(|| CoreError::FunctionNotFound {
                    function_id: function_id.clone(),
                })?;

        if function.epoch != expected_epoch {
            return Err(CoreError::ConcurrentModification {
                function_id: function_id.clone(),
                expected_epoch,
            });
        }
        if !function.status.is_restartable() {
            return Err(CoreError::InvalidFunctionState {
                function_id: function_id.clone(),
                expected: "executing, postponed or suspended".to_string(),
                actual: function.status,
            });
        }

        function.epoch += 1;
        function.sign_of_life = 0;
        function.status = Status::Executing;
        function.postponed_until = None;
        function.expected_interrupt_count = None;
        function.updated_at = now;
        Ok(function.clone())
    }

    async fn set_function_state(
        &self,
        function_id: &FunctionId,
        update: StatusUpdate,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(function) = state.functions.get_mut(function_id) else {
            return Ok(false);
        };
        if function.epoch != expected_epoch {
            return Ok(false);
        }

        function.status = update.status();
        function.postponed_until = None;
        function.expected_interrupt_count = None;
        function.updated_at = now;
        match update {
            StatusUpdate::Succeeded { result } => function.result = result,
            StatusUpdate::Failed { error } => function.error = Some(error),
            StatusUpdate::Postponed { until } => function.postponed_until = Some(until),
            StatusUpdate::Suspended {
                expected_interrupt_count,
            } => function.expected_interrupt_count = Some(expected_interrupt_count),
        }
        Ok(true)
    }

    async fn save_state(
        &self,
        function_id: &FunctionId,
        payload: StoredPayload,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(function) = state.functions.get_mut(function_id) else {
            return Ok(false);
        };
        if function.epoch != expected_epoch {
            return Ok(false);
        }

        let version = function.state.as_ref().map_or(0, |s| s.version) + 1;
        function.state = Some(StoredState { payload, version });
        Ok(true)
    }

    async fn update_sign_of_life(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
        new_beat: i64,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.functions.get_mut(function_id) {
            Some(function)
                if function.epoch == expected_epoch && function.status == Status::Executing =>
            {
                function.sign_of_life = new_beat;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_interrupt_count(&self, function_id: &FunctionId) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.functions.get_mut(function_id) {
            Some(function) => {
                function.interrupt_count += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_function(&self, function_id: &FunctionId) -> Result<Option<StoredFunction>> {
        Ok(self.state.lock().await.functions.get(function_id).cloned())
    }

    async fn get_functions_with_status(
        &self,
        type_id: &FunctionTypeId,
        status: Status,
        postponed_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<StatusEntry> = state
            .functions
            .values()
            .filter(|f| &f.function_id.type_id == type_id && f.status == status)
            .filter(|f| match (status, postponed_before) {
                (Status::Postponed, Some(before)) => {
                    f.postponed_until.is_some_and(|until| until <= before)
                }
                _ => true,
            })
            .map(StatusEntry::from)
            .collect();

        if status == Status::Postponed {
            entries.sort_by(|a, b| {
                a.postponed_until
                    .cmp(&b.postponed_until)
                    .then_with(|| a.function_id.cmp(&b.function_id))
            });
        } else {
            entries.sort_by(|a, b| a.function_id.cmp(&b.function_id));
        }
        Ok(entries)
    }

    async fn get_terminal_functions(
        &self,
        type_id: &FunctionTypeId,
        completed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StatusEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<StatusEntry> = state
            .functions
            .values()
            .filter(|f| {
                &f.function_id.type_id == type_id
                    && f.status.is_terminal()
                    && f.updated_at < completed_before
            })
            .map(StatusEntry::from)
            .collect();
        entries.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.function_id.cmp(&b.function_id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn delete_function(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let owned = state
            .functions
            .get(function_id)
            .is_some_and(|f| f.epoch == expected_epoch);
        if owned {
            state.functions.remove(function_id);
        }
        Ok(owned)
    }

    async fn register_replica(&self, replica_id: ReplicaId) -> Result<()> {
        self.state.lock().await.replicas.insert(replica_id, 0);
        Ok(())
    }

    async fn update_replica_heartbeat(&self, replica_id: ReplicaId) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.replicas.get_mut(&replica_id) {
            Some(heartbeat) => {
                *heartbeat += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_replicas(&self) -> Result<Vec<StoredReplica>> {
        Ok(self
            .state
            .lock()
            .await
            .replicas
            .iter()
            .map(|(id, heartbeat)| StoredReplica {
                replica_id: *id,
                heartbeat: *heartbeat,
            })
            .collect())
    }

    async fn delete_replica(&self, replica_id: ReplicaId) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .replicas
            .remove(&replica_id)
            .is_some())
    }
}

#[async_trait]
impl EffectStore for InMemoryStore {
    async fn set_effect(
        &self,
        function_id: &FunctionId,
        effect: StoredEffect,
        expected_epoch: Epoch,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_epoch(function_id, expected_epoch)?;
        let effects = state.effects.entry(function_id.clone()).or_default();
        match effects.iter_mut().find(|e| e.effect_id == effect.effect_id) {
            Some(existing) => *existing = effect,
            None => effects.push(effect),
        }
        Ok(())
    }

    async fn get_effects(&self, function_id: &FunctionId) -> Result<Vec<StoredEffect>> {
        Ok(self
            .state
            .lock()
            .await
            .effects
            .get(function_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_effect(
        &self,
        function_id: &FunctionId,
        effect_id: &EffectId,
        expected_epoch: Epoch,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_epoch(function_id, expected_epoch)?;
        if let Some(effects) = state.effects.get_mut(function_id) {
            effects.retain(|e| &e.effect_id != effect_id);
        }
        Ok(())
    }

    async fn remove_effects(&self, function_id: &FunctionId) -> Result<()> {
        self.state.lock().await.effects.remove(function_id);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append_message(
        &self,
        function_id: &FunctionId,
        payload: StoredPayload,
        idempotency_key: Option<String>,
    ) -> Result<bool> {
        {
            let mut state = self.state.lock().await;
            let log = state.messages.entry(function_id.clone()).or_default();
            if let Some(key) = &idempotency_key
                && log
                    .iter()
                    .any(|m| m.idempotency_key.as_deref() == Some(key.as_str()))
            {
                return Ok(false);
            }
            let position = log.len() as i64;
            log.push(StoredMessage {
                position,
                payload,
                idempotency_key,
            });
        }

        // No receivers is fine.
        let _ = self.changes.send(function_id.clone());
        Ok(true)
    }

    async fn get_messages(
        &self,
        function_id: &FunctionId,
        skip: usize,
    ) -> Result<Vec<StoredMessage>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .get(function_id)
            .map(|log| log.iter().skip(skip).cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_messages(&self, function_id: &FunctionId) -> Result<()> {
        self.state.lock().await.messages.remove(function_id);
        Ok(())
    }

    fn subscribe_to_changes(&self) -> broadcast::Receiver<FunctionId> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl UnderlyingRegister for InMemoryStore {
    async fn set_if_empty(
        &self,
        kind: RegisterKind,
        group: &str,
        name: &str,
        value: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = register_key(kind, group, name);
        if state.register.contains_key(&key) {
            return Ok(false);
        }
        state.register.insert(key, value.to_string());
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        kind: RegisterKind,
        group: &str,
        name: &str,
        new_value: &str,
        expected_value: &str,
        set_if_empty: bool,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = register_key(kind, group, name);
        let swap = match state.register.get(&key) {
            Some(current) => current == expected_value,
            None => set_if_empty,
        };
        if swap {
            state.register.insert(key, new_value.to_string());
        }
        Ok(swap)
    }

    async fn get(&self, kind: RegisterKind, group: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .register
            .get(&register_key(kind, group, name))
            .cloned())
    }

    async fn delete(
        &self,
        kind: RegisterKind,
        group: &str,
        name: &str,
        expected_value: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = register_key(kind, group, name);
        let matches = match (state.register.get(&key), expected_value) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(current), Some(expected)) => current == expected,
        };
        if matches {
            state.register.remove(&key);
        }
        Ok(matches)
    }

    async fn exists(&self, kind: RegisterKind, group: &str, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .register
            .contains_key(&register_key(kind, group, name)))
    }
}
