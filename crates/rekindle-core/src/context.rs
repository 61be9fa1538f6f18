// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation context handed to handlers.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::clock::Clock;
use crate::coordination::{Arbitrator, Monitor};
use crate::effects::Effect;
use crate::error::{CoreError, Result};
use crate::messages::MessageLog;
use crate::serializer::Serializer;
use crate::sink::ExceptionSink;
use crate::store::{StoredFunction, Stores};
use crate::types::{Epoch, FunctionId, StoredPayload};

/// Everything a handler needs to act on its function instance.
///
/// A fresh `Workflow` is built for every execution. Effects and messages are
/// loaded from the stores, so a re-execution observes what earlier executions
/// recorded.
#[derive(Clone)]
pub struct Workflow {
    function_id: FunctionId,
    epoch: Epoch,
    correlation_id: Uuid,
    effect: Arc<Effect>,
    messages: MessageLog,
    stores: Stores,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<Option<StoredPayload>>>,
    monitor: Monitor,
    arbitrator: Arbitrator,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("function_id", &self.function_id)
            .field("epoch", &self.epoch)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    pub(crate) async fn load(
        function: &StoredFunction,
        stores: Stores,
        serializer: Arc<dyn Serializer>,
        clock: Arc<dyn Clock>,
        sink: ExceptionSink,
    ) -> Result<Self> {
        let function_id = function.function_id.clone();
        let effect = Effect::load(
            function_id.clone(),
            function.epoch,
            stores.effects.clone(),
            serializer.clone(),
        )
        .await?;
        let messages = MessageLog::open(
            function_id.clone(),
            stores.messages.clone(),
            stores.functions.clone(),
            serializer.clone(),
            sink,
        )
        .await?;

        Ok(Self {
            function_id,
            epoch: function.epoch,
            correlation_id: Uuid::new_v4(),
            effect: Arc::new(effect),
            messages,
            monitor: Monitor::new(stores.register.clone()),
            arbitrator: Arbitrator::new(stores.register.clone()),
            stores,
            serializer,
            clock,
            state: Arc::new(Mutex::new(function.state.as_ref().map(|s| s.payload.clone()))),
        })
    }

    /// The function instance being executed.
    pub fn function_id(&self) -> &FunctionId {
        &self.function_id
    }

    /// Epoch this execution owns.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Unique id of this execution, for log correlation.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Memoized effects.
    pub fn effect(&self) -> &Effect {
        &self.effect
    }

    /// The instance's message log.
    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    /// Distributed lock over the shared register.
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Single-decision consensus over the shared register.
    pub fn arbitrator(&self) -> &Arbitrator {
        &self.arbitrator
    }

    /// Current time of the runtime clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Last saved state snapshot.
    pub fn state<S: DeserializeOwned>(&self) -> Result<Option<S>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match state {
            Some(payload) => Ok(Some(self.serializer.as_ref().from_payload(&payload)?)),
            None => Ok(None),
        }
    }

    /// Persist `state` as a save point.
    ///
    /// Fails with [`CoreError::ConcurrentModification`] when another executor
    /// has taken over the instance.
    pub async fn save_state<S: Serialize>(&self, state: &S) -> Result<()> {
        let payload = self.serializer.as_ref().to_payload(state)?;
        let saved = self
            .stores
            .functions
            .save_state(&self.function_id, payload.clone(), self.epoch)
            .await?;
        if !saved {
            return Err(CoreError::ConcurrentModification {
                function_id: self.function_id.clone(),
                expected_epoch: self.epoch,
            });
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(payload);
        Ok(())
    }

    /// Interrupt count to suspend on so the function resumes at the next message.
    pub async fn next_message_count(&self) -> i64 {
        self.messages.len().await as i64 + 1
    }
}
