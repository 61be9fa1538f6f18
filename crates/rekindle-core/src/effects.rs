// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Memoized side effects.
//!
//! An effect is identified by an [`EffectId`] that is stable across executions
//! of the same function instance. Its outcome is persisted the first time it
//! completes, so re-executions after a crash or a postponement replay the
//! stored value instead of repeating the work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::serializer::Serializer;
use crate::store::{EffectState, EffectStore, StoredEffect};
use crate::types::{EffectId, Epoch, FunctionId, StoredError};

/// How a previously started but unfinished effect is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkSemantics {
    /// Run the work again.
    AtLeastOnce,
    /// Refuse with [`CoreError::AmbiguousPriorAttempt`].
    AtMostOnce,
}

/// Effect memo of one function instance.
///
/// Writes are conditioned on the epoch the memo was loaded at, so an executor
/// that lost ownership fails with [`CoreError::ConcurrentModification`]
/// instead of overwriting the new owner's records.
pub struct Effect {
    function_id: FunctionId,
    epoch: Epoch,
    store: Arc<dyn EffectStore>,
    serializer: Arc<dyn Serializer>,
    cache: Mutex<HashMap<EffectId, EffectState>>,
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("function_id", &self.function_id)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl Effect {
    /// Load the persisted effects of `function_id` for the execution owning `epoch`.
    pub async fn load(
        function_id: FunctionId,
        epoch: Epoch,
        store: Arc<dyn EffectStore>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        let cache = store
            .get_effects(&function_id)
            .await?
            .into_iter()
            .map(|e| (e.effect_id, e.state))
            .collect();
        Ok(Self {
            function_id,
            epoch,
            store,
            serializer,
            cache: Mutex::new(cache),
        })
    }

    fn cached(&self, effect_id: &EffectId) -> Option<EffectState> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(effect_id)
            .cloned()
    }

    async fn persist(&self, effect_id: &EffectId, state: EffectState) -> Result<()> {
        self.store
            .set_effect(
                &self.function_id,
                StoredEffect {
                    effect_id: effect_id.clone(),
                    state: state.clone(),
                },
                self.epoch,
            )
            .await?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(effect_id.clone(), state);
        Ok(())
    }

    /// Run `work` once and memoize its outcome, retrying unfinished attempts.
    pub async fn capture<T, F, Fut>(&self, effect_id: impl Into<EffectId>, work: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(effect_id.into(), WorkSemantics::AtLeastOnce, work)
            .await
    }

    /// Same as [`capture`](Self::capture).
    pub async fn do_at_least_once<T, F, Fut>(
        &self,
        effect_id: impl Into<EffectId>,
        work: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(effect_id.into(), WorkSemantics::AtLeastOnce, work)
            .await
    }

    /// Run `work` at most once. An attempt that started in an earlier
    /// execution but never recorded an outcome fails with
    /// [`CoreError::AmbiguousPriorAttempt`].
    pub async fn do_at_most_once<T, F, Fut>(
        &self,
        effect_id: impl Into<EffectId>,
        work: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(effect_id.into(), WorkSemantics::AtMostOnce, work)
            .await
    }

    /// Run `work` under the given semantics.
    pub async fn run<T, F, Fut>(
        &self,
        effect_id: EffectId,
        semantics: WorkSemantics,
        work: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match self.cached(&effect_id) {
            Some(EffectState::Completed(payload)) => {
                debug!(function_id = %self.function_id, effect_id = %effect_id, "Replaying memoized effect");
                return self.serializer.as_ref().from_payload(&payload);
            }
            Some(EffectState::Failed(error)) => {
                return Err(CoreError::EffectFailed {
                    function_id: self.function_id.clone(),
                    effect_id,
                    error,
                });
            }
            Some(EffectState::Started) if semantics == WorkSemantics::AtMostOnce => {
                warn!(function_id = %self.function_id, effect_id = %effect_id, "Effect started earlier without an outcome");
                return Err(CoreError::AmbiguousPriorAttempt {
                    function_id: self.function_id.clone(),
                    effect_id,
                });
            }
            Some(EffectState::Started) | None => {}
        }

        self.persist(&effect_id, EffectState::Started).await?;

        match work().await {
            Ok(value) => {
                let payload = self.serializer.as_ref().to_payload(&value)?;
                self.persist(&effect_id, EffectState::Completed(payload))
                    .await?;
                Ok(value)
            }
            Err(e) => {
                let error = StoredError::from_anyhow("effect", &e);
                self.persist(&effect_id, EffectState::Failed(error.clone()))
                    .await?;
                Err(CoreError::EffectFailed {
                    function_id: self.function_id.clone(),
                    effect_id,
                    error,
                })
            }
        }
    }

    /// Memoized value of a completed effect.
    pub async fn get<T: DeserializeOwned>(&self, effect_id: impl Into<EffectId>) -> Result<Option<T>> {
        match self.cached(&effect_id.into()) {
            Some(EffectState::Completed(payload)) => {
                Ok(Some(self.serializer.as_ref().from_payload(&payload)?))
            }
            _ => Ok(None),
        }
    }

    /// Store `value` as the completed outcome of `effect_id`.
    pub async fn upsert<T: Serialize>(&self, effect_id: impl Into<EffectId>, value: &T) -> Result<()> {
        let payload = self.serializer.as_ref().to_payload(value)?;
        self.persist(&effect_id.into(), EffectState::Completed(payload))
            .await
    }

    /// Forget `effect_id` so the next run executes the work again.
    pub async fn clear(&self, effect_id: impl Into<EffectId>) -> Result<()> {
        let effect_id = effect_id.into();
        self.store
            .delete_effect(&self.function_id, &effect_id, self.epoch)
            .await?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&effect_id);
        Ok(())
    }

    /// Whether any record exists for `effect_id`.
    pub fn contains(&self, effect_id: impl Into<EffectId>) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&effect_id.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;
    use crate::store::{FunctionStore, InMemoryStore, InitialStatus};
    use crate::types::StoredPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fid() -> FunctionId {
        FunctionId::new("orders", "o-1")
    }

    fn new_store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::new())
    }

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = new_store();
        store
            .create_function(&fid(), StoredPayload::new("{}", "test"), InitialStatus::Executing)
            .await
            .unwrap();
        store
    }

    async fn effect_at(store: &Arc<InMemoryStore>, epoch: Epoch) -> Effect {
        Effect::load(fid(), epoch, store.clone(), Arc::new(JsonSerializer))
            .await
            .unwrap()
    }

    async fn effect(store: &Arc<InMemoryStore>) -> Effect {
        effect_at(store, 0).await
    }

    #[tokio::test]
    async fn test_capture_runs_once_across_executions() {
        let store = seeded_store().await;
        let calls = AtomicUsize::new(0);

        let first = effect(&store).await;
        let value: u32 = first
            .capture("charge", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);

        // A new execution loads the memo from the store.
        let second = effect(&store).await;
        assert!(second.contains("charge"));
        let value: u32 = second
            .capture("charge", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_memoized() {
        let store = seeded_store().await;
        let effect = effect(&store).await;

        let err = effect
            .capture::<u32, _, _>("charge", || async { Err(anyhow::anyhow!("card declined")) })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "EFFECT_FAILED");

        let err = effect
            .capture::<u32, _, _>("charge", || async { Ok(1) })
            .await
            .unwrap_err();
        match err {
            CoreError::EffectFailed { error, .. } => assert!(error.message.contains("card declined")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_at_most_once_refuses_unfinished_attempt() {
        let store = seeded_store().await;
        store
            .set_effect(
                &fid(),
                StoredEffect {
                    effect_id: EffectId::new("ship"),
                    state: EffectState::Started,
                },
                0,
            )
            .await
            .unwrap();
        let effect = effect(&store).await;

        let err = effect
            .do_at_most_once::<(), _, _>("ship", || async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "AMBIGUOUS_PRIOR_ATTEMPT");

        // At-least-once retries the same record.
        let value: String = effect
            .do_at_least_once("ship", || async { Ok("shipped".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "shipped");
    }

    #[tokio::test]
    async fn test_effect_marked_started_while_running() {
        let store = seeded_store().await;
        let effect = effect(&store).await;
        let observer = store.clone();

        effect
            .do_at_most_once("ship", || async move {
                let effects = observer.get_effects(&fid()).await?;
                assert_eq!(effects[0].state, EffectState::Started);
                Ok::<(), anyhow::Error>(())
            })
            .await
            .unwrap();

        let effects = store.get_effects(&fid()).await.unwrap();
        assert!(matches!(effects[0].state, EffectState::Completed(_)));
    }

    #[tokio::test]
    async fn test_get_upsert_clear() {
        let store = seeded_store().await;
        let effect = effect(&store).await;

        assert_eq!(effect.get::<String>("label").await.unwrap(), None);
        effect.upsert("label", &"DHL-123".to_string()).await.unwrap();
        assert_eq!(
            effect.get::<String>("label").await.unwrap().as_deref(),
            Some("DHL-123")
        );

        effect.clear("label").await.unwrap();
        assert!(!effect.contains("label"));
        assert!(store.get_effects(&fid()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_executor_cannot_overwrite_memo() {
        let store = seeded_store().await;
        let stale = effect(&store).await;

        store.restart_execution(&fid(), 0).await.unwrap();
        let current = effect_at(&store, 1).await;
        current.upsert("pay", &"fresh".to_string()).await.unwrap();

        let ran = AtomicUsize::new(0);
        let err = stale
            .capture("pay", || async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok("stale".to_string())
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONCURRENT_MODIFICATION");
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let err = stale.clear("pay").await.unwrap_err();
        assert_eq!(err.error_code(), "CONCURRENT_MODIFICATION");

        let reloaded = effect_at(&store, 1).await;
        assert_eq!(
            reloaded.get::<String>("pay").await.unwrap().as_deref(),
            Some("fresh")
        );
    }
}
