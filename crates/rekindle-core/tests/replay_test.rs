// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for deterministic re-execution.
//!
//! These tests verify that a re-executed function observes the effects,
//! messages and state recorded by earlier executions, and that appends with
//! an idempotency key land only once.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use rekindle_core::store::MessageStore;
use rekindle_core::{FunctionId, Outcome, Status, StoredError, Workflow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Progress {
    step: u32,
}

#[tokio::test]
async fn test_reexecution_replays_recorded_effects() {
    let ctx = TestContext::new();
    let registry = ctx.registry().await;

    let draws = Arc::new(AtomicUsize::new(0));
    let counter = draws.clone();
    let lottery = registry
        .register("lottery", move |_: (), wf: Workflow| {
            let counter = counter.clone();
            async move {
                let mut picks = Vec::new();
                for slot in 0..3 {
                    let counter = counter.clone();
                    let pick: usize = wf
                        .effect()
                        .capture(format!("pick-{slot}"), || async move {
                            Ok(counter.fetch_add(1, Ordering::SeqCst) * 7 + slot)
                        })
                        .await?;
                    picks.push(pick);
                }
                if wf.epoch() == 0 {
                    return Ok(Outcome::postpone_for(wf.now(), Duration::from_secs(3600)));
                }
                Ok(Outcome::Completed(picks))
            }
        })
        .unwrap();

    assert!(lottery.invoke("draw-1", &()).await.unwrap_err().is_parked());
    assert_eq!(draws.load(Ordering::SeqCst), 3);

    let picks = lottery.reinvoke("draw-1", 0).await.unwrap();
    assert_eq!(picks, vec![0, 8, 16]);
    assert_eq!(draws.load(Ordering::SeqCst), 3);

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_failed_effect_is_not_retried() {
    let ctx = TestContext::new();
    let registry = ctx.registry().await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let flaky = registry
        .register("flaky", move |_: (), wf: Workflow| {
            let counter = counter.clone();
            async move {
                let outcome = wf
                    .effect()
                    .capture("call", || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<u32, _>(anyhow::anyhow!("upstream unavailable"))
                    })
                    .await;
                match outcome {
                    Ok(value) => Ok(Outcome::Completed(value)),
                    Err(e) if wf.epoch() == 0 => {
                        tracing::info!(error = %e, "Effect failed, retrying later");
                        Ok(Outcome::postpone_for(wf.now(), Duration::from_secs(60)))
                    }
                    Err(e) => Ok(Outcome::Failed(StoredError::new(e.error_code(), e.to_string()))),
                }
            }
        })
        .unwrap();

    assert!(flaky.invoke("f", &()).await.unwrap_err().is_parked());
    let err = flaky.reinvoke("f", 0).await.unwrap_err();
    assert_eq!(err.error_code(), "FUNCTION_FAILED");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let stored = flaky.get_function("f").await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Failed);
    let error = stored.error.unwrap();
    assert_eq!(error.kind, "EFFECT_FAILED");
    assert!(error.message.contains("upstream unavailable"));

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_state_and_messages_survive_reexecution() {
    let ctx = TestContext::new();
    let registry = ctx.registry().await;

    let importer = registry
        .register("importer", |_: (), wf: Workflow| async move {
            let progress = wf
                .state::<Progress>()?
                .unwrap_or(Progress { step: 0 });
            let seen = wf.messages().len().await;
            if progress.step == 0 {
                wf.messages()
                    .append(&"batch-1".to_string(), Some("batch-1"))
                    .await?;
                wf.save_state(&Progress { step: 1 }).await?;
                return Ok(Outcome::postpone_for(wf.now(), Duration::from_secs(60)));
            }
            Ok(Outcome::Completed((progress.step, seen)))
        })
        .unwrap();

    assert!(importer.invoke("i-1", &()).await.unwrap_err().is_parked());
    let stored = importer.get_function("i-1").await.unwrap().unwrap();
    assert_eq!(stored.state.as_ref().map(|s| s.version), Some(1));

    assert_eq!(importer.reinvoke("i-1", 0).await.unwrap(), (1, 1));

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_idempotent_append_lands_once() {
    let ctx = TestContext::new();
    let registry = ctx.registry().await;

    let inbox = registry
        .register("inbox", |_: (), wf: Workflow| async move {
            let first = wf
                .messages()
                .append(&"hello".to_string(), Some("greeting"))
                .await?;
            let second = wf
                .messages()
                .append(&"hello again".to_string(), Some("greeting"))
                .await?;
            let unkeyed = wf.messages().append(&"ping".to_string(), None).await?;
            let delivered: Vec<String> = wf.messages().of_type().await?;
            Ok(Outcome::Completed((first, second, unkeyed, delivered)))
        })
        .unwrap();

    let (first, second, unkeyed, delivered) = inbox.invoke("box-1", &()).await.unwrap();
    assert!(first);
    assert!(!second);
    assert!(unkeyed);
    assert_eq!(delivered, vec!["hello".to_string(), "ping".to_string()]);

    let function_id = FunctionId::new("inbox", "box-1");
    let stored = ctx.store.get_messages(&function_id, 0).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].position, 0);
    assert_eq!(stored[1].position, 1);
    assert_eq!(ctx.function(&function_id).await.unwrap().interrupt_count, 2);

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_running_workflow_receives_external_messages() {
    let ctx = TestContext::new();
    let registry = ctx.registry().await;

    let collector = registry
        .register("collector", |expected: usize, wf: Workflow| async move {
            let mut subscription = wf.messages().subscribe(0).await;
            let mut received = Vec::new();
            while received.len() < expected {
                match subscription.recv_as::<String>().await? {
                    Some(message) => received.push(message),
                    None => anyhow::bail!("message log closed"),
                }
            }
            Ok(Outcome::Completed(received))
        })
        .unwrap();

    collector.schedule("c-1", &2).await.unwrap();
    let writer = collector.message_writer("c-1");
    assert!(writer.append(&"one".to_string(), Some("m-1")).await.unwrap());
    assert!(writer.append(&"two".to_string(), Some("m-2")).await.unwrap());

    ctx.wait_for_status(writer.function_id(), Status::Succeeded, Duration::from_secs(5))
        .await;
    assert_eq!(
        collector.result("c-1").await.unwrap(),
        Some(vec!["one".to_string(), "two".to_string()])
    );

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}
