// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for watchdog-driven recovery.
//!
//! These tests verify that abandoned, due and resumable functions are taken
//! over at the next epoch, that only one executor wins a takeover, and that
//! expired terminal functions are purged.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use rekindle_core::store::{
    EffectState, EffectStore, FunctionStore, InitialStatus, MessageStore, StatusUpdate,
    StoredEffect,
};
use rekindle_core::{Clock, FunctionId, Outcome, Settings, Status, Workflow};

const WAIT: Duration = Duration::from_secs(10);

async fn seed_abandoned(ctx: &TestContext, function_id: &FunctionId, amount: u64) {
    ctx.store
        .create_function(function_id, payload(&amount), InitialStatus::Executing)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_crashed_function_resumes_at_next_epoch() {
    let ctx = TestContext::new();
    let function_id = FunctionId::new("charge", "o-1");
    seed_abandoned(&ctx, &function_id, 250).await;
    ctx.store
        .set_effect(
            &function_id,
            StoredEffect {
                effect_id: "charge".into(),
                state: EffectState::Completed(payload(&"ch-1".to_string())),
            },
            0,
        )
        .await
        .unwrap();

    let registry = ctx.registry().await;
    let charges = Arc::new(AtomicUsize::new(0));
    let counter = charges.clone();
    registry
        .register("charge", move |amount: u64, wf: Workflow| {
            let counter = counter.clone();
            async move {
                let charge_id: String = wf
                    .effect()
                    .capture("charge", || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(format!("ch-{amount}"))
                    })
                    .await?;
                Ok(Outcome::Completed(charge_id))
            }
        })
        .unwrap();

    let stored = ctx
        .wait_for_status(&function_id, Status::Succeeded, WAIT)
        .await;
    assert_eq!(stored.epoch, 1);
    assert_eq!(stored.result, Some(payload(&"ch-1".to_string())));
    assert_eq!(charges.load(Ordering::SeqCst), 0);
    assert!(ctx.reports().is_empty());

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeating_function_is_left_alone() {
    let ctx = TestContext::new();
    let registry = ctx.registry().await;
    let slow = registry
        .register("slow", |_: (), wf: Workflow| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Outcome::Completed(wf.epoch()))
        })
        .unwrap();

    // The crash window is 200ms; a live heartbeat keeps the epoch at 0.
    assert_eq!(slow.invoke("s", &()).await.unwrap(), 0);
    let stored = slow.get_function("s").await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Succeeded);
    assert_eq!(stored.epoch, 0);

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_at_most_once_effect_interrupted_by_crash_fails() {
    let ctx = TestContext::new();
    let function_id = FunctionId::new("payout", "p-1");
    seed_abandoned(&ctx, &function_id, 10).await;
    ctx.store
        .set_effect(
            &function_id,
            StoredEffect {
                effect_id: "transfer".into(),
                state: EffectState::Started,
            },
            0,
        )
        .await
        .unwrap();

    let registry = ctx.registry().await;
    registry
        .register("payout", |amount: u64, wf: Workflow| async move {
            let receipt: u64 = wf
                .effect()
                .do_at_most_once("transfer", || async move { Ok(amount) })
                .await?;
            Ok(Outcome::Completed(receipt))
        })
        .unwrap();

    let stored = ctx.wait_for_status(&function_id, Status::Failed, WAIT).await;
    assert_eq!(stored.epoch, 1);
    let error = stored.error.unwrap();
    assert_eq!(error.kind, "handler");
    assert!(error.message.contains("never completed"));

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_only_one_concurrent_restart_wins() {
    let ctx = TestContext::new();
    let function_id = FunctionId::new("race", "r-1");
    ctx.store
        .create_function(
            &function_id,
            payload(&()),
            InitialStatus::Postponed {
                until: ctx.clock.now(),
            },
        )
        .await
        .unwrap();

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let store = ctx.store.clone();
            let function_id = function_id.clone();
            tokio::spawn(async move { store.restart_execution(&function_id, 0).await })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(function) => {
                winners += 1;
                assert_eq!(function.epoch, 1);
            }
            Err(e) => assert_eq!(e.error_code(), "CONCURRENT_MODIFICATION"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_epoch_only_moves_forward() {
    let ctx = TestContext::new();
    let function_id = FunctionId::new("epochs", "e-1");
    seed_abandoned(&ctx, &function_id, 1).await;

    for expected in 0..5 {
        let function = ctx
            .store
            .restart_execution(&function_id, expected)
            .await
            .unwrap();
        assert_eq!(function.epoch, expected + 1);
        assert_eq!(function.sign_of_life, 0);
    }

    // A stale owner can neither heartbeat nor finish.
    assert!(!ctx.store.update_sign_of_life(&function_id, 3, 1).await.unwrap());
    assert!(
        !ctx.store
            .set_function_state(&function_id, StatusUpdate::Succeeded { result: None }, 3)
            .await
            .unwrap()
    );
    let err = ctx
        .store
        .restart_execution(&function_id, 3)
        .await
        .unwrap_err();
    assert!(err.is_ownership_loss());
    assert_eq!(ctx.function(&function_id).await.unwrap().epoch, 5);
}

#[tokio::test(start_paused = true)]
async fn test_due_postponed_functions_run_in_due_order() {
    let ctx = TestContext::new();
    let registry = ctx
        .registry_with(Settings {
            max_parallel_retry_invocations: 1,
            ..fast_settings()
        })
        .await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let reminder = registry
        .register("reminder", move |name: String, _wf: Workflow| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(name);
                Ok(Outcome::Completed(()))
            }
        })
        .unwrap();

    // Instance ids sort opposite to their due times.
    let now = ctx.clock.now();
    reminder
        .schedule_at("z", &"first".to_string(), now + chrono::Duration::seconds(1))
        .await
        .unwrap();
    reminder
        .schedule_at("a", &"second".to_string(), now + chrono::Duration::seconds(3))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(order.lock().unwrap().is_empty());

    ctx.clock.advance(Duration::from_secs(6));
    ctx.wait_for_status(&FunctionId::new("reminder", "z"), Status::Succeeded, WAIT)
        .await;
    let a = ctx
        .wait_for_status(&FunctionId::new("reminder", "a"), Status::Succeeded, WAIT)
        .await;
    assert_eq!(a.epoch, 1);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_suspended_function_resumes_once_messages_arrive() {
    let ctx = TestContext::new();
    let registry = ctx.registry().await;
    let approvals = registry
        .register("approvals", |_: (), wf: Workflow| async move {
            let votes: Vec<String> = wf.messages().of_type().await?;
            if votes.len() < 2 {
                return Ok(Outcome::Suspended(2));
            }
            Ok(Outcome::Completed(votes.join(",")))
        })
        .unwrap();

    let err = approvals.invoke("doc-1", &()).await.unwrap_err();
    assert_eq!(err.error_code(), "FUNCTION_SUSPENDED");

    let writer = approvals.message_writer("doc-1");
    assert!(writer.append(&"alice".to_string(), Some("vote-alice")).await.unwrap());
    assert!(!writer.append(&"alice".to_string(), Some("vote-alice")).await.unwrap());

    // One distinct message is not enough to resume.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let stored = approvals.get_function("doc-1").await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Suspended);
    assert_eq!(stored.interrupt_count, 1);

    assert!(writer.append(&"bob".to_string(), Some("vote-bob")).await.unwrap());
    let stored = ctx
        .wait_for_status(writer.function_id(), Status::Succeeded, WAIT)
        .await;
    assert_eq!(stored.epoch, 1);
    assert_eq!(
        approvals.result("doc-1").await.unwrap(),
        Some("alice,bob".to_string())
    );

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expired_terminal_functions_are_purged() {
    let ctx = TestContext::new();
    let registry = ctx
        .registry_with(Settings {
            retention_period: Some(Duration::from_secs(60)),
            ..fast_settings()
        })
        .await;
    let audit = registry
        .register("audit", |later: bool, wf: Workflow| async move {
            wf.messages().append(&"entry".to_string(), None).await?;
            if later {
                return Ok(Outcome::postpone_for(wf.now(), Duration::from_secs(3600)));
            }
            let _: u32 = wf.effect().capture("count", || async { Ok(1) }).await?;
            Ok(Outcome::Completed(()))
        })
        .unwrap();

    audit.invoke("done", &false).await.unwrap();
    assert!(audit.invoke("waiting", &true).await.unwrap_err().is_parked());
    let done = audit.get_function("done").await.unwrap().unwrap().function_id;
    let waiting = audit
        .get_function("waiting")
        .await
        .unwrap()
        .unwrap()
        .function_id;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(ctx.function(&done).await.is_some());

    ctx.clock.advance(Duration::from_secs(61));
    let deadline = tokio::time::Instant::now() + WAIT;
    while ctx.function(&done).await.is_some() {
        assert!(tokio::time::Instant::now() < deadline, "function not purged");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ctx.store.get_effects(&done).await.unwrap().is_empty());
    assert!(ctx.store.get_messages(&done, 0).await.unwrap().is_empty());

    // Non-terminal functions are kept regardless of age.
    let waiting = ctx.function(&waiting).await.unwrap();
    assert_eq!(waiting.status, Status::Postponed);

    registry.shutdown(Duration::from_secs(1)).await.unwrap();
}
