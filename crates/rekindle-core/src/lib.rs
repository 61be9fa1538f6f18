// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rekindle Core - Crash-Recovery and Coordination Engine
//!
//! This crate lets a service invoke long-running functions whose progress
//! survives crashes, redeploys and partitions. Every function instance is
//! persisted through pluggable stores; background watchdogs detect abandoned
//! or due instances and run them again.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          FunctionsRegistry                               │
//! │        register / invoke / schedule / schedule_at / reinvoke             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                         │                          │
//!           ▼                         ▼                          ▼
//! ┌───────────────────┐   ┌───────────────────────┐   ┌──────────────────────┐
//! │  Invocation       │   │  Watchdogs            │   │  ReplicaWatchdog     │
//! │  Workflow context │   │  crashed / postponed  │◄──│  offset / count      │
//! │  SignOfLife loop  │   │  suspended / retention│   │  strike-out          │
//! └───────────────────┘   └───────────────────────┘   └──────────────────────┘
//!     │     │      │                  │                          │
//!     │     │      └── Monitor / Arbitrator ──┐                  │
//!     │     ▼                                 ▼                  │
//!     │  Effect memo        MessageLog    UnderlyingRegister     │
//!     ▼     │                  │                 │               │
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │      Stores: FunctionStore / EffectStore / MessageStore / Register       │
//! │                (InMemoryStore ships with the crate)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Function Lifecycle
//!
//! ```text
//!                ┌────────────┐  Outcome::Postponed   ┌───────────┐
//!  invoke ──────►│ Executing  │──────────────────────►│ Postponed │
//!                │            │◄──────────────────────│           │
//!                └────────────┘  due (watchdog)       └───────────┘
//!                 │   ▲     │ ▲
//!   Completed /   │   │     │ │ interrupt_count >= expected (watchdog)
//!   Failed        │   │     ▼ │
//!                 │   │   ┌───────────┐
//!                 │   │   │ Suspended │
//!                 │   │   └───────────┘
//!                 │   └── crashed (watchdog): epoch + 1
//!                 ▼
//!         ┌─────────────────────┐
//!         │ Succeeded │ Failed  │  terminal; deleted after the
//!         └─────────────────────┘  retention period, if configured
//! ```
//!
//! # Ownership
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `epoch` | Bumped by every takeover; every write is conditioned on it |
//! | `sign_of_life` | Heartbeat of the current epoch's executor |
//! | `interrupt_count` | Messages appended to the instance's log |
//!
//! An executor whose epoch is stale can no longer heartbeat, save state or
//! complete the function, so at most one executor makes progress per epoch.

#![deny(missing_docs)]

/// Identifiers, statuses and payloads.
pub mod types;

/// Error types.
pub mod error;

/// Runtime settings.
pub mod settings;

/// Wall-clock abstraction.
pub mod clock;

/// Payload serialization.
pub mod serializer;

/// Background failure sink.
pub mod sink;

/// Store contracts and the in-memory backend.
pub mod store;

/// Monitor and Arbitrator.
pub mod coordination;

/// Per-execution heartbeat.
pub mod sign_of_life;

/// Watchdog loops.
pub mod watchdogs;

/// Per-instance message log.
pub mod messages;

/// Memoized effects.
pub mod effects;

/// Handler outcomes.
pub mod outcome;

/// Per-invocation context.
pub mod context;

/// Registry and invocation engine.
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Workflow;
pub use coordination::{Arbitrator, Monitor, MonitorLock};
pub use effects::{Effect, WorkSemantics};
pub use error::{CoreError, Result};
pub use messages::{MessageLog, MessageSubscription, MessageWriter};
pub use outcome::Outcome;
pub use registry::{FunctionsRegistry, FunctionsRegistryBuilder, RegisteredFunction, RegistryConfig};
pub use serializer::{JsonSerializer, Serializer};
pub use settings::{ConfigError, Settings};
pub use sink::{Component, ExceptionSink, FrameworkError};
pub use store::{InMemoryStore, Stores};
pub use types::{
    EffectId, Epoch, FunctionId, FunctionInstanceId, FunctionTypeId, ReplicaId, Status,
    StoredError, StoredPayload,
};
pub use watchdogs::{ReplicaAssignment, ReplicaWatchdog};
