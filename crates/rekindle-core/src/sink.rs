// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unhandled-exception sink for background loops.
//!
//! Watchdogs, heartbeat loops, message delivery and background invocations
//! never propagate failures to a caller. They report a [`FrameworkError`] here
//! instead; the sink logs it and forwards it to an optional callback.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, warn};

use crate::types::{FunctionId, FunctionTypeId};

/// Background component that raised a [`FrameworkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Per-execution heartbeat loop.
    SignOfLife,
    /// Crashed watchdog.
    CrashedWatchdog,
    /// Postponed watchdog.
    PostponedWatchdog,
    /// Suspended watchdog.
    SuspendedWatchdog,
    /// Replica membership watchdog.
    ReplicaWatchdog,
    /// Retention watchdog.
    RetentionWatchdog,
    /// Message log delivery worker.
    MessageDelivery,
    /// Background (scheduled or resumed) invocation.
    Invocation,
}

impl Component {
    /// Returns the string representation of the component.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignOfLife => "sign_of_life",
            Self::CrashedWatchdog => "crashed_watchdog",
            Self::PostponedWatchdog => "postponed_watchdog",
            Self::SuspendedWatchdog => "suspended_watchdog",
            Self::ReplicaWatchdog => "replica_watchdog",
            Self::RetentionWatchdog => "retention_watchdog",
            Self::MessageDelivery => "message_delivery",
            Self::Invocation => "invocation",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured report of an unexpected background failure.
#[derive(Debug, Clone, Error)]
#[error("[{component}] {message}")]
pub struct FrameworkError {
    /// Where the failure happened.
    pub component: Component,
    /// Function type the component works for, if any.
    pub type_id: Option<FunctionTypeId>,
    /// Function instance involved, if any.
    pub function_id: Option<FunctionId>,
    /// Failure description.
    pub message: String,
}

impl FrameworkError {
    /// Create a report without function context.
    pub fn new(component: Component, message: impl Into<String>) -> Self {
        Self {
            component,
            type_id: None,
            function_id: None,
            message: message.into(),
        }
    }

    /// Attach the function type.
    pub fn with_type(mut self, type_id: &FunctionTypeId) -> Self {
        self.type_id = Some(type_id.clone());
        self
    }

    /// Attach the function instance (and its type).
    pub fn with_function(mut self, function_id: &FunctionId) -> Self {
        self.type_id = Some(function_id.type_id.clone());
        self.function_id = Some(function_id.clone());
        self
    }
}

type Callback = Arc<dyn Fn(&FrameworkError) + Send + Sync>;

/// Destination for [`FrameworkError`]s. Cheap to clone.
#[derive(Clone, Default)]
pub struct ExceptionSink {
    callback: Option<Callback>,
}

impl fmt::Debug for ExceptionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionSink")
            .field("callback", &self.callback.as_ref().map(|_| "..."))
            .finish()
    }
}

impl ExceptionSink {
    /// Sink that only logs.
    pub fn logging() -> Self {
        Self::default()
    }

    /// Sink that logs and then forwards to `callback`.
    pub fn new(callback: impl Fn(&FrameworkError) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// Report a failure. Never panics, even if the callback does.
    pub fn report(&self, report: FrameworkError) {
        error!(
            component = %report.component,
            type_id = ?report.type_id.as_ref().map(|t| t.as_str()),
            function_id = ?report.function_id.as_ref().map(|f| f.to_string()),
            "{}",
            report.message
        );

        if let Some(callback) = &self.callback
            && std::panic::catch_unwind(AssertUnwindSafe(|| callback(&report))).is_err()
        {
            warn!(component = %report.component, "Exception sink callback panicked");
        }
    }
}
