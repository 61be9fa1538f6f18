// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifiers, statuses and opaque payloads shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generation counter guarding ownership of a function instance.
///
/// Starts at 0 on creation and is bumped every time an executor takes over.
pub type Epoch = i32;

/// Identifies a registered function type (the handler).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionTypeId(String);

impl FunctionTypeId {
    /// Create a type id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionTypeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FunctionTypeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies one instance of a function type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionInstanceId(String);

impl FunctionInstanceId {
    /// Create an instance id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionInstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FunctionInstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Globally unique key of one durable invocation.
///
/// Ordering compares the type first and the instance second, which gives the
/// watchdogs a deterministic tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId {
    /// Function type (handler) this instance belongs to.
    pub type_id: FunctionTypeId,
    /// Instance within the type.
    pub instance_id: FunctionInstanceId,
}

impl FunctionId {
    /// Create a function id.
    pub fn new(
        type_id: impl Into<FunctionTypeId>,
        instance_id: impl Into<FunctionInstanceId>,
    ) -> Self {
        Self {
            type_id: type_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_id, self.instance_id)
    }
}

/// Function instance status. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Owned by an executor that is (supposedly) running it.
    Executing,
    /// Parked until a point in time.
    Postponed,
    /// Parked until enough messages have arrived.
    Suspended,
    /// Finished with a result. Terminal.
    Succeeded,
    /// Finished with an error. Terminal.
    Failed,
}

impl Status {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Postponed => "postponed",
            Self::Suspended => "suspended",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Succeeded and Failed never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Statuses from which `restart_execution` may take over.
    pub fn is_restartable(&self) -> bool {
        matches!(self, Self::Executing | Self::Postponed | Self::Suspended)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized value plus the type tag it was produced from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPayload {
    /// Serialized representation.
    pub data: String,
    /// Type tag (usually `std::any::type_name` of the source value).
    pub type_name: String,
}

impl StoredPayload {
    /// Create a payload.
    pub fn new(data: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            type_name: type_name.into(),
        }
    }
}

/// Persisted description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredError {
    /// Human-readable message (full cause chain).
    pub message: String,
    /// Coarse classification, e.g. `handler`, `panic`, `effect`.
    pub kind: String,
}

impl StoredError {
    /// Create an error record.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an `anyhow::Error` including its cause chain.
    pub fn from_anyhow(kind: &str, error: &anyhow::Error) -> Self {
        Self::new(kind, format!("{error:#}"))
    }
}

impl fmt::Display for StoredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Identifies a memoized side effect within one function instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectId(String);

impl EffectId {
    /// Create an effect id.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EffectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EffectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies one running process taking part in watchdog partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Generate a fresh random replica id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
