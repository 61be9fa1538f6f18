// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for rekindle-core.
//!
//! Provides a unified error type with stable machine-readable codes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{EffectId, Epoch, FunctionId, FunctionTypeId, Status, StoredError};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the core.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Function instance was not found in the store.
    #[error("Function '{function_id}' not found")]
    FunctionNotFound {
        /// The function that was not found.
        function_id: FunctionId,
    },

    /// Function instance already exists (duplicate creation).
    #[error("Function '{function_id}' already exists")]
    FunctionAlreadyExists {
        /// The function that already exists.
        function_id: FunctionId,
    },

    /// The expected epoch no longer matches: another executor owns the instance.
    #[error("Function '{function_id}' was modified concurrently (expected epoch {expected_epoch})")]
    ConcurrentModification {
        /// The contended function.
        function_id: FunctionId,
        /// The epoch the caller expected to own.
        expected_epoch: Epoch,
    },

    /// Function is in a status that does not allow the requested operation.
    #[error("Function '{function_id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidFunctionState {
        /// The function.
        function_id: FunctionId,
        /// Description of the acceptable statuses.
        expected: String,
        /// The actual status.
        actual: Status,
    },

    /// An at-most-once effect was started by an earlier execution that never completed.
    #[error("Effect '{effect_id}' of function '{function_id}' was started but never completed")]
    AmbiguousPriorAttempt {
        /// The owning function.
        function_id: FunctionId,
        /// The ambiguous effect.
        effect_id: EffectId,
    },

    /// A memoized effect failed (now or in an earlier execution).
    #[error("Effect '{effect_id}' of function '{function_id}' failed: {error}")]
    EffectFailed {
        /// The owning function.
        function_id: FunctionId,
        /// The failed effect.
        effect_id: EffectId,
        /// The persisted failure.
        error: StoredError,
    },

    /// Function reached the Failed status.
    #[error("Function '{function_id}' failed: {error}")]
    FunctionFailed {
        /// The failed function.
        function_id: FunctionId,
        /// The persisted failure.
        error: StoredError,
    },

    /// Function was postponed instead of completing.
    #[error("Function '{function_id}' was postponed until {until}")]
    FunctionPostponed {
        /// The postponed function.
        function_id: FunctionId,
        /// When the postponed watchdog will resume it.
        until: DateTime<Utc>,
    },

    /// Function was suspended awaiting messages instead of completing.
    #[error("Function '{function_id}' was suspended awaiting {expected_interrupt_count} messages")]
    FunctionSuspended {
        /// The suspended function.
        function_id: FunctionId,
        /// Interrupt count that resumes it.
        expected_interrupt_count: i64,
    },

    /// A handler is already registered for the function type.
    #[error("Function type '{type_id}' is already registered")]
    FunctionTypeAlreadyRegistered {
        /// The duplicated type.
        type_id: FunctionTypeId,
    },

    /// Payload (de)serialization failed.
    #[error("Serialization error: {details}")]
    Serialization {
        /// Error details.
        details: String,
    },

    /// Backing store operation failed.
    #[error("Store error during '{operation}': {details}")]
    Store {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The runtime no longer accepts invocations.
    #[error("Runtime is shutting down")]
    ShuttingDown,

    /// Graceful shutdown timed out and escalated to a hard stop.
    #[error("Shutdown did not drain within {timeout:?} ({active_invocations} invocations still active)")]
    ShutdownTimeout {
        /// The configured drain timeout.
        timeout: Duration,
        /// Invocations still running when the timeout fired.
        active_invocations: usize,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::FunctionNotFound { .. } => "FUNCTION_NOT_FOUND",
            Self::FunctionAlreadyExists { .. } => "FUNCTION_ALREADY_EXISTS",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::InvalidFunctionState { .. } => "INVALID_FUNCTION_STATE",
            Self::AmbiguousPriorAttempt { .. } => "AMBIGUOUS_PRIOR_ATTEMPT",
            Self::EffectFailed { .. } => "EFFECT_FAILED",
            Self::FunctionFailed { .. } => "FUNCTION_FAILED",
            Self::FunctionPostponed { .. } => "FUNCTION_POSTPONED",
            Self::FunctionSuspended { .. } => "FUNCTION_SUSPENDED",
            Self::FunctionTypeAlreadyRegistered { .. } => "FUNCTION_TYPE_ALREADY_REGISTERED",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Store { .. } => "STORE_ERROR",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::ShutdownTimeout { .. } => "SHUTDOWN_TIMEOUT",
        }
    }

    /// True when the error only means another executor now owns the instance
    /// (or it no longer needs this executor). Background paths skip these silently.
    pub fn is_ownership_loss(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. }
                | Self::InvalidFunctionState { .. }
                | Self::FunctionNotFound { .. }
        )
    }

    /// True for the non-completing but expected outcomes of an invocation.
    pub fn is_parked(&self) -> bool {
        matches!(
            self,
            Self::FunctionPostponed { .. } | Self::FunctionSuspended { .. }
        )
    }

    /// Build a store error for the given operation.
    pub fn store(operation: &str, details: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.to_string(),
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid() -> FunctionId {
        FunctionId::new("orders", "o-1")
    }

    #[test]
    fn test_core_error_codes() {
        let test_cases = vec![
            (
                CoreError::FunctionNotFound { function_id: fid() },
                "FUNCTION_NOT_FOUND",
            ),
            (
                CoreError::FunctionAlreadyExists { function_id: fid() },
                "FUNCTION_ALREADY_EXISTS",
            ),
            (
                CoreError::ConcurrentModification {
                    function_id: fid(),
                    expected_epoch: 3,
                },
                "CONCURRENT_MODIFICATION",
            ),
            (
                CoreError::AmbiguousPriorAttempt {
                    function_id: fid(),
                    effect_id: EffectId::new("charge"),
                },
                "AMBIGUOUS_PRIOR_ATTEMPT",
            ),
            (
                CoreError::Store {
                    operation: "create_function".to_string(),
                    details: "disk full".to_string(),
                },
                "STORE_ERROR",
            ),
            (CoreError::ShuttingDown, "SHUTTING_DOWN"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::FunctionNotFound { function_id: fid() };
        assert_eq!(err.to_string(), "Function 'orders/o-1' not found");

        let err = CoreError::ConcurrentModification {
            function_id: fid(),
            expected_epoch: 2,
        };
        assert_eq!(
            err.to_string(),
            "Function 'orders/o-1' was modified concurrently (expected epoch 2)"
        );

        let err = CoreError::InvalidFunctionState {
            function_id: fid(),
            expected: "executing, postponed or suspended".to_string(),
            actual: Status::Succeeded,
        };
        assert_eq!(
            err.to_string(),
            "Function 'orders/o-1' is in invalid state: expected 'executing, postponed or suspended', got 'succeeded'"
        );

        let err = CoreError::FunctionFailed {
            function_id: fid(),
            error: StoredError::new("handler", "card declined"),
        };
        assert_eq!(
            err.to_string(),
            "Function 'orders/o-1' failed: [handler] card declined"
        );
    }

    #[test]
    fn test_ownership_loss_classification() {
        assert!(
            CoreError::ConcurrentModification {
                function_id: fid(),
                expected_epoch: 0
            }
            .is_ownership_loss()
        );
        assert!(CoreError::FunctionNotFound { function_id: fid() }.is_ownership_loss());
        assert!(
            !CoreError::AmbiguousPriorAttempt {
                function_id: fid(),
                effect_id: EffectId::new("x"),
            }
            .is_ownership_loss()
        );
        assert!(!CoreError::store("get_function", "timeout").is_ownership_loss());
    }

    #[test]
    fn test_serde_json_error_converts_to_serialization() {
        let err: CoreError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }
}
