// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for testplane-core.
//!
//! Provides a unified error type with stable error-code strings that the
//! REST layer maps onto wire responses.

use std::fmt;

use crate::model::Priority;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while touching the data model.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Endpoint was not found in the store.
    EndpointNotFound {
        /// The endpoint uid that was not found.
        uid: String,
    },

    /// Task was not found in the store.
    TaskNotFound {
        /// The task id that was not found.
        task_id: String,
    },

    /// Task queue was not found for an (endpoint, priority) pair.
    QueueNotFound {
        /// The endpoint uid the queue belongs to.
        endpoint: String,
        /// The queue priority.
        priority: Priority,
    },

    /// Queue lock could not be acquired within the retry budget.
    LockTimeout {
        /// Which queue the lock belongs to.
        queue: String,
    },

    /// A stored status string did not parse into its state machine.
    InvalidStatus {
        /// The entity kind (endpoint, task, event).
        entity: &'static str,
        /// The offending value.
        value: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Store operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the stable error code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EndpointNotFound { .. } => "ENDPOINT_NOT_FOUND",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::QueueNotFound { .. } => "QUEUE_NOT_FOUND",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::DatabaseError { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndpointNotFound { uid } => {
                write!(f, "Endpoint '{}' not found", uid)
            }
            Self::TaskNotFound { task_id } => {
                write!(f, "Task '{}' not found", task_id)
            }
            Self::QueueNotFound { endpoint, priority } => {
                write!(
                    f,
                    "Task queue '{}' with priority {} not found",
                    endpoint,
                    priority.as_i32()
                )
            }
            Self::LockTimeout { queue } => {
                write!(f, "Timed out acquiring the lock of queue '{}'", queue)
            }
            Self::InvalidStatus { entity, value } => {
                write!(f, "Invalid {} status '{}'", entity, value)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (
                CoreError::EndpointNotFound {
                    uid: "x".to_string(),
                },
                "ENDPOINT_NOT_FOUND",
            ),
            (
                CoreError::TaskNotFound {
                    task_id: "x".to_string(),
                },
                "TASK_NOT_FOUND",
            ),
            (
                CoreError::QueueNotFound {
                    endpoint: "x".to_string(),
                    priority: Priority::Default,
                },
                "QUEUE_NOT_FOUND",
            ),
            (
                CoreError::LockTimeout {
                    queue: "x".to_string(),
                },
                "LOCK_TIMEOUT",
            ),
            (
                CoreError::ValidationError {
                    field: "uid".to_string(),
                    message: "not a uuid".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "for {:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            CoreError::LockTimeout {
                queue: "q".to_string()
            }
            .is_retryable()
        );
        assert!(
            CoreError::DatabaseError {
                operation: "query".to_string(),
                details: "io".to_string()
            }
            .is_retryable()
        );
        assert!(
            !CoreError::TaskNotFound {
                task_id: "t".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_display() {
        let err = CoreError::LockTimeout {
            queue: "ep:2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Timed out acquiring the lock of queue 'ep:2'"
        );

        let err = CoreError::QueueNotFound {
            endpoint: "abc".to_string(),
            priority: Priority::Max,
        };
        assert_eq!(err.to_string(), "Task queue 'abc' with priority 3 not found");
    }
}
