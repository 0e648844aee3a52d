use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failures raised by a storage backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("record {0} disappeared before it could be written")]
    RowMissing(Uuid),
    #[error("stored {field} has unrecognised value {value:?}")]
    Decode { field: &'static str, value: String },
}

impl StoreError {
    /// Whether the same call may succeed if re-run from a fresh read.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Decode { .. })
    }
}

#[derive(Error, Debug)]
pub enum ProgressionError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("lesson {lesson_id} belongs to module {actual}, not {requested}; moving between modules is not supported")]
    InvalidScope {
        lesson_id: Uuid,
        actual: Uuid,
        requested: Uuid,
    },

    #[error("assessment {assessment_id} allows at most {cap} attempts and all have been used")]
    MaxAttemptsExceeded { assessment_id: Uuid, cap: i32 },

    #[error("ordering of module {module_id} could not be updated consistently: {source}")]
    OrderingInconsistent {
        module_id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProgressionError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        ProgressionError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Retryable errors are safe to re-run with the same inputs; the
    /// operation re-reads its scope on every run.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProgressionError::OrderingInconsistent { .. } => true,
            ProgressionError::Store(e) => e.is_transient(),
            ProgressionError::NotFound { .. }
            | ProgressionError::InvalidScope { .. }
            | ProgressionError::MaxAttemptsExceeded { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let id = Uuid::new_v4();
        assert!(ProgressionError::from(StoreError::Unavailable("down".into())).is_retryable());
        assert!(ProgressionError::OrderingInconsistent {
            module_id: id,
            source: StoreError::RowMissing(id),
        }
        .is_retryable());
        assert!(!ProgressionError::MaxAttemptsExceeded {
            assessment_id: id,
            cap: 1
        }
        .is_retryable());
        assert!(!ProgressionError::InvalidScope {
            lesson_id: id,
            actual: id,
            requested: id
        }
        .is_retryable());
        assert!(!ProgressionError::from(StoreError::Decode {
            field: "status",
            value: "bogus".into()
        })
        .is_retryable());
    }

    #[test]
    fn test_messages_name_the_records() {
        let assessment_id = Uuid::new_v4();
        let err = ProgressionError::MaxAttemptsExceeded {
            assessment_id,
            cap: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains(&assessment_id.to_string()));
        assert!(msg.contains("at most 2"));

        let err = ProgressionError::not_found("lesson", assessment_id);
        assert_eq!(err.to_string(), format!("lesson {} not found", assessment_id));
    }
}
