//! Classifiable errors.
//!
//! Most of the crate propagates `anyhow::Error`. The types here exist for
//! the handful of failures a caller must recognize and branch on: a lost
//! insert race (unique violation), an oversized prompt, and stage-contract
//! violations.

use crate::llm::LlmError;

/// Errors surfaced by [`Store`](crate::store::Store) adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected an insert.
    #[error("unique violation on {constraint}")]
    UniqueViolation { constraint: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Stage-contract failures.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{stage}: missing dependencies: {}", missing.join(", "))]
    MissingDeps {
        stage: &'static str,
        missing: Vec<&'static str>,
    },

    #[error("{stage}: missing inputs: {detail}")]
    MissingInputs { stage: &'static str, detail: String },

    #[error("{stage}: validation failed: {detail}")]
    Validation { stage: &'static str, detail: String },
}

const PG_UNIQUE_VIOLATION: &str = "23505";

/// True when any error in the chain is a unique-constraint violation,
/// either Postgres SQLSTATE 23505 or [`StoreError::UniqueViolation`].
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(StoreError::UniqueViolation { .. }) = cause.downcast_ref::<StoreError>() {
            return true;
        }
        if let Some(sqlx::Error::Database(db)) = cause.downcast_ref::<sqlx::Error>() {
            return db.code().as_deref() == Some(PG_UNIQUE_VIOLATION);
        }
        false
    })
}

/// True when any error in the chain is an LLM context-length rejection.
pub fn is_context_length(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<LlmError>(),
            Some(LlmError::ContextLengthExceeded { .. })
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn unique_violation_detected_through_context() {
        let err: anyhow::Result<()> = Err(StoreError::UniqueViolation {
            constraint: "concept_scope_key".into(),
        }
        .into());
        let wrapped = err.context("insert concepts").unwrap_err();
        assert!(is_unique_violation(&wrapped));
        assert!(!is_context_length(&wrapped));
    }

    #[test]
    fn context_length_detected() {
        let err = anyhow::Error::new(LlmError::ContextLengthExceeded { max: 10, actual: 20 }).context("delta call");
        assert!(is_context_length(&err));
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn missing_deps_message_names_stage() {
        let e = StageError::MissingDeps {
            stage: "concept_graph_build",
            missing: vec!["store", "llm"],
        };
        assert_eq!(e.to_string(), "concept_graph_build: missing dependencies: store, llm");
    }
}
