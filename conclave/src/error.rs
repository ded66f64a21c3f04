//! Top-level error for engine and workflow entry points.
//!
//! Subsystems carry their own thiserror enums; this type is what callers of
//! [`StreamEngine`](crate::engine::StreamEngine) and the workflow executor see.

use thiserror::Error;

/// Errors surfaced by the engine-facing API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input failed validation (bad cron, malformed JSON, unknown kind).
    #[error("validation: {0}")]
    Validation(String),

    /// Referenced entity does not exist or is not visible to the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to act on the referenced entity.
    #[error("authorization: {0}")]
    Authorization(String),

    /// Upstream LLM provider failed.
    #[error("provider: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    /// Persistence failed.
    #[error("store: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Workflow definition or execution failed.
    #[error("workflow: {0}")]
    Workflow(String),

    /// Anything else that should abort the current call.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Display strings carry the subsystem prefix.
    #[test]
    fn display_includes_prefix() {
        let e = EngineError::Validation("bad cron".into());
        assert_eq!(e.to_string(), "validation: bad cron");
        let e = EngineError::NotFound("session 9".into());
        assert!(e.to_string().contains("not found"));
    }
}
