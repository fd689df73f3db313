//! Typed error hierarchy for the lifecycle engine.
//!
//! Every variant belongs to one `ErrorKind`, which transports (HTTP, CLI) use
//! to pick a status code without matching on individual variants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DockyardError {
    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("Container name '{name}' is already taken")]
    NameTaken { name: String },

    #[error("Container '{name}' is still being created")]
    CreationInProgress { name: String },

    #[error("Another operation is in progress for container {id}")]
    OperationInProgress { id: String },

    #[error("Container {id} not found")]
    ContainerNotFound { id: String },

    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Runtime {operation} failed: {message}")]
    Runtime { operation: String, message: String },

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Runtime,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Runtime => "runtime",
            Self::Internal => "internal",
        }
    }
}

impl DockyardError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn runtime(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Runtime {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NameTaken { .. }
            | Self::CreationInProgress { .. }
            | Self::OperationInProgress { .. } => ErrorKind::Conflict,
            Self::ContainerNotFound { .. } | Self::TaskNotFound { .. } => ErrorKind::NotFound,
            Self::Runtime { .. } => ErrorKind::Runtime,
            Self::Store(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_variants_share_a_kind() {
        let taken = DockyardError::NameTaken { name: "demo".into() };
        let creating = DockyardError::CreationInProgress { name: "demo".into() };
        let busy = DockyardError::OperationInProgress { id: "abc".into() };
        assert_eq!(taken.kind(), ErrorKind::Conflict);
        assert_eq!(creating.kind(), ErrorKind::Conflict);
        assert_eq!(busy.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn validation_message_names_the_field() {
        let err = DockyardError::validation("name", "must not be empty");
        assert_eq!(err.to_string(), "Invalid name: must not be empty");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn runtime_error_is_classified() {
        let err = DockyardError::runtime("create", "no such image");
        assert_eq!(err.to_string(), "Runtime create failed: no such image");
        assert_eq!(err.kind(), ErrorKind::Runtime);
    }

    #[test]
    fn anyhow_errors_are_internal() {
        let err: DockyardError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "boom");
    }
}
