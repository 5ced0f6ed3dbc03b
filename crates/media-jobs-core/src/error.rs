//! Error types for the job tracking library

/// Main error type for job tracking operations
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid transition: cannot {action} {entity} in state {from}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        action: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Job not found: {id}")]
    NotFound { id: String },

    #[error("Stage not found: {stage}")]
    StageNotFound { stage: String },

    #[error("Logging initialization failed: {message}")]
    LoggingError { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        JobError::ConfigError {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        JobError::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        action: impl std::fmt::Display,
    ) -> Self {
        JobError::InvalidTransition {
            entity,
            from: from.to_string(),
            action: action.to_string(),
        }
    }

    /// Get the error type as a string for categorization
    pub fn error_type(&self) -> &'static str {
        match self {
            JobError::Io(_) => "io_error",
            JobError::ConfigError { .. } => "config_error",
            JobError::InvalidTransition { .. } => "invalid_transition",
            JobError::InvalidInput { .. } => "invalid_input",
            JobError::NotFound { .. } => "not_found",
            JobError::StageNotFound { .. } => "stage_not_found",
            JobError::LoggingError { .. } => "logging_error",
            JobError::Serialization(_) => "serialization_error",
        }
    }

    /// Check if the error is recoverable by retrying the same call
    pub fn is_recoverable(&self) -> bool {
        matches!(self, JobError::Io(_))
    }

    /// True for lifecycle misuse errors
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, JobError::InvalidTransition { .. })
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, JobError>;
