use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("malformed document: {message}")]
    Parse { message: String },
    #[error("invalid path expression `{expression}`: {reason}")]
    Path { expression: String, reason: String },
    #[error("domain validation failed: {message}")]
    Validation { message: String },
    #[error("domain invariant violated: {message}")]
    Invariant { message: String },
}

impl DomainError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn path(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Path {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }
}
