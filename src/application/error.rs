use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    cache::StrategyError, config::LoadError, domain::error::DomainError,
    infra::error::InfraError,
};

use super::{block::BlockError, context::ContextError, script::ScriptError};

/// Error message chain collected for reporting.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }

    pub fn from_message(source: &'static str, message: impl Into<String>) -> Self {
        Self {
            source,
            messages: vec![message.into()],
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code for the command-line front end.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) | AppError::Strategy(_) => 78,
            AppError::Validation(_) | AppError::Domain(DomainError::Validation { .. }) => 64,
            AppError::Script(ScriptError::Io { .. }) => 66,
            AppError::Infra(InfraError::Io(_)) => 74,
            AppError::Script(ScriptError::Domain(_))
            | AppError::Script(ScriptError::UnknownBlock { .. })
            | AppError::Script(ScriptError::InvalidBlock { .. })
            | AppError::Script(ScriptError::InvalidProperty { .. })
            | AppError::Script(ScriptError::UnknownStrategy { .. })
            | AppError::Domain(DomainError::Parse { .. })
            | AppError::Domain(DomainError::Path { .. }) => 65,
            _ => 70,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_collect_the_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error = AppError::from(ScriptError::io("page.xml", io));

        let report = error.report();
        assert_eq!(report.messages.len(), 2);
        assert!(report.messages[0].contains("page.xml"));
        assert_eq!(report.messages[1], "gone");
        assert_eq!(error.exit_code(), 66);
    }

    #[test]
    fn parse_failures_map_to_data_errors() {
        let error = AppError::from(ScriptError::UnknownBlock {
            name: "http".to_string(),
        });
        assert_eq!(error.exit_code(), 65);
        assert_eq!(AppError::validation("bad").exit_code(), 64);
    }
}
