//! Typed error system with context and tracing

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Error context containing metadata about the error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error_id: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub operation: String,
    pub user_id: Option<String>,
    pub bet_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new(service: &str, operation: &str) -> Self {
        Self {
            error_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            service: service.to_string(),
            operation: operation.to_string(),
            user_id: None,
            bet_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl fmt::Display) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_bet(mut self, bet_id: impl fmt::Display) -> Self {
        self.bet_id = Some(bet_id.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed create/join/vote payload, rejected before any mutation.
    Validation,
    /// The bet is no longer in a state that permits the operation.
    StateConflict,
    /// Caller is not the creator/resolver/participant the operation needs.
    Authorization,
    /// No caller identity could be resolved.
    Unauthenticated,
    InsufficientFunds,
    NotFound,
    /// Already joined, already exists.
    Duplicate,
    /// Datastore or other infrastructure failure.
    Infrastructure,
    Configuration,
}

impl ErrorKind {
    /// Only infrastructure failures are worth a user-initiated retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Infrastructure)
    }

    /// Business outcomes the caller is expected to handle.
    pub fn is_business(&self) -> bool {
        !matches!(self, ErrorKind::Infrastructure | ErrorKind::Configuration)
    }

    /// Get user-facing error message
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "Validation failed",
            ErrorKind::StateConflict => "Too late: the bet no longer allows this",
            ErrorKind::Authorization => "Not allowed for this bet",
            ErrorKind::Unauthenticated => "Authentication required",
            ErrorKind::InsufficientFunds => "Insufficient balance",
            ErrorKind::NotFound => "Resource not found",
            ErrorKind::Duplicate => "Already recorded",
            ErrorKind::Infrastructure => "Service temporarily unavailable",
            ErrorKind::Configuration => "Configuration error",
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::StateConflict => "STATE_CONFLICT",
            ErrorKind::Authorization => "AUTHORIZATION_ERROR",
            ErrorKind::Unauthenticated => "UNAUTHENTICATED",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Duplicate => "DUPLICATE",
            ErrorKind::Infrastructure => "INFRASTRUCTURE_ERROR",
            ErrorKind::Configuration => "CONFIGURATION_ERROR",
        }
    }
}

/// Main engine error type
#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
    pub source: Option<String>,
}

impl EngineError {
    /// Create new error with context
    pub fn new(kind: ErrorKind, message: impl Into<String>, context: ErrorContext) -> Self {
        let message = message.into();

        match kind {
            ErrorKind::Configuration => {
                error!(
                    error_id = %context.error_id,
                    service = %context.service,
                    operation = %context.operation,
                    "Configuration error: {}", message
                );
            }
            ErrorKind::Infrastructure => {
                warn!(
                    error_id = %context.error_id,
                    service = %context.service,
                    operation = %context.operation,
                    "Infrastructure error: {}", message
                );
            }
            _ => {
                debug!(
                    error_id = %context.error_id,
                    service = %context.service,
                    operation = %context.operation,
                    kind = kind.code(),
                    "Business error: {}", message
                );
            }
        }

        Self {
            kind,
            message,
            context,
            source: None,
        }
    }

    /// Add source error
    pub fn with_source(mut self, source: impl StdError) -> Self {
        let mut chain = vec![source.to_string()];
        let mut current = source.source();
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        self.source = Some(chain.join(": "));
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context.metadata.insert(key.to_string(), value);
        self
    }

    pub fn validation(field: &str, message: impl Into<String>, context: ErrorContext) -> Self {
        Self::new(ErrorKind::Validation, message, context)
            .with_metadata("field", serde_json::json!(field))
    }

    pub fn state_conflict(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::new(ErrorKind::StateConflict, message, context)
    }

    pub fn unauthorized(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::new(ErrorKind::Authorization, message, context)
    }

    pub fn not_found(resource: &str, id: impl fmt::Display, context: ErrorContext) -> Self {
        let id = id.to_string();
        Self::new(
            ErrorKind::NotFound,
            format!("{} with id {} not found", resource, id),
            context,
        )
        .with_metadata("resource", serde_json::json!(resource))
        .with_metadata("id", serde_json::json!(id))
    }

    pub fn duplicate(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::new(ErrorKind::Duplicate, message, context)
    }

    pub fn insufficient_funds(required: u64, available: u64, context: ErrorContext) -> Self {
        Self::new(
            ErrorKind::InsufficientFunds,
            format!("required {}, available {}", required, available),
            context,
        )
        .with_metadata("required", serde_json::json!(required))
        .with_metadata("available", serde_json::json!(available))
    }

    pub fn infrastructure(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::new(ErrorKind::Infrastructure, message, context)
    }

    /// Field name recorded by [`EngineError::validation`].
    pub fn field(&self) -> Option<&str> {
        self.context.metadata.get("field").and_then(|v| v.as_str())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.user_message(), self.message)
    }
}

impl StdError for EngineError {}

/// Result type alias for the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Extension trait for converting external errors
pub trait ErrorExt<T> {
    fn engine_err(self, kind: ErrorKind, context: ErrorContext) -> EngineResult<T>;
}

impl<T, E: StdError + 'static> ErrorExt<T> for Result<T, E> {
    fn engine_err(self, kind: ErrorKind, context: ErrorContext) -> EngineResult<T> {
        self.map_err(|e| EngineError::new(kind, e.to_string(), context).with_source(e))
    }
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(err: tokio_postgres::Error) -> Self {
        let context = ErrorContext::new("database", "query");

        // unique_violation surfaces as a duplicate, everything else as infrastructure
        let kind = match err.code() {
            Some(code) if *code == tokio_postgres::error::SqlState::UNIQUE_VIOLATION => ErrorKind::Duplicate,
            _ => ErrorKind::Infrastructure,
        };

        EngineError::new(kind, err.to_string(), context).with_source(err)
    }
}

impl From<deadpool_postgres::PoolError> for EngineError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        let context = ErrorContext::new("database", "pool");
        EngineError::new(ErrorKind::Infrastructure, err.to_string(), context).with_source(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        let context = ErrorContext::new("serialization", "json");
        EngineError::new(ErrorKind::Infrastructure, err.to_string(), context).with_source(err)
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let context = ErrorContext::new("validation", "payload");
        let mut fields: Vec<&str> = errors.field_errors().keys().copied().collect();
        fields.sort_unstable();
        let field = fields.first().copied().unwrap_or("payload");
        EngineError::validation(field, errors.to_string(), context)
    }
}

/// Macro for creating errors with context
#[macro_export]
macro_rules! engine_error {
    ($kind:expr, $msg:expr) => {
        $crate::error::EngineError::new(
            $kind,
            $msg,
            $crate::error::ErrorContext::new(module_path!(), "operation"),
        )
    };
    ($kind:expr, $msg:expr, $ctx:expr) => {
        $crate::error::EngineError::new($kind, $msg, $ctx)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let context = ErrorContext::new("lifecycle", "join_bet")
            .with_user("user123")
            .with_bet("bet456");

        let error = EngineError::new(ErrorKind::StateConflict, "bet is closed", context);

        assert_eq!(error.kind, ErrorKind::StateConflict);
        assert_eq!(error.message, "bet is closed");
        assert_eq!(error.context.user_id.as_deref(), Some("user123"));
        assert_eq!(error.context.bet_id.as_deref(), Some("bet456"));
    }

    #[test]
    fn test_validation_field() {
        let error = EngineError::validation(
            "options",
            "BINARY bets need exactly 2 options",
            ErrorContext::new("validation", "create_bet"),
        );
        assert_eq!(error.field(), Some("options"));
        assert!(error.to_string().contains("exactly 2 options"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ErrorKind::Infrastructure.is_retryable());
        assert!(!ErrorKind::StateConflict.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(ErrorKind::Duplicate.is_business());
        assert!(!ErrorKind::Infrastructure.is_business());
    }

    #[test]
    fn test_macro_uses_module_path() {
        let err = engine_error!(ErrorKind::NotFound, "missing");
        assert!(err.context.service.contains("error"));
    }
}
