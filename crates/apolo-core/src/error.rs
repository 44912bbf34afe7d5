//! Unified error handling for the rating engine
//!
//! This module provides a single error type covering catalog lookups,
//! request validation, rating, debiting, storage and outbound notification
//! failures. Every variant maps to a stable error code.

use thiserror::Error;

/// Main application error type
///
/// All errors in the engine should be converted to this type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    // ==================== Lookup Errors ====================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    // ==================== Request Errors ====================
    #[error("Mandatory field missing: {0}")]
    MandatoryMissing(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ==================== Rating Errors ====================
    #[error("Unauthorized destination: {0}")]
    UnauthorizedDestination(String),

    #[error("Rating plan invalid: {0}")]
    RatingPlanInvalid(String),

    // ==================== Debit Errors ====================
    #[error("Insufficient credit: {0}")]
    InsufficientCredit(String),

    #[error("Account disabled: {0}")]
    AccountDisabled(String),

    #[error("Lock timeout on keys: {0}")]
    LockTimeout(String),

    // ==================== Action Errors ====================
    #[error("Unknown action kind: {0}")]
    UnknownActionKind(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    // ==================== Parser Errors ====================
    #[error("Parser error: {0}")]
    Parser(String),

    // ==================== Storage Errors ====================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage connection failed: {0}")]
    StorageConnection(String),

    // ==================== External Service Errors ====================
    #[error("HTTP notification failed: {0}")]
    Http(String),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("RPC call failed: {0}")]
    Rpc(String),

    // ==================== Internal Errors ====================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    /// Returns the error code for API responses and logs
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::AccountNotFound(_) => "account_not_found",
            AppError::MandatoryMissing(_) => "mandatory_missing",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::UnauthorizedDestination(_) => "unauthorized_destination",
            AppError::RatingPlanInvalid(_) => "rating_plan_invalid",
            AppError::InsufficientCredit(_) => "insufficient_credit",
            AppError::AccountDisabled(_) => "account_disabled",
            AppError::LockTimeout(_) => "lock_timeout",
            AppError::UnknownActionKind(_) => "unknown_action_kind",
            AppError::ActionFailed(_) => "action_failed",
            AppError::Parser(_) => "parser_error",
            AppError::Storage(_) => "storage_error",
            AppError::StorageConnection(_) => "storage_connection_error",
            AppError::Http(_) => "http_error",
            AppError::Mail(_) => "mail_error",
            AppError::Rpc(_) => "rpc_error",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
        }
    }

    /// True for lookups that missed (catalog entity or account)
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_) | AppError::AccountNotFound(_))
    }

    /// True for storage and outbound I/O failures
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            AppError::Storage(_)
                | AppError::StorageConnection(_)
                | AppError::Http(_)
                | AppError::Mail(_)
                | AppError::Rpc(_)
        )
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<regex::Error> for AppError {
    fn from(err: regex::Error) -> Self {
        AppError::Parser(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AppError::InsufficientCredit("acc".to_string()).error_code(),
            "insufficient_credit"
        );
        assert_eq!(
            AppError::UnauthorizedDestination("0723".to_string()).error_code(),
            "unauthorized_destination"
        );
        assert_eq!(
            AppError::Parser("bad json".to_string()).error_code(),
            "parser_error"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(AppError::NotFound("x".to_string()).is_not_found());
        assert!(AppError::AccountNotFound("t:a".to_string()).is_not_found());
        assert!(!AppError::Internal("x".to_string()).is_not_found());
        assert!(AppError::Http("timeout".to_string()).is_io());
        assert!(!AppError::Parser("x".to_string()).is_io());
    }

    #[test]
    fn test_from_serde_error() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.error_code(), "serialization_error");
    }
}
