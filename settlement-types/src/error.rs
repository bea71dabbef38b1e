//! Error types for the settlement service.

use crate::domain::Currency;
use crate::ports::ProviderError;

/// Domain-level errors (business logic violations).
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Amount cannot be negative")]
    NegativeAmount,

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("Currency mismatch: expected {expected}, got {got}")]
    CurrencyMismatch { expected: Currency, got: Currency },

    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("Unknown payment provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Repository-level errors (data access failures).
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Entity not found")]
    NotFound,

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Application-level errors returned by the settlement operations.
///
/// One variant per caller-visible failure class; the HTTP adapter maps
/// each to a status code.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Payment provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Escrow not found for booking {0}")]
    EscrowNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the same request may be retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ProviderUnavailable(_))
    }
}

impl From<DomainError> for AppError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InsufficientFunds {
                available,
                requested,
            } => AppError::InsufficientBalance {
                available,
                requested,
            },
            DomainError::InvalidState(msg) => AppError::InvalidState(msg),
            e => AppError::InvalidRequest(e.to_string()),
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Domain(e) => e.into(),
            RepoError::NotFound => AppError::TransactionNotFound("Resource not found".into()),
            RepoError::Database(e) => AppError::Internal(e),
            RepoError::Transaction(e) => AppError::Internal(e),
            RepoError::Conflict(e) => AppError::InvalidState(e),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => AppError::ProviderUnavailable(msg),
            ProviderError::InvalidResponse(msg) => AppError::ProviderUnavailable(msg),
            ProviderError::Rejected(msg) => AppError::ProviderRejected(msg),
            e @ ProviderError::Unsupported { .. } => AppError::InvalidRequest(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_maps_to_insufficient_balance() {
        let err: AppError = RepoError::Domain(DomainError::InsufficientFunds {
            available: 15000,
            requested: 20000,
        })
        .into();
        assert!(matches!(
            err,
            AppError::InsufficientBalance {
                available: 15000,
                requested: 20000
            }
        ));
    }

    #[test]
    fn test_provider_errors_split_retryable_from_terminal() {
        let unavailable: AppError = ProviderError::Unavailable("timeout".into()).into();
        let rejected: AppError = ProviderError::Rejected("Invalid email".into()).into();

        assert!(unavailable.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(matches!(rejected, AppError::ProviderRejected(_)));
    }

    #[test]
    fn test_conflict_is_invalid_state() {
        let err: AppError = RepoError::Conflict("escrow exists".into()).into();
        assert!(matches!(err, AppError::InvalidState(_)));
    }
}
