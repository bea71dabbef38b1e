//! # Settlement Types
//!
//! Domain types and port traits for the marketplace settlement service.
//! This crate has ZERO external IO dependencies - only data structures,
//! business rules, and trait definitions.
//!
//! ## Architecture
//!
//! This crate represents the **innermost core** of the hexagonal architecture:
//! - `domain/` - Pure domain types (Money, Wallet, Transaction, EscrowAccount)
//! - `ports/` - Trait definitions that adapters must implement
//! - `dto/` - Request and response shapes at the service boundary
//! - `error/` - Domain, repository, provider and application error types

pub mod domain;
pub mod dto;
pub mod error;
pub mod ports;

// Re-export commonly used types
pub use domain::{
    BookingId, Currency, DEFAULT_RELEASE_CONDITION, EscrowAccount, EscrowId, EscrowStatus,
    Metadata, Money, ProviderEvent, ProviderKind, Transaction, TransactionId, TransactionKind,
    TransactionStatus, UserId, Wallet, WalletId, platform_fee,
};
pub use dto::*;
pub use error::{AppError, DomainError, RepoError};
pub use ports::{
    ChargeRequest, ChargeSession, EscrowStore, LedgerEntry, LedgerStore, PaymentGateway,
    ProviderError, ProviderOutcome, ProviderStatus, TransferInstruction, TransferReceipt,
    TransferStatus,
};
