//! Port traits (interfaces for adapters).
//!
//! These are the contracts that adapters must implement.
//! The application layer depends on these traits, not concrete implementations.

mod escrow;
mod gateway;
mod ledger;

pub use escrow::EscrowStore;
pub use gateway::{
    ChargeRequest, ChargeSession, PaymentGateway, ProviderError, ProviderOutcome, ProviderStatus,
    TransferInstruction, TransferReceipt, TransferStatus,
};
pub use ledger::{LedgerEntry, LedgerStore};
