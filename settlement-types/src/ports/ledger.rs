//! Ledger Store port.
//!
//! The single source of truth for wallet balances and transaction records.
//! Adapters (Postgres, SQLite, in-memory) implement this trait.

use crate::domain::{
    Currency, Money, Transaction, TransactionId, TransactionKind, UserId, Wallet,
};
use crate::error::RepoError;

/// Result of a reference-keyed credit.
#[derive(Debug, Clone)]
pub enum LedgerEntry {
    /// The record was new; the wallet after the credit.
    Applied(Wallet),
    /// A record with this reference already existed; nothing was credited.
    AlreadyApplied(Transaction),
}

/// Wallet and transaction storage.
///
/// All operations that modify balances MUST be atomic. The sufficiency
/// check of a debit and the decrement are one unit, and concurrent
/// mutations of the same wallet never interleave into a lost update.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    // ─────────────────────────────────────────────────────────────────────────────
    // Wallets
    // ─────────────────────────────────────────────────────────────────────────────

    /// Returns the user's wallet for `currency`, creating an empty one on
    /// first access. Concurrent first accesses yield exactly one wallet.
    async fn get_or_create_wallet(
        &self,
        user_id: UserId,
        currency: Currency,
    ) -> Result<Wallet, RepoError>;

    /// Adds a positive amount to the available balance.
    async fn credit(&self, user_id: UserId, amount: Money) -> Result<Wallet, RepoError>;

    /// Removes a positive amount, failing with `InsufficientFunds` instead of
    /// going below zero.
    async fn debit(&self, user_id: UserId, amount: Money) -> Result<Wallet, RepoError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Balance mutations paired with their record (MUST be atomic)
    // ─────────────────────────────────────────────────────────────────────────────

    /// Inserts `record` and credits `record.user_id` with its amount in one
    /// unit, unless a transaction with the same reference exists, in which
    /// case nothing changes.
    async fn credit_with_record(&self, record: &Transaction) -> Result<LedgerEntry, RepoError>;

    /// Inserts `record` and debits `record.user_id` with its amount in one
    /// unit. A duplicate reference is a `Conflict`.
    async fn debit_with_record(&self, record: &Transaction) -> Result<Wallet, RepoError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Transaction records
    // ─────────────────────────────────────────────────────────────────────────────

    /// Inserts a new transaction, or applies the mutable fields (status,
    /// provider reference/data, paid-at, updated-at) of an existing one.
    ///
    /// Amount, currency and fee are never overwritten. A status change that
    /// is not a legal forward move leaves the stored row untouched. Returns
    /// the stored transaction.
    async fn record_transaction(&self, txn: &Transaction) -> Result<Transaction, RepoError>;

    async fn find_transaction(&self, id: TransactionId)
    -> Result<Option<Transaction>, RepoError>;

    async fn find_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, RepoError>;

    /// Lists a user's transactions, newest first.
    async fn list_transactions_for_user(
        &self,
        user_id: UserId,
        kind: Option<TransactionKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>, RepoError>;
}
