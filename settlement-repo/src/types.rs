//! Shared database types with feature-gated fields for SQLite and PostgreSQL.

use std::fmt::Display;
use std::str::FromStr;

use sqlx::FromRow;

use settlement_types::{
    BookingId, Currency, EscrowAccount, EscrowId, Metadata, Money, RepoError, Transaction,
    TransactionId, UserId, Wallet, WalletId,
};

// ─────────────────────────────────────────────────────────────────────────────
// Feature-gated imports
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(not(feature = "sqlite"))]
use chrono::{DateTime, Utc};
#[cfg(not(feature = "sqlite"))]
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Column lists
// ─────────────────────────────────────────────────────────────────────────────

pub const TRANSACTION_COLUMNS: &str = "id, reference, user_id, vendor_id, booking_id, kind, \
     status, provider, amount, currency, fee, net_amount, description, metadata, provider_ref, \
     provider_data, paid_at, created_at, updated_at";

pub const WALLET_COLUMNS: &str =
    "id, user_id, currency, balance, pending_balance, is_active, created_at, updated_at";

pub const ESCROW_COLUMNS: &str = "id, transaction_id, booking_id, customer_id, vendor_id, \
     amount, currency, status, release_condition, dispute_id, expires_at, released_at, created_at";

// ─────────────────────────────────────────────────────────────────────────────
// Database row structs (derive FromRow for automatic mapping)
// ─────────────────────────────────────────────────────────────────────────────

/// Wallet row from database.
#[derive(FromRow)]
pub struct DbWallet {
    #[cfg(not(feature = "sqlite"))]
    pub id: Uuid,
    #[cfg(feature = "sqlite")]
    pub id: String,

    #[cfg(not(feature = "sqlite"))]
    pub user_id: Uuid,
    #[cfg(feature = "sqlite")]
    pub user_id: String,

    pub currency: String,
    pub balance: i64,
    pub pending_balance: i64,

    #[cfg(not(feature = "sqlite"))]
    pub is_active: bool,
    #[cfg(feature = "sqlite")]
    pub is_active: i64,

    #[cfg(not(feature = "sqlite"))]
    pub created_at: DateTime<Utc>,
    #[cfg(feature = "sqlite")]
    pub created_at: String,

    #[cfg(not(feature = "sqlite"))]
    pub updated_at: DateTime<Utc>,
    #[cfg(feature = "sqlite")]
    pub updated_at: String,
}

/// Transaction row from database.
#[derive(FromRow)]
pub struct DbTransaction {
    #[cfg(not(feature = "sqlite"))]
    pub id: Uuid,
    #[cfg(feature = "sqlite")]
    pub id: String,

    pub reference: String,

    #[cfg(not(feature = "sqlite"))]
    pub user_id: Uuid,
    #[cfg(feature = "sqlite")]
    pub user_id: String,

    #[cfg(not(feature = "sqlite"))]
    pub vendor_id: Option<Uuid>,
    #[cfg(feature = "sqlite")]
    pub vendor_id: Option<String>,

    #[cfg(not(feature = "sqlite"))]
    pub booking_id: Option<Uuid>,
    #[cfg(feature = "sqlite")]
    pub booking_id: Option<String>,

    pub kind: String,
    pub status: String,
    pub provider: String,
    pub amount: i64,
    pub currency: String,
    pub fee: i64,
    pub net_amount: i64,
    pub description: String,

    #[cfg(not(feature = "sqlite"))]
    pub metadata: serde_json::Value,
    #[cfg(feature = "sqlite")]
    pub metadata: String,

    pub provider_ref: Option<String>,

    #[cfg(not(feature = "sqlite"))]
    pub provider_data: serde_json::Value,
    #[cfg(feature = "sqlite")]
    pub provider_data: String,

    #[cfg(not(feature = "sqlite"))]
    pub paid_at: Option<DateTime<Utc>>,
    #[cfg(feature = "sqlite")]
    pub paid_at: Option<String>,

    #[cfg(not(feature = "sqlite"))]
    pub created_at: DateTime<Utc>,
    #[cfg(feature = "sqlite")]
    pub created_at: String,

    #[cfg(not(feature = "sqlite"))]
    pub updated_at: DateTime<Utc>,
    #[cfg(feature = "sqlite")]
    pub updated_at: String,
}

/// Escrow account row from database.
#[derive(FromRow)]
pub struct DbEscrow {
    #[cfg(not(feature = "sqlite"))]
    pub id: Uuid,
    #[cfg(feature = "sqlite")]
    pub id: String,

    #[cfg(not(feature = "sqlite"))]
    pub transaction_id: Uuid,
    #[cfg(feature = "sqlite")]
    pub transaction_id: String,

    #[cfg(not(feature = "sqlite"))]
    pub booking_id: Uuid,
    #[cfg(feature = "sqlite")]
    pub booking_id: String,

    #[cfg(not(feature = "sqlite"))]
    pub customer_id: Uuid,
    #[cfg(feature = "sqlite")]
    pub customer_id: String,

    #[cfg(not(feature = "sqlite"))]
    pub vendor_id: Uuid,
    #[cfg(feature = "sqlite")]
    pub vendor_id: String,

    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub release_condition: String,
    pub dispute_id: Option<String>,

    #[cfg(not(feature = "sqlite"))]
    pub expires_at: DateTime<Utc>,
    #[cfg(feature = "sqlite")]
    pub expires_at: String,

    #[cfg(not(feature = "sqlite"))]
    pub released_at: Option<DateTime<Utc>>,
    #[cfg(feature = "sqlite")]
    pub released_at: Option<String>,

    #[cfg(not(feature = "sqlite"))]
    pub created_at: DateTime<Utc>,
    #[cfg(feature = "sqlite")]
    pub created_at: String,
}

/// Balance-only row for queries.
#[cfg(feature = "sqlite")]
#[derive(FromRow)]
pub struct DbBalance {
    pub balance: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Parses a stored enum or code column.
pub fn parse_column<T>(s: &str) -> Result<T, RepoError>
where
    T: FromStr,
    T::Err: Display,
{
    s.parse::<T>()
        .map_err(|e| RepoError::Database(format!("corrupt column value {:?}: {}", s, e)))
}

pub fn db_err(e: sqlx::Error) -> RepoError {
    RepoError::Database(e.to_string())
}

/// Maps a failed write, reporting unique-key violations as conflicts.
pub fn write_err(e: sqlx::Error) -> RepoError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => RepoError::Conflict(db.message().to_string()),
        _ => RepoError::Database(e.to_string()),
    }
}

fn object_or_empty(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

#[cfg(feature = "sqlite")]
mod text {
    use chrono::{DateTime, SecondsFormat, Utc};
    use settlement_types::{Metadata, RepoError};

    /// Fixed-width RFC 3339 so text ordering matches time ordering.
    pub fn ts(dt: DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn uuid(s: &str) -> Result<uuid::Uuid, RepoError> {
        uuid::Uuid::parse_str(s).map_err(|e| RepoError::Database(e.to_string()))
    }

    pub fn time(s: &str) -> Result<DateTime<Utc>, RepoError> {
        Ok(DateTime::parse_from_rfc3339(s)
            .map_err(|e| RepoError::Database(e.to_string()))?
            .with_timezone(&Utc))
    }

    pub fn opt_time(s: Option<String>) -> Result<Option<DateTime<Utc>>, RepoError> {
        s.as_deref().map(time).transpose()
    }

    pub fn json(s: &str) -> Result<Metadata, RepoError> {
        let value: serde_json::Value =
            serde_json::from_str(s).map_err(|e| RepoError::Database(e.to_string()))?;
        Ok(super::object_or_empty(value))
    }

    pub fn json_text(map: &Metadata) -> String {
        serde_json::Value::Object(map.clone()).to_string()
    }
}

#[cfg(feature = "sqlite")]
pub use text::{json_text, ts};

// ─────────────────────────────────────────────────────────────────────────────
// Domain conversion (feature-gated implementations)
// ─────────────────────────────────────────────────────────────────────────────

impl DbWallet {
    /// Convert database row to domain Wallet.
    pub fn into_domain(self) -> Result<Wallet, RepoError> {
        let currency: Currency = parse_column(&self.currency)?;
        let balance = Money::new(self.balance, currency).map_err(RepoError::Domain)?;
        let pending_balance =
            Money::new(self.pending_balance, currency).map_err(RepoError::Domain)?;

        #[cfg(not(feature = "sqlite"))]
        let (id, user_id, is_active, created_at, updated_at) = (
            WalletId::from_uuid(self.id),
            UserId::from_uuid(self.user_id),
            self.is_active,
            self.created_at,
            self.updated_at,
        );

        #[cfg(feature = "sqlite")]
        let (id, user_id, is_active, created_at, updated_at) = (
            WalletId::from_uuid(text::uuid(&self.id)?),
            UserId::from_uuid(text::uuid(&self.user_id)?),
            self.is_active != 0,
            text::time(&self.created_at)?,
            text::time(&self.updated_at)?,
        );

        Ok(Wallet {
            id,
            user_id,
            balance,
            pending_balance,
            is_active,
            created_at,
            updated_at,
        })
    }
}

impl DbTransaction {
    /// Convert database row to domain Transaction.
    pub fn into_domain(self) -> Result<Transaction, RepoError> {
        let kind = parse_column(&self.kind)?;
        let status = parse_column(&self.status)?;
        let provider = parse_column(&self.provider)?;
        let currency = parse_column(&self.currency)?;

        #[cfg(not(feature = "sqlite"))]
        let (id, user_id, vendor_id, booking_id, metadata, provider_data) = (
            TransactionId::from_uuid(self.id),
            UserId::from_uuid(self.user_id),
            self.vendor_id.map(UserId::from_uuid),
            self.booking_id.map(BookingId::from_uuid),
            object_or_empty(self.metadata),
            object_or_empty(self.provider_data),
        );

        #[cfg(not(feature = "sqlite"))]
        let (paid_at, created_at, updated_at) = (self.paid_at, self.created_at, self.updated_at);

        #[cfg(feature = "sqlite")]
        let (id, user_id, vendor_id, booking_id, metadata, provider_data) = (
            TransactionId::from_uuid(text::uuid(&self.id)?),
            UserId::from_uuid(text::uuid(&self.user_id)?),
            self.vendor_id
                .as_deref()
                .map(text::uuid)
                .transpose()?
                .map(UserId::from_uuid),
            self.booking_id
                .as_deref()
                .map(text::uuid)
                .transpose()?
                .map(BookingId::from_uuid),
            text::json(&self.metadata)?,
            text::json(&self.provider_data)?,
        );

        #[cfg(feature = "sqlite")]
        let (paid_at, created_at, updated_at) = (
            text::opt_time(self.paid_at)?,
            text::time(&self.created_at)?,
            text::time(&self.updated_at)?,
        );

        Ok(Transaction {
            id,
            reference: self.reference,
            user_id,
            vendor_id,
            booking_id,
            kind,
            status,
            provider,
            amount: self.amount,
            currency,
            fee: self.fee,
            net_amount: self.net_amount,
            description: self.description,
            metadata,
            provider_ref: self.provider_ref,
            provider_data,
            paid_at,
            created_at,
            updated_at,
        })
    }
}

impl DbEscrow {
    /// Convert database row to domain EscrowAccount.
    pub fn into_domain(self) -> Result<EscrowAccount, RepoError> {
        let currency = parse_column(&self.currency)?;
        let status = parse_column(&self.status)?;

        #[cfg(not(feature = "sqlite"))]
        let (id, transaction_id, booking_id, customer_id, vendor_id) = (
            EscrowId::from_uuid(self.id),
            TransactionId::from_uuid(self.transaction_id),
            BookingId::from_uuid(self.booking_id),
            UserId::from_uuid(self.customer_id),
            UserId::from_uuid(self.vendor_id),
        );

        #[cfg(not(feature = "sqlite"))]
        let (expires_at, released_at, created_at) =
            (self.expires_at, self.released_at, self.created_at);

        #[cfg(feature = "sqlite")]
        let (id, transaction_id, booking_id, customer_id, vendor_id) = (
            EscrowId::from_uuid(text::uuid(&self.id)?),
            TransactionId::from_uuid(text::uuid(&self.transaction_id)?),
            BookingId::from_uuid(text::uuid(&self.booking_id)?),
            UserId::from_uuid(text::uuid(&self.customer_id)?),
            UserId::from_uuid(text::uuid(&self.vendor_id)?),
        );

        #[cfg(feature = "sqlite")]
        let (expires_at, released_at, created_at) = (
            text::time(&self.expires_at)?,
            text::opt_time(self.released_at)?,
            text::time(&self.created_at)?,
        );

        Ok(EscrowAccount {
            id,
            transaction_id,
            booking_id,
            customer_id,
            vendor_id,
            amount: self.amount,
            currency,
            status,
            release_condition: self.release_condition,
            dispute_id: self.dispute_id,
            expires_at,
            released_at,
            created_at,
        })
    }
}
