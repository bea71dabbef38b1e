//! SQLite repository adapter.
#![allow(clippy::collapsible_if)]

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction as DbTx};

use settlement_types::{
    BookingId, Currency, DomainError, EscrowAccount, EscrowStatus, EscrowStore, LedgerEntry,
    LedgerStore, Money, RepoError, Transaction, TransactionId, TransactionKind, UserId, Wallet,
    WalletId,
};

use crate::types::{
    DbBalance, DbEscrow, DbTransaction, DbWallet, ESCROW_COLUMNS, TRANSACTION_COLUMNS,
    WALLET_COLUMNS, db_err, json_text, ts, write_err,
};

// ─────────────────────────────────────────────────────────────────────────────
// SQLite Repository
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite repository implementation.
///
/// Every balance mutation runs in a transaction whose first statement is a
/// write, so SQLite takes the write lock before any balance is read.
pub struct SqliteRepo {
    pool: SqlitePool,
}

impl SqliteRepo {
    /// Creates a new SQLite repository with automatic migration.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let in_memory = database_url.contains(":memory:");

        // Ensure on-disk SQLite target directory exists (no-op for in-memory).
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            // Remove query parameters
            let path = path.split('?').next().unwrap_or(path);
            if !in_memory {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
            }
        }

        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database: keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = pool_options.connect_with(options).await?;

        let repo = Self { pool };
        repo.create_schema().await?;
        Ok(repo)
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the database schema (idempotent).
    pub async fn create_schema(&self) -> Result<(), RepoError> {
        let ddl = include_str!("../migrations/0001_create_ledger.sql");
        sqlx::query(ddl).execute(&self.pool).await.map_err(db_err)?;

        let ddl_escrow = include_str!("../migrations/0002_create_escrow_accounts.sql");
        sqlx::query(ddl_escrow)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn begin(&self) -> Result<DbTx<'static, Sqlite>, RepoError> {
        self.pool
            .begin()
            .await
            .map_err(|e| RepoError::Transaction(e.to_string()))
    }
}

async fn commit(db_tx: DbTx<'static, Sqlite>) -> Result<(), RepoError> {
    db_tx
        .commit()
        .await
        .map_err(|e| RepoError::Transaction(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Statements shared by the ledger operations
// ─────────────────────────────────────────────────────────────────────────────

async fn ensure_wallet(
    db_tx: &mut DbTx<'static, Sqlite>,
    user_id: UserId,
    currency: Currency,
) -> Result<(), RepoError> {
    let now = ts(Utc::now());
    sqlx::query(
        r#"INSERT INTO wallets (id, user_id, currency, balance, pending_balance, is_active, created_at, updated_at)
           VALUES (?, ?, ?, 0, 0, 1, ?, ?)
           ON CONFLICT (user_id, currency) DO NOTHING"#,
    )
    .bind(WalletId::new().to_string())
    .bind(user_id.to_string())
    .bind(currency.code())
    .bind(&now)
    .bind(&now)
    .execute(&mut **db_tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn fetch_wallet(
    db_tx: &mut DbTx<'static, Sqlite>,
    user_id: UserId,
    currency: Currency,
) -> Result<Wallet, RepoError> {
    let sql = format!(
        "SELECT {} FROM wallets WHERE user_id = ? AND currency = ?",
        WALLET_COLUMNS
    );
    let row: DbWallet = sqlx::query_as(&sql)
        .bind(user_id.to_string())
        .bind(currency.code())
        .fetch_one(&mut **db_tx)
        .await
        .map_err(db_err)?;
    row.into_domain()
}

async fn add_to_balance(
    db_tx: &mut DbTx<'static, Sqlite>,
    user_id: UserId,
    amount: Money,
) -> Result<(), RepoError> {
    sqlx::query(
        r#"UPDATE wallets SET balance = balance + ?, updated_at = ? WHERE user_id = ? AND currency = ?"#,
    )
    .bind(amount.amount())
    .bind(ts(Utc::now()))
    .bind(user_id.to_string())
    .bind(amount.currency().code())
    .execute(&mut **db_tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Conditional decrement: succeeds only when the balance covers `amount`.
async fn subtract_from_balance(
    db_tx: &mut DbTx<'static, Sqlite>,
    user_id: UserId,
    amount: Money,
) -> Result<(), RepoError> {
    let result = sqlx::query(
        r#"UPDATE wallets SET balance = balance - ?, updated_at = ?
           WHERE user_id = ? AND currency = ? AND balance >= ?"#,
    )
    .bind(amount.amount())
    .bind(ts(Utc::now()))
    .bind(user_id.to_string())
    .bind(amount.currency().code())
    .bind(amount.amount())
    .execute(&mut **db_tx)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        let row: DbBalance =
            sqlx::query_as(r#"SELECT balance FROM wallets WHERE user_id = ? AND currency = ?"#)
                .bind(user_id.to_string())
                .bind(amount.currency().code())
                .fetch_one(&mut **db_tx)
                .await
                .map_err(db_err)?;
        return Err(RepoError::Domain(DomainError::InsufficientFunds {
            available: row.balance,
            requested: amount.amount(),
        }));
    }
    Ok(())
}

/// Inserts `txn`. Returns false when the reference (or id) already exists and
/// `skip_duplicates` is set; otherwise a duplicate is a `Conflict`.
async fn insert_transaction(
    db_tx: &mut DbTx<'static, Sqlite>,
    txn: &Transaction,
    skip_duplicates: bool,
) -> Result<bool, RepoError> {
    let conflict = if skip_duplicates {
        "ON CONFLICT DO NOTHING"
    } else {
        ""
    };
    let sql = format!(
        r#"INSERT INTO transactions ({})
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) {}"#,
        TRANSACTION_COLUMNS, conflict
    );
    let result = sqlx::query(&sql)
        .bind(txn.id.to_string())
        .bind(&txn.reference)
        .bind(txn.user_id.to_string())
        .bind(txn.vendor_id.map(|v| v.to_string()))
        .bind(txn.booking_id.map(|b| b.to_string()))
        .bind(txn.kind.as_str())
        .bind(txn.status.as_str())
        .bind(txn.provider.as_str())
        .bind(txn.amount)
        .bind(txn.currency.code())
        .bind(txn.fee)
        .bind(txn.net_amount)
        .bind(&txn.description)
        .bind(json_text(&txn.metadata))
        .bind(&txn.provider_ref)
        .bind(json_text(&txn.provider_data))
        .bind(txn.paid_at.map(ts))
        .bind(ts(txn.created_at))
        .bind(ts(txn.updated_at))
        .execute(&mut **db_tx)
        .await
        .map_err(write_err)?;
    Ok(result.rows_affected() == 1)
}

async fn select_transaction(
    executor: impl sqlx::SqliteExecutor<'_>,
    column: &str,
    value: String,
) -> Result<Option<Transaction>, RepoError> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE {} = ?",
        TRANSACTION_COLUMNS, column
    );
    let row: Option<DbTransaction> = sqlx::query_as(&sql)
        .bind(value)
        .fetch_optional(executor)
        .await
        .map_err(db_err)?;
    row.map(DbTransaction::into_domain).transpose()
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for SqliteRepo {
    async fn get_or_create_wallet(
        &self,
        user_id: UserId,
        currency: Currency,
    ) -> Result<Wallet, RepoError> {
        let mut db_tx = self.begin().await?;
        ensure_wallet(&mut db_tx, user_id, currency).await?;
        let wallet = fetch_wallet(&mut db_tx, user_id, currency).await?;
        commit(db_tx).await?;
        Ok(wallet)
    }

    async fn credit(&self, user_id: UserId, amount: Money) -> Result<Wallet, RepoError> {
        if amount.amount() <= 0 {
            return Err(RepoError::Domain(DomainError::InvalidAmount(
                amount.amount(),
            )));
        }

        let mut db_tx = self.begin().await?;
        ensure_wallet(&mut db_tx, user_id, amount.currency()).await?;
        add_to_balance(&mut db_tx, user_id, amount).await?;
        let wallet = fetch_wallet(&mut db_tx, user_id, amount.currency()).await?;
        commit(db_tx).await?;
        Ok(wallet)
    }

    async fn debit(&self, user_id: UserId, amount: Money) -> Result<Wallet, RepoError> {
        if amount.amount() <= 0 {
            return Err(RepoError::Domain(DomainError::InvalidAmount(
                amount.amount(),
            )));
        }

        let mut db_tx = self.begin().await?;
        ensure_wallet(&mut db_tx, user_id, amount.currency()).await?;
        subtract_from_balance(&mut db_tx, user_id, amount).await?;
        let wallet = fetch_wallet(&mut db_tx, user_id, amount.currency()).await?;
        commit(db_tx).await?;
        Ok(wallet)
    }

    async fn credit_with_record(&self, record: &Transaction) -> Result<LedgerEntry, RepoError> {
        let mut db_tx = self.begin().await?;

        if !insert_transaction(&mut db_tx, record, true).await? {
            let existing =
                select_transaction(&mut *db_tx, "reference", record.reference.clone())
                    .await?
                    .ok_or_else(|| {
                        RepoError::Conflict(format!(
                            "transaction id {} already used by another reference",
                            record.id
                        ))
                    })?;
            return Ok(LedgerEntry::AlreadyApplied(existing));
        }

        ensure_wallet(&mut db_tx, record.user_id, record.currency).await?;
        add_to_balance(&mut db_tx, record.user_id, record.money()).await?;
        let wallet = fetch_wallet(&mut db_tx, record.user_id, record.currency).await?;
        commit(db_tx).await?;
        Ok(LedgerEntry::Applied(wallet))
    }

    async fn debit_with_record(&self, record: &Transaction) -> Result<Wallet, RepoError> {
        let mut db_tx = self.begin().await?;
        ensure_wallet(&mut db_tx, record.user_id, record.currency).await?;
        subtract_from_balance(&mut db_tx, record.user_id, record.money()).await?;
        insert_transaction(&mut db_tx, record, false).await?;
        let wallet = fetch_wallet(&mut db_tx, record.user_id, record.currency).await?;
        commit(db_tx).await?;
        Ok(wallet)
    }

    async fn record_transaction(&self, txn: &Transaction) -> Result<Transaction, RepoError> {
        let mut db_tx = self.begin().await?;

        if insert_transaction(&mut db_tx, txn, true).await? {
            commit(db_tx).await?;
            return Ok(txn.clone());
        }

        let mut stored = select_transaction(&mut *db_tx, "id", txn.id.to_string())
            .await?
            .ok_or_else(|| {
                RepoError::Conflict(format!("reference {} already exists", txn.reference))
            })?;

        if stored.absorb(txn) {
            sqlx::query(
                r#"UPDATE transactions
                   SET status = ?, provider_ref = ?, provider_data = ?, paid_at = ?, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(stored.status.as_str())
            .bind(&stored.provider_ref)
            .bind(json_text(&stored.provider_data))
            .bind(stored.paid_at.map(ts))
            .bind(ts(stored.updated_at))
            .bind(stored.id.to_string())
            .execute(&mut *db_tx)
            .await
            .map_err(db_err)?;
        } else {
            tracing::debug!(
                reference = %stored.reference,
                from = %stored.status,
                to = %txn.status,
                "ignoring backward status change"
            );
        }

        commit(db_tx).await?;
        Ok(stored)
    }

    async fn find_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, RepoError> {
        select_transaction(&self.pool, "id", id.to_string()).await
    }

    async fn find_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, RepoError> {
        select_transaction(&self.pool, "reference", reference.to_string()).await
    }

    async fn list_transactions_for_user(
        &self,
        user_id: UserId,
        kind: Option<TransactionKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>, RepoError> {
        let sql = format!(
            r#"SELECT {} FROM transactions
               WHERE user_id = ? AND (? IS NULL OR kind = ?)
               ORDER BY created_at DESC, id DESC
               LIMIT ? OFFSET ?"#,
            TRANSACTION_COLUMNS
        );
        let kind = kind.map(|k| k.as_str());
        let rows: Vec<DbTransaction> = sqlx::query_as(&sql)
            .bind(user_id.to_string())
            .bind(kind)
            .bind(kind)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(DbTransaction::into_domain).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Escrow implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl EscrowStore for SqliteRepo {
    async fn insert_escrow(&self, escrow: &EscrowAccount) -> Result<(), RepoError> {
        let sql = format!(
            "INSERT INTO escrow_accounts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ESCROW_COLUMNS
        );
        sqlx::query(&sql)
            .bind(escrow.id.to_string())
            .bind(escrow.transaction_id.to_string())
            .bind(escrow.booking_id.to_string())
            .bind(escrow.customer_id.to_string())
            .bind(escrow.vendor_id.to_string())
            .bind(escrow.amount)
            .bind(escrow.currency.code())
            .bind(escrow.status.as_str())
            .bind(&escrow.release_condition)
            .bind(&escrow.dispute_id)
            .bind(ts(escrow.expires_at))
            .bind(escrow.released_at.map(ts))
            .bind(ts(escrow.created_at))
            .execute(&self.pool)
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn find_escrow_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<EscrowAccount>, RepoError> {
        let sql = format!(
            "SELECT {} FROM escrow_accounts WHERE booking_id = ?",
            ESCROW_COLUMNS
        );
        let row: Option<DbEscrow> = sqlx::query_as(&sql)
            .bind(booking_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(DbEscrow::into_domain).transpose()
    }

    async fn transition_escrow(
        &self,
        booking_id: BookingId,
        from: EscrowStatus,
        to: EscrowStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<EscrowAccount>, RepoError> {
        let released_at = (to == EscrowStatus::Released).then(|| ts(at));

        let mut db_tx = self.begin().await?;
        let result = sqlx::query(
            r#"UPDATE escrow_accounts SET status = ?, released_at = COALESCE(?, released_at)
               WHERE booking_id = ? AND status = ?"#,
        )
        .bind(to.as_str())
        .bind(released_at)
        .bind(booking_id.to_string())
        .bind(from.as_str())
        .execute(&mut *db_tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {} FROM escrow_accounts WHERE booking_id = ?",
            ESCROW_COLUMNS
        );
        let row: DbEscrow = sqlx::query_as(&sql)
            .bind(booking_id.to_string())
            .fetch_one(&mut *db_tx)
            .await
            .map_err(db_err)?;
        commit(db_tx).await?;

        row.into_domain().map(Some)
    }
}
