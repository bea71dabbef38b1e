//! PostgreSQL repository adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction as DbTx};

use settlement_types::{
    BookingId, Currency, DomainError, EscrowAccount, EscrowStatus, EscrowStore, LedgerEntry,
    LedgerStore, Money, RepoError, Transaction, TransactionId, TransactionKind, UserId, Wallet,
    WalletId,
};

use crate::types::{
    DbEscrow, DbTransaction, DbWallet, ESCROW_COLUMNS, TRANSACTION_COLUMNS,
    WALLET_COLUMNS, db_err, write_err,
};

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL Repository
// ─────────────────────────────────────────────────────────────────────────────

/// PostgreSQL repository with row-level locking.
pub struct PostgresRepo {
    pool: PgPool,
}

/// Executes SQL statements from a migration file, splitting by semicolons.
async fn execute_migration(pool: &PgPool, sql: &str, name: &str) -> Result<(), anyhow::Error> {
    for statement in sql.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .map_err(|e| anyhow::anyhow!("Migration {} failed: {}", name, e))?;
        }
    }
    Ok(())
}

/// Runs all database migrations.
async fn run_migrations(pool: &PgPool) -> Result<(), anyhow::Error> {
    execute_migration(
        pool,
        include_str!("../migrations/0001_create_ledger_pg.sql"),
        "0001",
    )
    .await?;

    execute_migration(
        pool,
        include_str!("../migrations/0002_create_escrow_accounts_pg.sql"),
        "0002",
    )
    .await?;

    Ok(())
}

impl PostgresRepo {
    /// Creates a new PostgreSQL repository with automatic migration.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the database schema (for testing with existing pool).
    pub async fn create_schema(&self) -> Result<(), RepoError> {
        run_migrations(&self.pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))
    }

    async fn begin(&self) -> Result<DbTx<'static, Postgres>, RepoError> {
        self.pool
            .begin()
            .await
            .map_err(|e| RepoError::Transaction(e.to_string()))
    }
}

async fn commit(db_tx: DbTx<'static, Postgres>) -> Result<(), RepoError> {
    db_tx
        .commit()
        .await
        .map_err(|e| RepoError::Transaction(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Statements shared by the ledger operations
// ─────────────────────────────────────────────────────────────────────────────

async fn ensure_wallet(
    db_tx: &mut DbTx<'static, Postgres>,
    user_id: UserId,
    currency: Currency,
) -> Result<(), RepoError> {
    let now = Utc::now();
    sqlx::query(
        r#"INSERT INTO wallets (id, user_id, currency, balance, pending_balance, is_active, created_at, updated_at)
           VALUES ($1, $2, $3, 0, 0, TRUE, $4, $4)
           ON CONFLICT (user_id, currency) DO NOTHING"#,
    )
    .bind(WalletId::new().into_uuid())
    .bind(user_id.into_uuid())
    .bind(currency.code())
    .bind(now)
    .execute(&mut **db_tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Locks and returns the wallet row.
async fn lock_wallet(
    db_tx: &mut DbTx<'static, Postgres>,
    user_id: UserId,
    currency: Currency,
) -> Result<Wallet, RepoError> {
    let sql = format!(
        "SELECT {} FROM wallets WHERE user_id = $1 AND currency = $2 FOR UPDATE",
        WALLET_COLUMNS
    );
    let row: DbWallet = sqlx::query_as(&sql)
        .bind(user_id.into_uuid())
        .bind(currency.code())
        .fetch_one(&mut **db_tx)
        .await
        .map_err(db_err)?;
    row.into_domain()
}

/// Applies `delta` to a locked wallet and returns the updated row.
async fn apply_delta(
    db_tx: &mut DbTx<'static, Postgres>,
    user_id: UserId,
    currency: Currency,
    delta: i64,
) -> Result<Wallet, RepoError> {
    let sql = format!(
        r#"UPDATE wallets SET balance = balance + $1, updated_at = $2
           WHERE user_id = $3 AND currency = $4
           RETURNING {}"#,
        WALLET_COLUMNS
    );
    let row: DbWallet = sqlx::query_as(&sql)
        .bind(delta)
        .bind(Utc::now())
        .bind(user_id.into_uuid())
        .bind(currency.code())
        .fetch_one(&mut **db_tx)
        .await
        .map_err(db_err)?;
    row.into_domain()
}

async fn credit_locked(
    db_tx: &mut DbTx<'static, Postgres>,
    user_id: UserId,
    amount: Money,
) -> Result<Wallet, RepoError> {
    ensure_wallet(db_tx, user_id, amount.currency()).await?;
    lock_wallet(db_tx, user_id, amount.currency()).await?;
    apply_delta(db_tx, user_id, amount.currency(), amount.amount()).await
}

async fn debit_locked(
    db_tx: &mut DbTx<'static, Postgres>,
    user_id: UserId,
    amount: Money,
) -> Result<Wallet, RepoError> {
    ensure_wallet(db_tx, user_id, amount.currency()).await?;

    // Lock the wallet with FOR UPDATE
    let wallet = lock_wallet(db_tx, user_id, amount.currency()).await?;
    if !wallet.has_sufficient_funds(&amount) {
        return Err(RepoError::Domain(DomainError::InsufficientFunds {
            available: wallet.balance.amount(),
            requested: amount.amount(),
        }));
    }

    apply_delta(db_tx, user_id, amount.currency(), -amount.amount()).await
}

async fn insert_transaction(
    db_tx: &mut DbTx<'static, Postgres>,
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
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) {}"#,
        TRANSACTION_COLUMNS, conflict
    );
    let result = sqlx::query(&sql)
        .bind(txn.id.into_uuid())
        .bind(&txn.reference)
        .bind(txn.user_id.into_uuid())
        .bind(txn.vendor_id.map(UserId::into_uuid))
        .bind(txn.booking_id.map(BookingId::into_uuid))
        .bind(txn.kind.as_str())
        .bind(txn.status.as_str())
        .bind(txn.provider.as_str())
        .bind(txn.amount)
        .bind(txn.currency.code())
        .bind(txn.fee)
        .bind(txn.net_amount)
        .bind(&txn.description)
        .bind(serde_json::Value::Object(txn.metadata.clone()))
        .bind(&txn.provider_ref)
        .bind(serde_json::Value::Object(txn.provider_data.clone()))
        .bind(txn.paid_at)
        .bind(txn.created_at)
        .bind(txn.updated_at)
        .execute(&mut **db_tx)
        .await
        .map_err(write_err)?;
    Ok(result.rows_affected() == 1)
}

/// Lookup key for a single transaction row.
enum Key<'a> {
    Id(TransactionId),
    Reference(&'a str),
}

async fn select_transaction(
    executor: impl sqlx::PgExecutor<'_>,
    key: Key<'_>,
    lock: bool,
) -> Result<Option<Transaction>, RepoError> {
    let column = match key {
        Key::Id(_) => "id",
        Key::Reference(_) => "reference",
    };
    let sql = format!(
        "SELECT {} FROM transactions WHERE {} = $1 {}",
        TRANSACTION_COLUMNS,
        column,
        if lock { "FOR UPDATE" } else { "" }
    );
    let query = sqlx::query_as::<_, DbTransaction>(&sql);
    let query = match key {
        Key::Id(id) => query.bind(id.into_uuid()),
        Key::Reference(reference) => query.bind(reference.to_string()),
    };
    let row = query.fetch_optional(executor).await.map_err(db_err)?;
    row.map(DbTransaction::into_domain).transpose()
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for PostgresRepo {
    async fn get_or_create_wallet(
        &self,
        user_id: UserId,
        currency: Currency,
    ) -> Result<Wallet, RepoError> {
        let mut db_tx = self.begin().await?;
        ensure_wallet(&mut db_tx, user_id, currency).await?;
        let wallet = lock_wallet(&mut db_tx, user_id, currency).await?;
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
        let wallet = credit_locked(&mut db_tx, user_id, amount).await?;
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
        let wallet = debit_locked(&mut db_tx, user_id, amount).await?;
        commit(db_tx).await?;
        Ok(wallet)
    }

    async fn credit_with_record(&self, record: &Transaction) -> Result<LedgerEntry, RepoError> {
        let mut db_tx = self.begin().await?;

        if !insert_transaction(&mut db_tx, record, true).await? {
            let existing = select_transaction(&mut *db_tx, Key::Reference(&record.reference), false)
                .await?
                .ok_or_else(|| {
                    RepoError::Conflict(format!(
                        "transaction id {} already used by another reference",
                        record.id
                    ))
                })?;
            return Ok(LedgerEntry::AlreadyApplied(existing));
        }

        let wallet = credit_locked(&mut db_tx, record.user_id, record.money()).await?;
        commit(db_tx).await?;
        Ok(LedgerEntry::Applied(wallet))
    }

    async fn debit_with_record(&self, record: &Transaction) -> Result<Wallet, RepoError> {
        let mut db_tx = self.begin().await?;
        let wallet = debit_locked(&mut db_tx, record.user_id, record.money()).await?;
        insert_transaction(&mut db_tx, record, false).await?;
        commit(db_tx).await?;
        Ok(wallet)
    }

    async fn record_transaction(&self, txn: &Transaction) -> Result<Transaction, RepoError> {
        let mut db_tx = self.begin().await?;

        if insert_transaction(&mut db_tx, txn, true).await? {
            commit(db_tx).await?;
            return Ok(txn.clone());
        }

        // Lock the stored row with FOR UPDATE
        let mut stored = select_transaction(&mut *db_tx, Key::Id(txn.id), true)
            .await?
            .ok_or_else(|| {
                RepoError::Conflict(format!("reference {} already exists", txn.reference))
            })?;

        if stored.absorb(txn) {
            sqlx::query(
                r#"UPDATE transactions
                   SET status = $1, provider_ref = $2, provider_data = $3, paid_at = $4, updated_at = $5
                   WHERE id = $6"#,
            )
            .bind(stored.status.as_str())
            .bind(&stored.provider_ref)
            .bind(serde_json::Value::Object(stored.provider_data.clone()))
            .bind(stored.paid_at)
            .bind(stored.updated_at)
            .bind(stored.id.into_uuid())
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
        select_transaction(&self.pool, Key::Id(id), false).await
    }

    async fn find_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, RepoError> {
        select_transaction(&self.pool, Key::Reference(reference), false).await
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
               WHERE user_id = $1 AND ($2::text IS NULL OR kind = $2)
               ORDER BY created_at DESC, id DESC
               LIMIT $3 OFFSET $4"#,
            TRANSACTION_COLUMNS
        );
        let rows: Vec<DbTransaction> = sqlx::query_as(&sql)
            .bind(user_id.into_uuid())
            .bind(kind.map(|k| k.as_str()))
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
impl EscrowStore for PostgresRepo {
    async fn insert_escrow(&self, escrow: &EscrowAccount) -> Result<(), RepoError> {
        let sql = format!(
            "INSERT INTO escrow_accounts ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            ESCROW_COLUMNS
        );
        sqlx::query(&sql)
            .bind(escrow.id.into_uuid())
            .bind(escrow.transaction_id.into_uuid())
            .bind(escrow.booking_id.into_uuid())
            .bind(escrow.customer_id.into_uuid())
            .bind(escrow.vendor_id.into_uuid())
            .bind(escrow.amount)
            .bind(escrow.currency.code())
            .bind(escrow.status.as_str())
            .bind(&escrow.release_condition)
            .bind(&escrow.dispute_id)
            .bind(escrow.expires_at)
            .bind(escrow.released_at)
            .bind(escrow.created_at)
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
            "SELECT {} FROM escrow_accounts WHERE booking_id = $1",
            ESCROW_COLUMNS
        );
        let row: Option<DbEscrow> = sqlx::query_as(&sql)
            .bind(booking_id.into_uuid())
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
        let released_at = (to == EscrowStatus::Released).then_some(at);
        let sql = format!(
            r#"UPDATE escrow_accounts SET status = $1, released_at = COALESCE($2, released_at)
               WHERE booking_id = $3 AND status = $4
               RETURNING {}"#,
            ESCROW_COLUMNS
        );
        let row: Option<DbEscrow> = sqlx::query_as(&sql)
            .bind(to.as_str())
            .bind(released_at)
            .bind(booking_id.into_uuid())
            .bind(from.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(DbEscrow::into_domain).transpose()
    }
}
