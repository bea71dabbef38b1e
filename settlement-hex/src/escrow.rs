//! Escrow Manager
//!
//! Owns every escrow status transition. Release and refund credit the
//! ledger first, through a reference-keyed record, and flip the escrow
//! status last, so a retry after a crash between the two finishes the job
//! without crediting twice.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use settlement_types::{
    AppError, BookingId, EscrowAccount, EscrowStatus, EscrowStore, LedgerEntry, LedgerStore,
    Metadata, Money, ProviderKind, Transaction, TransactionKind, TransactionStatus, UserId,
};

/// Per-booking escrow state machine over the ledger.
pub struct EscrowManager<R> {
    repo: Arc<R>,
    expiry_days: i64,
    locks: DashMap<BookingId, Arc<Mutex<()>>>,
}

impl<R: LedgerStore + EscrowStore> EscrowManager<R> {
    pub fn new(repo: Arc<R>, expiry_days: i64) -> Self {
        Self {
            repo,
            expiry_days,
            locks: DashMap::new(),
        }
    }

    /// Opens a `held` escrow for `booking_id`, funded by `funding`.
    #[tracing::instrument(skip(self, funding), fields(booking_id = %booking_id, reference = %funding.reference))]
    pub async fn open(
        &self,
        funding: &Transaction,
        booking_id: BookingId,
        customer_id: UserId,
        vendor_id: UserId,
        amount: Money,
        release_condition: &str,
    ) -> Result<EscrowAccount, AppError> {
        let escrow = EscrowAccount::open(
            funding,
            booking_id,
            customer_id,
            vendor_id,
            amount,
            release_condition,
            self.expiry_days,
        )?;
        self.repo.insert_escrow(&escrow).await?;

        tracing::info!(amount = escrow.amount, expires_at = %escrow.expires_at, "escrow opened");
        Ok(escrow)
    }

    /// Pays the held amount to the vendor.
    #[tracing::instrument(skip(self), fields(booking_id = %booking_id))]
    pub async fn release(&self, booking_id: BookingId) -> Result<EscrowAccount, AppError> {
        let lock = self.lock_for(booking_id);
        let _guard = lock.lock().await;

        let (escrow, funding) = self.settleable(booking_id).await?;
        ensure_paid(&funding, booking_id)?;
        self.ensure_not_applied(&escrow.refund_reference(), "refunded")
            .await?;

        let mut metadata = Metadata::new();
        metadata.insert("escrow_id".into(), Value::String(escrow.id.to_string()));
        metadata.insert(
            "funding_transaction_id".into(),
            Value::String(escrow.transaction_id.to_string()),
        );

        let record = settled_record(
            TransactionKind::EscrowRelease,
            escrow.vendor_id,
            &escrow,
            escrow.release_reference(),
        )?
        .with_vendor(Some(escrow.vendor_id))
        .with_description(format!("Escrow release for booking {}", booking_id))
        .with_metadata(metadata);

        self.apply_credit(&record).await?;
        let released = self
            .finish(booking_id, EscrowStatus::Released)
            .await?;

        tracing::info!(vendor_id = %released.vendor_id, amount = released.amount, "escrow released");
        Ok(released)
    }

    /// Returns the held amount to the customer and records the reversal.
    #[tracing::instrument(skip(self), fields(booking_id = %booking_id))]
    pub async fn refund(
        &self,
        booking_id: BookingId,
        reason: &str,
    ) -> Result<EscrowAccount, AppError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::InvalidRequest("Refund reason is required".into()));
        }

        let lock = self.lock_for(booking_id);
        let _guard = lock.lock().await;

        let (escrow, funding) = self.settleable(booking_id).await?;
        // A refund that died after flipping the payment may still finish.
        let resuming = funding.status == TransactionStatus::Refunded
            && self.is_applied(&escrow.refund_reference()).await?;
        if !resuming {
            ensure_paid(&funding, booking_id)?;
        }
        self.ensure_not_applied(&escrow.release_reference(), "released")
            .await?;

        let mut metadata = Metadata::new();
        metadata.insert(
            "original_transaction_id".into(),
            Value::String(escrow.transaction_id.to_string()),
        );
        metadata.insert("escrow_id".into(), Value::String(escrow.id.to_string()));
        metadata.insert("reason".into(), Value::String(reason.to_string()));

        let record = settled_record(
            TransactionKind::Refund,
            escrow.customer_id,
            &escrow,
            escrow.refund_reference(),
        )?
        .with_vendor(Some(escrow.vendor_id))
        .with_description(format!("Refund: {}", reason))
        .with_metadata(metadata);

        self.apply_credit(&record).await?;
        self.mark_funding_refunded(&escrow).await?;
        let refunded = self
            .finish(booking_id, EscrowStatus::Refunded)
            .await?;

        tracing::info!(customer_id = %refunded.customer_id, amount = refunded.amount, "escrow refunded");
        Ok(refunded)
    }

    pub async fn status(&self, booking_id: BookingId) -> Result<EscrowAccount, AppError> {
        self.repo
            .find_escrow_by_booking(booking_id)
            .await
            .map_err(Into::into)
            .and_then(|opt| opt.ok_or_else(|| AppError::EscrowNotFound(booking_id.to_string())))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Steps
    // ─────────────────────────────────────────────────────────────────────────────

    fn lock_for(&self, booking_id: BookingId) -> Arc<Mutex<()>> {
        self.locks.entry(booking_id).or_default().clone()
    }

    /// Loads a held escrow together with the payment that funded it.
    async fn settleable(
        &self,
        booking_id: BookingId,
    ) -> Result<(EscrowAccount, Transaction), AppError> {
        let escrow = self.status(booking_id).await?;
        escrow.ensure_held()?;

        let funding = self
            .repo
            .find_transaction(escrow.transaction_id)
            .await?
            .ok_or_else(|| AppError::TransactionNotFound(escrow.transaction_id.to_string()))?;
        Ok((escrow, funding))
    }

    async fn is_applied(&self, reference: &str) -> Result<bool, AppError> {
        Ok(self
            .repo
            .find_transaction_by_reference(reference)
            .await?
            .is_some())
    }

    /// Release and refund exclude each other even if a status flip was lost.
    async fn ensure_not_applied(&self, reference: &str, outcome: &str) -> Result<(), AppError> {
        if self.is_applied(reference).await? {
            return Err(AppError::InvalidState(format!(
                "escrow funds were already {} ({})",
                outcome, reference
            )));
        }
        Ok(())
    }

    async fn apply_credit(&self, record: &Transaction) -> Result<(), AppError> {
        match self.repo.credit_with_record(record).await? {
            LedgerEntry::Applied(wallet) => {
                tracing::debug!(
                    user_id = %wallet.user_id,
                    balance = wallet.balance.amount(),
                    reference = %record.reference,
                    "escrow credit applied"
                );
            }
            LedgerEntry::AlreadyApplied(existing) => {
                tracing::warn!(
                    reference = %existing.reference,
                    "escrow credit already on the ledger, completing status change"
                );
            }
        }
        Ok(())
    }

    async fn mark_funding_refunded(&self, escrow: &EscrowAccount) -> Result<(), AppError> {
        let Some(mut funding) = self.repo.find_transaction(escrow.transaction_id).await? else {
            return Ok(());
        };
        if funding.status == TransactionStatus::Refunded {
            return Ok(());
        }
        funding.advance(TransactionStatus::Refunded)?;
        self.repo.record_transaction(&funding).await?;
        Ok(())
    }

    async fn finish(
        &self,
        booking_id: BookingId,
        to: EscrowStatus,
    ) -> Result<EscrowAccount, AppError> {
        let updated = self
            .repo
            .transition_escrow(booking_id, EscrowStatus::Held, to, Utc::now())
            .await?
            .ok_or_else(|| {
                AppError::InvalidState(format!("escrow for booking {} is no longer held", booking_id))
            })?;
        self.locks.remove(&booking_id);
        Ok(updated)
    }
}

fn ensure_paid(funding: &Transaction, booking_id: BookingId) -> Result<(), AppError> {
    if funding.status != TransactionStatus::Success {
        return Err(AppError::InvalidState(format!(
            "payment {} for booking {} is {}, not success",
            funding.reference, booking_id, funding.status
        )));
    }
    Ok(())
}

/// An internal, already-settled ledger record for the escrow amount.
fn settled_record(
    kind: TransactionKind,
    user_id: UserId,
    escrow: &EscrowAccount,
    reference: String,
) -> Result<Transaction, AppError> {
    let mut record = Transaction::new(
        kind,
        user_id,
        escrow.money(),
        0,
        ProviderKind::Internal,
        reference,
    )?
    .with_booking(Some(escrow.booking_id))
    .with_status(TransactionStatus::Success);
    record.paid_at = Some(Utc::now());
    Ok(record)
}
