//! Payout transfers.
//!
//! A payout is debited from the vendor wallet when it is requested; the bank
//! transfer then runs on a background worker. Whatever the outcome, it is
//! written back through [`TransferSettler`], the same path webhooks use.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use settlement_types::{
    AppError, LedgerEntry, LedgerStore, PaymentGateway, ProviderError, ProviderKind, Transaction,
    TransactionKind, TransactionStatus, TransferInstruction, TransferStatus,
};

use crate::gateways::bounded;

// ─────────────────────────────────────────────────────────────────────────────
// Write-back
// ─────────────────────────────────────────────────────────────────────────────

/// Applies transfer outcomes to payout transactions.
///
/// A failed payout is credited back through a `reversal:` record, so the
/// wallet is restored at most once however many failure signals arrive.
pub struct TransferSettler<R> {
    repo: Arc<R>,
}

impl<R> Clone for TransferSettler<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
        }
    }
}

impl<R: LedgerStore> TransferSettler<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Marks the payout `reference` as paid.
    pub async fn succeed(
        &self,
        reference: &str,
        provider_ref: Option<String>,
    ) -> Result<Transaction, AppError> {
        let payout = self.payout(reference).await?;

        let mut update = payout.clone();
        update.status = TransactionStatus::Success;
        update.paid_at = payout.paid_at.or_else(|| Some(Utc::now()));
        if provider_ref.is_some() {
            update.provider_ref = provider_ref;
        }
        update.updated_at = Utc::now();

        let stored = self.repo.record_transaction(&update).await?;
        if stored.status == TransactionStatus::Success {
            tracing::info!(reference, "payout settled");
        } else {
            tracing::warn!(reference, status = %stored.status, "late transfer success ignored");
        }
        Ok(stored)
    }

    /// Marks the payout `reference` as failed and returns the funds to the
    /// vendor wallet.
    pub async fn fail(&self, reference: &str, reason: &str) -> Result<Transaction, AppError> {
        let payout = self.payout(reference).await?;

        let mut update = payout.clone();
        update.status = TransactionStatus::Failed;
        update
            .provider_data
            .insert("failure_reason".into(), Value::String(reason.to_string()));
        update.updated_at = Utc::now();

        let stored = self.repo.record_transaction(&update).await?;
        if stored.status != TransactionStatus::Failed {
            tracing::warn!(reference, status = %stored.status, "late transfer failure ignored");
            return Ok(stored);
        }

        let mut reversal = Transaction::new(
            TransactionKind::Refund,
            payout.user_id,
            payout.money(),
            0,
            ProviderKind::Internal,
            payout.reversal_reference(),
        )?
        .with_status(TransactionStatus::Success)
        .with_description(format!("Reversal of payout {}", payout.reference));
        reversal.metadata.insert(
            "original_transaction_id".into(),
            Value::String(payout.id.to_string()),
        );
        reversal.metadata.insert("reason".into(), Value::String(reason.to_string()));
        reversal.paid_at = Some(Utc::now());

        match self.repo.credit_with_record(&reversal).await? {
            LedgerEntry::Applied(wallet) => tracing::info!(
                reference,
                vendor_id = %payout.user_id,
                balance = wallet.balance.amount(),
                "payout failed, wallet credited back"
            ),
            LedgerEntry::AlreadyApplied(_) => {
                tracing::debug!(reference, "payout reversal already applied")
            }
        }
        Ok(stored)
    }

    /// Keeps the payout in flight, remembering the provider's transfer id.
    pub async fn await_provider(
        &self,
        reference: &str,
        provider_ref: Option<String>,
        note: Option<String>,
    ) -> Result<Transaction, AppError> {
        let payout = self.payout(reference).await?;

        let mut update = payout.clone();
        update.provider_ref = provider_ref.or(payout.provider_ref);
        if let Some(note) = note {
            update
                .provider_data
                .insert("transfer_error".into(), Value::String(note));
        }
        update.updated_at = Utc::now();

        self.repo.record_transaction(&update).await.map_err(Into::into)
    }

    async fn payout(&self, reference: &str) -> Result<Transaction, AppError> {
        let txn = self
            .repo
            .find_transaction_by_reference(reference)
            .await?
            .ok_or_else(|| AppError::TransactionNotFound(reference.to_string()))?;
        if txn.kind != TransactionKind::Payout {
            return Err(AppError::InvalidRequest(format!(
                "{} is a {} transaction, not a payout",
                reference, txn.kind
            )));
        }
        Ok(txn)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background worker
// ─────────────────────────────────────────────────────────────────────────────

/// A transfer waiting to be sent to the payout provider.
pub(crate) struct PayoutJob {
    pub instruction: TransferInstruction,
    pub done: oneshot::Sender<Transaction>,
}

/// Handle to a payout whose transfer runs in the background.
#[derive(Debug)]
pub struct PayoutTicket {
    /// The payout as recorded when it was accepted.
    pub transaction: Transaction,
    /// Wallet balance after the debit.
    pub balance: i64,
    completion: oneshot::Receiver<Transaction>,
}

impl PayoutTicket {
    pub(crate) fn new(
        transaction: Transaction,
        balance: i64,
        completion: oneshot::Receiver<Transaction>,
    ) -> Self {
        Self {
            transaction,
            balance,
            completion,
        }
    }

    /// Waits for the transfer attempt and returns the payout as stored
    /// afterwards. `None` if the worker shut down first.
    pub async fn wait(self) -> Option<Transaction> {
        self.completion.await.ok()
    }
}

/// Queue in front of the transfer worker.
pub(crate) struct PayoutDispatcher {
    queue: mpsc::Sender<PayoutJob>,
}

impl PayoutDispatcher {
    /// Starts the worker. Each job runs as its own task, so one slow
    /// provider call does not hold up the rest of the queue.
    pub fn spawn<R: LedgerStore>(
        settler: TransferSettler<R>,
        gateway: Arc<dyn PaymentGateway>,
        timeout: Duration,
        capacity: usize,
    ) -> Self {
        let (queue, mut jobs) = mpsc::channel::<PayoutJob>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let settler = settler.clone();
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    let reference = job.instruction.reference.clone();
                    match run_transfer(&settler, gateway.as_ref(), timeout, &job.instruction).await
                    {
                        Ok(stored) => {
                            let _ = job.done.send(stored);
                        }
                        Err(e) => {
                            tracing::error!(%reference, error = %e, "payout outcome could not be recorded");
                        }
                    }
                });
            }
            tracing::debug!("payout worker stopped");
        });

        Self { queue }
    }

    /// Hands `job` to the worker, giving it back if the queue is full or closed.
    pub fn dispatch(&self, job: PayoutJob) -> Result<(), PayoutJob> {
        self.queue.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }
}

/// Sends one transfer and writes the outcome back.
///
/// Definite failures reverse the debit. An unanswered or unreadable call
/// leaves the payout `processing`: the transfer may have gone out, so the
/// outcome is left to the provider's webhook.
async fn run_transfer<R: LedgerStore>(
    settler: &TransferSettler<R>,
    gateway: &dyn PaymentGateway,
    timeout: Duration,
    instruction: &TransferInstruction,
) -> Result<Transaction, AppError> {
    let reference = instruction.reference.as_str();
    let provider = gateway.kind();

    match bounded(provider, timeout, gateway.initiate_transfer(instruction)).await {
        Ok(receipt) => match receipt.status {
            TransferStatus::Success => {
                settler
                    .succeed(reference, Some(receipt.provider_transfer_ref))
                    .await
            }
            TransferStatus::Pending => {
                tracing::info!(reference, %provider, "transfer accepted, awaiting webhook");
                settler
                    .await_provider(reference, Some(receipt.provider_transfer_ref), None)
                    .await
            }
            TransferStatus::Failed => {
                settler
                    .fail(reference, "provider reported the transfer as failed")
                    .await
            }
        },
        Err(e @ (ProviderError::Unavailable(_) | ProviderError::InvalidResponse(_))) => {
            tracing::error!(reference, %provider, error = %e, "transfer outcome unknown, awaiting webhook");
            settler
                .await_provider(reference, None, Some(e.to_string()))
                .await
        }
        Err(e) => {
            tracing::warn!(reference, %provider, error = %e, "transfer refused");
            settler.fail(reference, &e.to_string()).await
        }
    }
}
