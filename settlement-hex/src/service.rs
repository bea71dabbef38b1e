//! Settlement Orchestrator
//!
//! Drives payments, payouts and provider webhooks through the ledger and
//! provider ports. Contains NO infrastructure logic - adapters are injected.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::Value;
use tokio::sync::oneshot;

use settlement_types::{
    AppError, BookingId, ChargeRequest, Currency, DEFAULT_RELEASE_CONDITION, EscrowAccount,
    EscrowStore, InitializePaymentRequest, InitializePaymentResponse, LedgerStore, Money, Page,
    PayoutRequest, ProviderEvent, ProviderKind, ProviderStatus, Transaction, TransactionId,
    TransactionKind, TransactionStatus, TransferInstruction, UserId, Wallet,
};

use crate::config::SettlementConfig;
use crate::escrow::EscrowManager;
use crate::gateways::{GatewayRegistry, bounded};
use crate::payouts::{PayoutDispatcher, PayoutJob, PayoutTicket, TransferSettler};

/// Prefix of customer payment references.
pub const PAYMENT_PREFIX: &str = "VND";
/// Prefix of vendor payout references.
pub const PAYOUT_PREFIX: &str = "PAY";

/// Builds a reference from a random component and the current time, so two
/// references never collide even when clocks disagree.
pub fn generate_reference(prefix: &str) -> String {
    let random: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!(
        "{}-{}-{}",
        prefix,
        random.to_ascii_uppercase(),
        Utc::now().timestamp_millis()
    )
}

/// Application service for settlement operations.
///
/// Generic over the storage adapter, which must provide both the ledger
/// and the escrow ports.
pub struct SettlementService<R: LedgerStore + EscrowStore> {
    repo: Arc<R>,
    gateways: GatewayRegistry,
    escrow: EscrowManager<R>,
    settler: TransferSettler<R>,
    payouts: Option<PayoutDispatcher>,
    config: SettlementConfig,
}

impl<R: LedgerStore + EscrowStore> SettlementService<R> {
    /// Creates the service and starts the payout worker.
    ///
    /// Must be called inside a Tokio runtime. Payouts are refused when no
    /// gateway is registered for `config.payout_provider`.
    pub fn new(repo: R, gateways: GatewayRegistry, config: SettlementConfig) -> Self {
        let repo = Arc::new(repo);
        let settler = TransferSettler::new(repo.clone());

        let payouts = match gateways.get(config.payout_provider) {
            Ok(gateway) => Some(PayoutDispatcher::spawn(
                settler.clone(),
                gateway,
                config.provider_timeout,
                config.payout_queue_capacity,
            )),
            Err(_) => {
                tracing::warn!(provider = %config.payout_provider, "payout provider not configured; payouts disabled");
                None
            }
        };

        Self {
            escrow: EscrowManager::new(repo.clone(), config.escrow_expiry_days),
            repo,
            gateways,
            settler,
            payouts,
            config,
        }
    }

    /// Returns a reference to the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn escrow(&self) -> &EscrowManager<R> {
        &self.escrow
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Payments
    // ─────────────────────────────────────────────────────────────────────────────

    /// Records a pending payment and opens a provider checkout session for it.
    ///
    /// A provider failure leaves the transaction `failed`, never `pending`.
    /// With `use_escrow` and both vendor and booking present, the net amount
    /// is held in escrow for the booking.
    #[tracing::instrument(skip(self, req), fields(provider = %req.provider, amount = req.amount, reference))]
    pub async fn initialize_payment(
        &self,
        req: InitializePaymentRequest,
    ) -> Result<InitializePaymentResponse, AppError> {
        let amount = Money::positive(req.amount, req.currency)?;
        if req.email.trim().is_empty() {
            return Err(AppError::InvalidRequest("Payer email is required".into()));
        }
        if req.provider == ProviderKind::Internal {
            return Err(AppError::InvalidRequest(
                "Payments must be collected through an external provider".into(),
            ));
        }
        let gateway = self.gateways.get(req.provider)?;

        let escrow_target = match (req.use_escrow, req.vendor_id, req.booking_id) {
            (true, Some(vendor_id), Some(booking_id)) => {
                if self.repo.find_escrow_by_booking(booking_id).await?.is_some() {
                    return Err(AppError::InvalidState(format!(
                        "booking {} already has an escrow",
                        booking_id
                    )));
                }
                Some((vendor_id, booking_id))
            }
            (true, _, _) => {
                tracing::debug!("escrow requested without vendor and booking; not holding");
                None
            }
            _ => None,
        };

        let reference = generate_reference(PAYMENT_PREFIX);
        tracing::Span::current().record("reference", reference.as_str());

        let pending = Transaction::payment(
            req.user_id,
            amount,
            self.config.fee_bps,
            req.provider,
            reference.clone(),
        )?
        .with_vendor(req.vendor_id)
        .with_booking(req.booking_id)
        .with_description(req.description)
        .with_metadata(req.metadata);
        let mut txn = self.repo.record_transaction(&pending).await?;

        let charge = ChargeRequest {
            reference: reference.clone(),
            amount,
            email: req.email,
            callback_url: req.callback_url,
            metadata: txn.metadata.clone(),
        };

        let session = match bounded(
            req.provider,
            self.config.provider_timeout,
            gateway.initialize(&charge),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "payment initialization failed");
                self.mark_payment_failed(&txn, &e.to_string()).await;
                return Err(e.into());
            }
        };

        txn.advance(TransactionStatus::Processing)?;
        txn.provider_data.insert(
            "authorization_url".into(),
            Value::String(session.authorization_url.clone()),
        );
        if let Some(code) = &session.access_code {
            txn.provider_data
                .insert("access_code".into(), Value::String(code.clone()));
        }
        let txn = self.repo.record_transaction(&txn).await?;

        if let Some((vendor_id, booking_id)) = escrow_target {
            let held = Money::new(txn.net_amount, txn.currency)?;
            if let Err(e) = self
                .escrow
                .open(
                    &txn,
                    booking_id,
                    txn.user_id,
                    vendor_id,
                    held,
                    DEFAULT_RELEASE_CONDITION,
                )
                .await
            {
                tracing::warn!(error = %e, %booking_id, "escrow could not be opened");
                self.mark_payment_failed(&txn, &e.to_string()).await;
                return Err(e);
            }
        }

        tracing::info!(fee = txn.fee, net_amount = txn.net_amount, "payment initialized");
        Ok(InitializePaymentResponse {
            transaction_id: txn.id,
            reference: txn.reference,
            authorization_url: session.authorization_url,
            access_code: session.access_code,
            provider: txn.provider,
        })
    }

    async fn mark_payment_failed(&self, txn: &Transaction, error: &str) {
        let mut failed = txn.clone();
        failed.status = TransactionStatus::Failed;
        failed
            .provider_data
            .insert("error".into(), Value::String(error.to_string()));
        failed.updated_at = Utc::now();
        if let Err(record_err) = self.repo.record_transaction(&failed).await {
            tracing::error!(error = %record_err, "could not mark payment failed");
        }
    }

    /// Pulls the charge status from its provider and records it.
    ///
    /// Idempotent: a transaction already in a terminal state keeps it, and
    /// only the provider metadata is refreshed.
    #[tracing::instrument(skip(self))]
    pub async fn verify_payment(&self, reference: &str) -> Result<Transaction, AppError> {
        let txn = self
            .repo
            .find_transaction_by_reference(reference)
            .await?
            .ok_or_else(|| AppError::TransactionNotFound(reference.to_string()))?;
        if txn.kind == TransactionKind::Payout {
            return Err(AppError::InvalidRequest(format!(
                "{} is a payout; its outcome arrives by transfer webhook",
                reference
            )));
        }

        let gateway = self.gateways.get(txn.provider)?;
        let outcome = bounded(
            txn.provider,
            self.config.provider_timeout,
            gateway.verify(reference),
        )
        .await?;

        let next = match outcome.status {
            ProviderStatus::Success => TransactionStatus::Success,
            ProviderStatus::Failed => TransactionStatus::Failed,
            ProviderStatus::Pending | ProviderStatus::NotFound => {
                tracing::debug!(status = ?outcome.status, "charge not settled yet");
                return Ok(txn);
            }
        };

        let now = Utc::now();
        let mut update = txn.clone();
        update.status = next;
        if next == TransactionStatus::Success {
            update.paid_at = txn.paid_at.or(outcome.paid_at).or(Some(now));
        }
        if outcome.provider_ref.is_some() {
            update.provider_ref = outcome.provider_ref;
        }
        update
            .provider_data
            .insert("verification".into(), Value::Object(outcome.raw));
        update.updated_at = now;

        let stored = self.repo.record_transaction(&update).await?;
        if stored.status == next {
            tracing::info!(status = %stored.status, "payment verified");
        } else {
            tracing::info!(
                status = %stored.status,
                reported = %next,
                "verification outcome ignored for settled transaction"
            );
        }
        Ok(stored)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Webhooks
    // ─────────────────────────────────────────────────────────────────────────────

    /// Name of the header carrying `provider`'s webhook signature.
    pub fn signature_header(&self, provider: &str) -> Result<&'static str, AppError> {
        Ok(self.gateways.by_name(provider)?.signature_header())
    }

    /// Authenticates and applies a provider webhook.
    ///
    /// Charge events are never trusted on their own: they re-run
    /// [`Self::verify_payment`]. Returns the affected transaction, or `None`
    /// when the event is not one we act on.
    #[tracing::instrument(skip(self, payload, signature), fields(payload_len = payload.len()))]
    pub async fn handle_webhook(
        &self,
        provider: &str,
        payload: &[u8],
        signature: &str,
    ) -> Result<Option<Transaction>, AppError> {
        let gateway = self.gateways.by_name(provider)?;
        if !gateway.verify_webhook(payload, signature) {
            tracing::warn!(provider = %gateway.kind(), "webhook signature rejected");
            return Err(AppError::InvalidSignature);
        }

        let event = gateway.parse_event(payload).map_err(|e| {
            tracing::warn!(provider = %gateway.kind(), error = %e, "malformed webhook payload");
            AppError::InvalidRequest(format!("Malformed webhook payload: {}", e))
        })?;
        let result = match &event {
            ProviderEvent::ChargeCompleted { reference } => self.verify_payment(reference).await,
            ProviderEvent::TransferSucceeded { reference } => {
                self.settler.succeed(reference, None).await
            }
            ProviderEvent::TransferFailed { reference } => {
                self.settler
                    .fail(reference, "provider reported the transfer as failed")
                    .await
            }
            ProviderEvent::Ignored { event_type } => {
                tracing::debug!(%event_type, "webhook event ignored");
                return Ok(None);
            }
        };

        match result {
            Ok(txn) => Ok(Some(txn)),
            Err(AppError::TransactionNotFound(reference)) => {
                tracing::warn!(%reference, "webhook for unknown reference ignored");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Payouts
    // ─────────────────────────────────────────────────────────────────────────────

    /// Debits the vendor wallet and queues the bank transfer.
    ///
    /// The debit and the `processing` payout record are written together.
    /// If the transfer cannot be queued, the debit is reversed before the
    /// error is returned.
    #[tracing::instrument(skip(self, req), fields(vendor_id = %req.vendor_id, amount = req.amount, reference))]
    pub async fn request_payout(&self, req: PayoutRequest) -> Result<PayoutTicket, AppError> {
        let amount = Money::positive(req.amount, req.currency)?;
        req.bank.validate().map_err(AppError::InvalidRequest)?;
        let Some(dispatcher) = &self.payouts else {
            return Err(AppError::InvalidRequest("Payouts are not configured".into()));
        };

        let reference = generate_reference(PAYOUT_PREFIX);
        tracing::Span::current().record("reference", reference.as_str());

        let mut payout = Transaction::new(
            TransactionKind::Payout,
            req.vendor_id,
            amount,
            0,
            self.config.payout_provider,
            reference.clone(),
        )?
        .with_status(TransactionStatus::Processing)
        .with_description("Wallet withdrawal");
        for (key, value) in [
            ("bank_code", &req.bank.bank_code),
            ("account_number", &req.bank.account_number),
            ("account_name", &req.bank.account_name),
        ] {
            payout
                .metadata
                .insert(key.into(), Value::String(value.clone()));
        }

        let wallet = self.repo.debit_with_record(&payout).await?;

        let (done, completion) = oneshot::channel();
        let job = PayoutJob {
            instruction: TransferInstruction {
                reference: reference.clone(),
                amount,
                recipient: req.bank,
                reason: "Vendor payout".into(),
            },
            done,
        };
        if dispatcher.dispatch(job).is_err() {
            tracing::error!("payout queue unavailable, reversing debit");
            self.settler
                .fail(&reference, "transfer could not be queued")
                .await?;
            return Err(AppError::ProviderUnavailable(
                "payout queue is full, try again".into(),
            ));
        }

        tracing::info!(balance = wallet.balance.amount(), "payout accepted");
        Ok(PayoutTicket::new(payout, wallet.balance.amount(), completion))
    }

    pub async fn list_payouts(
        &self,
        vendor_id: UserId,
        page: Page,
    ) -> Result<Vec<Transaction>, AppError> {
        let page = page.normalized();
        self.repo
            .list_transactions_for_user(
                vendor_id,
                Some(TransactionKind::Payout),
                page.limit,
                page.offset,
            )
            .await
            .map_err(Into::into)
    }

    /// A payout owned by someone else is reported as not found.
    pub async fn get_payout(
        &self,
        vendor_id: UserId,
        payout_id: TransactionId,
    ) -> Result<Transaction, AppError> {
        match self.repo.find_transaction(payout_id).await? {
            Some(txn) if txn.kind == TransactionKind::Payout && txn.user_id == vendor_id => Ok(txn),
            _ => Err(AppError::TransactionNotFound(payout_id.to_string())),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Escrow
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn release_escrow(&self, booking_id: BookingId) -> Result<EscrowAccount, AppError> {
        self.escrow.release(booking_id).await
    }

    pub async fn refund_escrow(
        &self,
        booking_id: BookingId,
        reason: &str,
    ) -> Result<EscrowAccount, AppError> {
        self.escrow.refund(booking_id, reason).await
    }

    pub async fn escrow_status(&self, booking_id: BookingId) -> Result<EscrowAccount, AppError> {
        self.escrow.status(booking_id).await
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Wallets & History
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn get_or_create_wallet(
        &self,
        user_id: UserId,
        currency: Currency,
    ) -> Result<Wallet, AppError> {
        self.repo
            .get_or_create_wallet(user_id, currency)
            .await
            .map_err(Into::into)
    }

    /// Gets a transaction by ID.
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction, AppError> {
        self.repo
            .find_transaction(id)
            .await
            .map_err(Into::into)
            .and_then(|opt| opt.ok_or_else(|| AppError::TransactionNotFound(id.to_string())))
    }

    /// Lists a user's transactions, newest first.
    pub async fn list_wallet_transactions(
        &self,
        user_id: UserId,
        page: Page,
    ) -> Result<Vec<Transaction>, AppError> {
        let page = page.normalized();
        self.repo
            .list_transactions_for_user(user_id, None, page.limit, page.offset)
            .await
            .map_err(Into::into)
    }
}
