//! SettlementService unit tests.

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use settlement_types::{
        AppError, BankDetails, BookingId, ChargeRequest, ChargeSession, Currency, EscrowAccount,
        EscrowStatus, EscrowStore, InitializePaymentRequest, LedgerEntry, LedgerStore, Metadata,
        Money, PaymentGateway, PayoutRequest, ProviderError, ProviderEvent, ProviderKind,
        ProviderOutcome, ProviderStatus, RepoError, Transaction, TransactionId, TransactionKind,
        TransactionStatus, TransferInstruction, TransferReceipt, TransferStatus, UserId, Wallet,
    };

    use crate::{GatewayRegistry, SettlementConfig, SettlementService};

    // ─────────────────────────────────────────────────────────────────────────────
    // In-memory repository
    // ─────────────────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct State {
        wallets: HashMap<(UserId, Currency), Wallet>,
        transactions: Vec<Transaction>,
        escrows: HashMap<BookingId, EscrowAccount>,
    }

    impl State {
        fn wallet(&mut self, user_id: UserId, currency: Currency) -> &mut Wallet {
            self.wallets
                .entry((user_id, currency))
                .or_insert_with(|| Wallet::new(user_id, currency))
        }

        fn by_reference(&self, reference: &str) -> Option<&Transaction> {
            self.transactions.iter().find(|t| t.reference == reference)
        }
    }

    /// Simple in-memory repository for testing the service layer. One lock
    /// makes every operation atomic.
    #[derive(Default)]
    pub struct MockRepo {
        state: Mutex<State>,
    }

    #[async_trait]
    impl LedgerStore for MockRepo {
        async fn get_or_create_wallet(
            &self,
            user_id: UserId,
            currency: Currency,
        ) -> Result<Wallet, RepoError> {
            Ok(self.state.lock().unwrap().wallet(user_id, currency).clone())
        }

        async fn credit(&self, user_id: UserId, amount: Money) -> Result<Wallet, RepoError> {
            let mut state = self.state.lock().unwrap();
            let wallet = state.wallet(user_id, amount.currency());
            wallet.credit(amount)?;
            Ok(wallet.clone())
        }

        async fn debit(&self, user_id: UserId, amount: Money) -> Result<Wallet, RepoError> {
            let mut state = self.state.lock().unwrap();
            let wallet = state.wallet(user_id, amount.currency());
            wallet.debit(amount)?;
            Ok(wallet.clone())
        }

        async fn credit_with_record(&self, record: &Transaction) -> Result<LedgerEntry, RepoError> {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.by_reference(&record.reference) {
                return Ok(LedgerEntry::AlreadyApplied(existing.clone()));
            }
            let wallet = state.wallet(record.user_id, record.currency);
            wallet.credit(record.money())?;
            let wallet = wallet.clone();
            state.transactions.push(record.clone());
            Ok(LedgerEntry::Applied(wallet))
        }

        async fn debit_with_record(&self, record: &Transaction) -> Result<Wallet, RepoError> {
            let mut state = self.state.lock().unwrap();
            if state.by_reference(&record.reference).is_some() {
                return Err(RepoError::Conflict(record.reference.clone()));
            }
            let wallet = state.wallet(record.user_id, record.currency);
            wallet.debit(record.money())?;
            let wallet = wallet.clone();
            state.transactions.push(record.clone());
            Ok(wallet)
        }

        async fn record_transaction(&self, txn: &Transaction) -> Result<Transaction, RepoError> {
            let mut state = self.state.lock().unwrap();
            if let Some(stored) = state.transactions.iter_mut().find(|t| t.id == txn.id) {
                stored.absorb(txn);
                return Ok(stored.clone());
            }
            if state.by_reference(&txn.reference).is_some() {
                return Err(RepoError::Conflict(txn.reference.clone()));
            }
            state.transactions.push(txn.clone());
            Ok(txn.clone())
        }

        async fn find_transaction(
            &self,
            id: TransactionId,
        ) -> Result<Option<Transaction>, RepoError> {
            let state = self.state.lock().unwrap();
            Ok(state.transactions.iter().find(|t| t.id == id).cloned())
        }

        async fn find_transaction_by_reference(
            &self,
            reference: &str,
        ) -> Result<Option<Transaction>, RepoError> {
            Ok(self.state.lock().unwrap().by_reference(reference).cloned())
        }

        async fn list_transactions_for_user(
            &self,
            user_id: UserId,
            kind: Option<TransactionKind>,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<Transaction>, RepoError> {
            let state = self.state.lock().unwrap();
            let mut found: Vec<_> = state
                .transactions
                .iter()
                .filter(|t| t.user_id == user_id && kind.is_none_or(|k| t.kind == k))
                .cloned()
                .collect();
            found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(found
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        }
    }

    #[async_trait]
    impl EscrowStore for MockRepo {
        async fn insert_escrow(&self, escrow: &EscrowAccount) -> Result<(), RepoError> {
            let mut state = self.state.lock().unwrap();
            if state.escrows.contains_key(&escrow.booking_id) {
                return Err(RepoError::Conflict(escrow.booking_id.to_string()));
            }
            state.escrows.insert(escrow.booking_id, escrow.clone());
            Ok(())
        }

        async fn find_escrow_by_booking(
            &self,
            booking_id: BookingId,
        ) -> Result<Option<EscrowAccount>, RepoError> {
            Ok(self.state.lock().unwrap().escrows.get(&booking_id).cloned())
        }

        async fn transition_escrow(
            &self,
            booking_id: BookingId,
            from: EscrowStatus,
            to: EscrowStatus,
            at: DateTime<Utc>,
        ) -> Result<Option<EscrowAccount>, RepoError> {
            let mut state = self.state.lock().unwrap();
            match state.escrows.get_mut(&booking_id) {
                Some(escrow) if escrow.status == from => {
                    escrow.status = to;
                    if to == EscrowStatus::Released {
                        escrow.released_at = Some(at);
                    }
                    Ok(Some(escrow.clone()))
                }
                _ => Ok(None),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Scripted gateway
    // ─────────────────────────────────────────────────────────────────────────────

    /// Gateway whose answers are set by the test.
    ///
    /// Webhooks verify when the signature is `signed:` followed by the body.
    pub struct FakeGateway {
        initialize: Mutex<Result<ChargeSession, ProviderError>>,
        verify: Mutex<ProviderStatus>,
        transfer: Mutex<Result<TransferReceipt, ProviderError>>,
        delay: Option<Duration>,
        verify_calls: AtomicUsize,
    }

    impl FakeGateway {
        pub fn new() -> Self {
            Self {
                initialize: Mutex::new(Ok(ChargeSession {
                    authorization_url: "https://checkout.example.com/abc".into(),
                    access_code: Some("acc_123".into()),
                })),
                verify: Mutex::new(ProviderStatus::Success),
                transfer: Mutex::new(Ok(TransferReceipt {
                    provider_transfer_ref: "TRF_1".into(),
                    status: TransferStatus::Success,
                })),
                delay: None,
                verify_calls: AtomicUsize::new(0),
            }
        }

        fn failing_initialize(self, err: ProviderError) -> Self {
            *self.initialize.lock().unwrap() = Err(err);
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn set_verify(&self, status: ProviderStatus) {
            *self.verify.lock().unwrap() = status;
        }

        fn set_transfer(&self, result: Result<TransferReceipt, ProviderError>) {
            *self.transfer.lock().unwrap() = result;
        }

        fn verify_calls(&self) -> usize {
            self.verify_calls.load(Ordering::SeqCst)
        }
    }

    pub fn sign(payload: &str) -> String {
        format!("signed:{}", payload)
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Paystack
        }

        fn signature_header(&self) -> &'static str {
            "x-paystack-signature"
        }

        async fn initialize(&self, _request: &ChargeRequest) -> Result<ChargeSession, ProviderError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.initialize.lock().unwrap().clone()
        }

        async fn verify(&self, reference: &str) -> Result<ProviderOutcome, ProviderError> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            let status = *self.verify.lock().unwrap();
            Ok(ProviderOutcome {
                status,
                paid_at: (status == ProviderStatus::Success).then(Utc::now),
                provider_ref: Some(format!("psk_{}", reference)),
                raw: Metadata::new(),
            })
        }

        async fn initiate_transfer(
            &self,
            _instruction: &TransferInstruction,
        ) -> Result<TransferReceipt, ProviderError> {
            self.transfer.lock().unwrap().clone()
        }

        fn verify_webhook(&self, payload: &[u8], signature: &str) -> bool {
            std::str::from_utf8(payload).is_ok_and(|body| sign(body) == signature)
        }

        fn parse_event(&self, payload: &[u8]) -> Result<ProviderEvent, ProviderError> {
            let body: serde_json::Value = serde_json::from_slice(payload)
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            let reference = body["reference"].as_str().unwrap_or_default().to_string();
            Ok(match body["event"].as_str().unwrap_or_default() {
                "charge.success" => ProviderEvent::ChargeCompleted { reference },
                "transfer.success" => ProviderEvent::TransferSucceeded { reference },
                "transfer.failed" => ProviderEvent::TransferFailed { reference },
                other => ProviderEvent::Ignored {
                    event_type: other.to_string(),
                },
            })
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Fixtures
    // ─────────────────────────────────────────────────────────────────────────────

    fn service_with(
        gateway: Arc<FakeGateway>,
        config: SettlementConfig,
    ) -> SettlementService<MockRepo> {
        let registry = GatewayRegistry::new().with(gateway);
        SettlementService::new(MockRepo::default(), registry, config)
    }

    fn setup() -> (SettlementService<MockRepo>, Arc<FakeGateway>) {
        let gateway = Arc::new(FakeGateway::new());
        (
            service_with(gateway.clone(), SettlementConfig::default()),
            gateway,
        )
    }

    fn ngn(amount: i64) -> Money {
        Money::new(amount, Currency::NGN).unwrap()
    }

    fn payment_request(amount: i64) -> InitializePaymentRequest {
        InitializePaymentRequest {
            user_id: UserId::new(),
            vendor_id: None,
            booking_id: None,
            amount,
            currency: Currency::NGN,
            description: "Photography booking".into(),
            email: "ada@example.com".into(),
            provider: ProviderKind::Paystack,
            metadata: Metadata::new(),
            use_escrow: false,
            callback_url: "https://app.example.com/paid".into(),
        }
    }

    fn escrow_request(amount: i64) -> InitializePaymentRequest {
        InitializePaymentRequest {
            vendor_id: Some(UserId::new()),
            booking_id: Some(BookingId::new()),
            use_escrow: true,
            ..payment_request(amount)
        }
    }

    fn payout_request(vendor_id: UserId, amount: i64) -> PayoutRequest {
        PayoutRequest {
            vendor_id,
            amount,
            currency: Currency::NGN,
            bank: BankDetails {
                bank_code: "058".into(),
                account_number: "0123456789".into(),
                account_name: "Ada Vendor".into(),
            },
        }
    }

    /// Initializes an escrowed payment and confirms it with the provider.
    async fn funded_escrow(
        service: &SettlementService<MockRepo>,
        amount: i64,
    ) -> (EscrowAccount, Transaction) {
        let req = escrow_request(amount);
        let booking_id = req.booking_id.unwrap();
        let init = service.initialize_payment(req).await.unwrap();
        let funding = service.verify_payment(&init.reference).await.unwrap();
        let escrow = service.escrow_status(booking_id).await.unwrap();
        (escrow, funding)
    }

    async fn balance(service: &SettlementService<MockRepo>, user_id: UserId) -> i64 {
        service
            .get_or_create_wallet(user_id, Currency::NGN)
            .await
            .unwrap()
            .balance
            .amount()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Payments
    // ─────────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_initialize_payment_locks_fee_and_moves_to_processing() {
        let (service, _) = setup();

        let response = service
            .initialize_payment(payment_request(50000))
            .await
            .unwrap();

        assert!(response.reference.starts_with("VND-"));
        assert_eq!(response.authorization_url, "https://checkout.example.com/abc");
        assert_eq!(response.provider, ProviderKind::Paystack);

        let txn = service.get_transaction(response.transaction_id).await.unwrap();
        assert_eq!(txn.fee, 5000);
        assert_eq!(txn.net_amount, 45000);
        assert_eq!(txn.status, TransactionStatus::Processing);
        assert_eq!(txn.provider_data["access_code"], "acc_123");
    }

    #[tokio::test]
    async fn test_initialize_payment_validates_input() {
        let (service, _) = setup();

        let zero = service.initialize_payment(payment_request(0)).await;
        let no_email = service
            .initialize_payment(InitializePaymentRequest {
                email: "  ".into(),
                ..payment_request(1000)
            })
            .await;
        let internal = service
            .initialize_payment(InitializePaymentRequest {
                provider: ProviderKind::Internal,
                ..payment_request(1000)
            })
            .await;
        let unconfigured = service
            .initialize_payment(InitializePaymentRequest {
                provider: ProviderKind::Flutterwave,
                ..payment_request(1000)
            })
            .await;

        assert!(matches!(zero, Err(AppError::InvalidRequest(_))));
        assert!(matches!(no_email, Err(AppError::InvalidRequest(_))));
        assert!(matches!(internal, Err(AppError::InvalidRequest(_))));
        assert!(matches!(unconfigured, Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_rejected_initialization_marks_transaction_failed() {
        let gateway = Arc::new(
            FakeGateway::new().failing_initialize(ProviderError::Rejected("Invalid email".into())),
        );
        let service = service_with(gateway, SettlementConfig::default());
        let req = payment_request(50000);
        let user_id = req.user_id;

        let result = service.initialize_payment(req).await;

        assert!(matches!(result, Err(AppError::ProviderRejected(_))));
        let history = service
            .list_wallet_transactions(user_id, Default::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TransactionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout_is_unavailable_and_fails_transaction() {
        let gateway = Arc::new(FakeGateway::new().slow(Duration::from_secs(60)));
        let service = service_with(
            gateway,
            SettlementConfig::default().with_provider_timeout(Duration::from_secs(30)),
        );
        let req = payment_request(50000);
        let user_id = req.user_id;

        let result = service.initialize_payment(req).await;

        assert!(matches!(result, Err(AppError::ProviderUnavailable(_))));
        let history = service
            .list_wallet_transactions(user_id, Default::default())
            .await
            .unwrap();
        assert_eq!(history[0].status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_escrowed_payment_holds_net_amount() {
        let (service, _) = setup();
        let req = escrow_request(50000);
        let booking_id = req.booking_id.unwrap();
        let vendor_id = req.vendor_id.unwrap();

        let response = service.initialize_payment(req.clone()).await.unwrap();
        let escrow = service.escrow_status(booking_id).await.unwrap();

        assert_eq!(escrow.status, EscrowStatus::Held);
        assert_eq!(escrow.amount, 45000);
        assert_eq!(escrow.vendor_id, vendor_id);
        assert_eq!(escrow.transaction_id, response.transaction_id);

        let again = service.initialize_payment(req).await;
        assert!(matches!(again, Err(AppError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_escrow_needs_vendor_and_booking() {
        let (service, _) = setup();
        let req = InitializePaymentRequest {
            use_escrow: true,
            booking_id: Some(BookingId::new()),
            ..payment_request(50000)
        };
        let booking_id = req.booking_id.unwrap();

        service.initialize_payment(req).await.unwrap();

        assert!(matches!(
            service.escrow_status(booking_id).await,
            Err(AppError::EscrowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_payment_is_idempotent() {
        let (service, gateway) = setup();
        let req = payment_request(50000);
        let user_id = req.user_id;
        let init = service.initialize_payment(req).await.unwrap();

        let first = service.verify_payment(&init.reference).await.unwrap();
        let second = service.verify_payment(&init.reference).await.unwrap();

        assert_eq!(first.status, TransactionStatus::Success);
        assert_eq!(second.status, TransactionStatus::Success);
        assert_eq!(first.paid_at, second.paid_at);
        assert_eq!(second.provider_ref, Some(format!("psk_{}", init.reference)));
        assert_eq!(gateway.verify_calls(), 2);
        assert_eq!(balance(&service, user_id).await, 0);
    }

    #[tokio::test]
    async fn test_verify_pending_leaves_status() {
        let (service, gateway) = setup();
        gateway.set_verify(ProviderStatus::Pending);
        let init = service
            .initialize_payment(payment_request(1000))
            .await
            .unwrap();

        let txn = service.verify_payment(&init.reference).await.unwrap();

        assert_eq!(txn.status, TransactionStatus::Processing);
    }

    #[tokio::test]
    async fn test_late_failure_does_not_overwrite_success() {
        let (service, gateway) = setup();
        let init = service
            .initialize_payment(payment_request(1000))
            .await
            .unwrap();
        service.verify_payment(&init.reference).await.unwrap();

        gateway.set_verify(ProviderStatus::Failed);
        let txn = service.verify_payment(&init.reference).await.unwrap();

        assert_eq!(txn.status, TransactionStatus::Success);
    }

    #[tokio::test]
    async fn test_verify_unknown_reference() {
        let (service, _) = setup();
        let result = service.verify_payment("VND-missing").await;
        assert!(matches!(result, Err(AppError::TransactionNotFound(_))));
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Webhooks
    // ─────────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_charge_webhook_pulls_status_from_provider() {
        let (service, gateway) = setup();
        let init = service
            .initialize_payment(payment_request(1000))
            .await
            .unwrap();
        let body = format!(
            r#"{{"event":"charge.success","reference":"{}"}}"#,
            init.reference
        );

        let txn = service
            .handle_webhook("paystack", body.as_bytes(), &sign(&body))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(txn.status, TransactionStatus::Success);
        assert_eq!(gateway.verify_calls(), 1);
    }

    #[tokio::test]
    async fn test_tampered_webhook_is_rejected() {
        let (service, gateway) = setup();
        let init = service
            .initialize_payment(payment_request(1000))
            .await
            .unwrap();
        let body = format!(
            r#"{{"event":"charge.success","reference":"{}"}}"#,
            init.reference
        );
        let signature = sign(&body);
        let tampered = body.replacen("charge", "charga", 1);

        let result = service
            .handle_webhook("paystack", tampered.as_bytes(), &signature)
            .await;

        assert!(matches!(result, Err(AppError::InvalidSignature)));
        assert_eq!(gateway.verify_calls(), 0);
        let txn = service.get_transaction(init.transaction_id).await.unwrap();
        assert_eq!(txn.status, TransactionStatus::Processing);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_provider_or_reference() {
        let (service, _) = setup();
        let body = r#"{"event":"transfer.success","reference":"PAY-nope"}"#;

        let unknown_provider = service.handle_webhook("stripe", body.as_bytes(), "x").await;
        let unknown_reference = service
            .handle_webhook("paystack", body.as_bytes(), &sign(body))
            .await;

        assert!(matches!(unknown_provider, Err(AppError::InvalidRequest(_))));
        assert!(matches!(unknown_reference, Ok(None)));
    }

    #[tokio::test]
    async fn test_malformed_webhook_is_a_bad_request() {
        let (service, gateway) = setup();
        let body = "{not json";

        let result = service
            .handle_webhook("paystack", body.as_bytes(), &sign(body))
            .await;

        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
        assert_eq!(gateway.verify_calls(), 0);
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Payouts
    // ─────────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_payout_over_balance_is_refused() {
        let (service, _) = setup();
        let vendor_id = UserId::new();
        service.repo().credit(vendor_id, ngn(15000)).await.unwrap();

        let result = service.request_payout(payout_request(vendor_id, 20000)).await;

        assert!(matches!(
            result,
            Err(AppError::InsufficientBalance {
                available: 15000,
                requested: 20000
            })
        ));
        assert_eq!(balance(&service, vendor_id).await, 15000);
        let payouts = service
            .list_payouts(vendor_id, Default::default())
            .await
            .unwrap();
        assert!(payouts.is_empty());
    }

    #[tokio::test]
    async fn test_payout_settles_in_background() {
        let (service, _) = setup();
        let vendor_id = UserId::new();
        service.repo().credit(vendor_id, ngn(50000)).await.unwrap();

        let ticket = service
            .request_payout(payout_request(vendor_id, 20000))
            .await
            .unwrap();

        assert_eq!(ticket.transaction.status, TransactionStatus::Processing);
        assert!(ticket.transaction.reference.starts_with("PAY-"));
        assert_eq!(ticket.balance, 30000);

        let settled = ticket.wait().await.unwrap();
        assert_eq!(settled.status, TransactionStatus::Success);
        assert_eq!(settled.provider_ref.as_deref(), Some("TRF_1"));
        assert!(settled.paid_at.is_some());
        assert_eq!(balance(&service, vendor_id).await, 30000);
    }

    #[tokio::test]
    async fn test_failed_transfer_credits_back_exactly_once() {
        let (service, gateway) = setup();
        gateway.set_transfer(Err(ProviderError::Rejected("Invalid account".into())));
        let vendor_id = UserId::new();
        service.repo().credit(vendor_id, ngn(50000)).await.unwrap();

        let ticket = service
            .request_payout(payout_request(vendor_id, 20000))
            .await
            .unwrap();
        let reference = ticket.transaction.reference.clone();
        let failed = ticket.wait().await.unwrap();

        assert_eq!(failed.status, TransactionStatus::Failed);
        assert_eq!(balance(&service, vendor_id).await, 50000);

        let body = format!(r#"{{"event":"transfer.failed","reference":"{}"}}"#, reference);
        service
            .handle_webhook("paystack", body.as_bytes(), &sign(&body))
            .await
            .unwrap();

        assert_eq!(balance(&service, vendor_id).await, 50000);
    }

    #[tokio::test]
    async fn test_pending_transfer_resolves_by_webhook() {
        let (service, gateway) = setup();
        gateway.set_transfer(Ok(TransferReceipt {
            provider_transfer_ref: "TRF_pending".into(),
            status: TransferStatus::Pending,
        }));
        let vendor_id = UserId::new();
        service.repo().credit(vendor_id, ngn(50000)).await.unwrap();

        let ticket = service
            .request_payout(payout_request(vendor_id, 20000))
            .await
            .unwrap();
        let in_flight = ticket.wait().await.unwrap();
        assert_eq!(in_flight.status, TransactionStatus::Processing);
        assert_eq!(in_flight.provider_ref.as_deref(), Some("TRF_pending"));

        let body = format!(
            r#"{{"event":"transfer.success","reference":"{}"}}"#,
            in_flight.reference
        );
        let settled = service
            .handle_webhook("paystack", body.as_bytes(), &sign(&body))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(settled.status, TransactionStatus::Success);
        assert_eq!(balance(&service, vendor_id).await, 30000);
    }

    #[tokio::test]
    async fn test_unanswered_transfer_keeps_funds_held() {
        let (service, gateway) = setup();
        gateway.set_transfer(Err(ProviderError::Unavailable("connection reset".into())));
        let vendor_id = UserId::new();
        service.repo().credit(vendor_id, ngn(50000)).await.unwrap();

        let ticket = service
            .request_payout(payout_request(vendor_id, 20000))
            .await
            .unwrap();
        let payout = ticket.wait().await.unwrap();

        assert_eq!(payout.status, TransactionStatus::Processing);
        assert!(payout.provider_data.contains_key("transfer_error"));
        assert_eq!(balance(&service, vendor_id).await, 30000);
    }

    #[tokio::test]
    async fn test_payout_lookup_checks_owner() {
        let (service, _) = setup();
        let vendor_id = UserId::new();
        service.repo().credit(vendor_id, ngn(50000)).await.unwrap();
        let ticket = service
            .request_payout(payout_request(vendor_id, 1000))
            .await
            .unwrap();
        let payout_id = ticket.transaction.id;

        let own = service.get_payout(vendor_id, payout_id).await;
        let other = service.get_payout(UserId::new(), payout_id).await;

        assert!(own.is_ok());
        assert!(matches!(other, Err(AppError::TransactionNotFound(_))));
    }

    #[tokio::test]
    async fn test_payout_rejects_missing_bank_details() {
        let (service, _) = setup();
        let mut req = payout_request(UserId::new(), 1000);
        req.bank.account_number = String::new();

        let result = service.request_payout(req).await;

        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Escrow
    // ─────────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_lost_escrow_race_fails_the_payment() {
        let gateway = Arc::new(FakeGateway::new().slow(Duration::from_millis(20)));
        let service = service_with(gateway, SettlementConfig::default());
        let req = escrow_request(50000);
        let user_id = req.user_id;

        let (first, second) = tokio::join!(
            service.initialize_payment(req.clone()),
            service.initialize_payment(req)
        );

        let (won, lost) = match (first, second) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            other => panic!("expected exactly one escrow, got {:?}", other),
        };
        assert!(matches!(lost, AppError::InvalidState(_)));

        let history = service
            .list_wallet_transactions(user_id, Default::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        for txn in history {
            let expected = if txn.id == won.transaction_id {
                TransactionStatus::Processing
            } else {
                TransactionStatus::Failed
            };
            assert_eq!(txn.status, expected);
        }
    }

    #[tokio::test]
    async fn test_release_credits_vendor_once() {
        let (service, _) = setup();
        let (escrow, _) = funded_escrow(&service, 50000).await;
        assert_eq!(escrow.amount, 45000);

        let released = service.release_escrow(escrow.booking_id).await.unwrap();

        assert_eq!(released.status, EscrowStatus::Released);
        assert!(released.released_at.is_some());
        assert_eq!(balance(&service, escrow.vendor_id).await, 45000);

        let again = service.release_escrow(escrow.booking_id).await;
        assert!(matches!(again, Err(AppError::InvalidState(_))));
        assert_eq!(balance(&service, escrow.vendor_id).await, 45000);
    }

    #[tokio::test]
    async fn test_refund_credits_customer_and_records_reversal() {
        let gateway = Arc::new(FakeGateway::new());
        let service = service_with(gateway, SettlementConfig::default().with_fee_bps(0));
        let (escrow, funding) = funded_escrow(&service, 30000).await;

        let refunded = service
            .refund_escrow(escrow.booking_id, "customer cancelled")
            .await
            .unwrap();

        assert_eq!(refunded.status, EscrowStatus::Refunded);
        assert_eq!(balance(&service, escrow.customer_id).await, 30000);
        assert_eq!(balance(&service, escrow.vendor_id).await, 0);

        let history = service
            .list_wallet_transactions(escrow.customer_id, Default::default())
            .await
            .unwrap();
        let refund = history
            .iter()
            .find(|t| t.kind == TransactionKind::Refund)
            .unwrap();
        assert_eq!(refund.amount, 30000);
        assert_eq!(refund.description, "Refund: customer cancelled");
        assert_eq!(
            refund.metadata["original_transaction_id"],
            funding.id.to_string()
        );

        let funding = service.get_transaction(funding.id).await.unwrap();
        assert_eq!(funding.status, TransactionStatus::Refunded);
    }

    #[tokio::test]
    async fn test_release_and_refund_are_exclusive() {
        let (service, _) = setup();
        let (escrow, _) = funded_escrow(&service, 50000).await;

        service
            .refund_escrow(escrow.booking_id, "no show")
            .await
            .unwrap();
        let release = service.release_escrow(escrow.booking_id).await;

        assert!(matches!(release, Err(AppError::InvalidState(_))));
        assert_eq!(balance(&service, escrow.vendor_id).await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_release_credits_once() {
        let (service, _) = setup();
        let service = Arc::new(service);
        let (escrow, _) = funded_escrow(&service, 50000).await;

        let mut handles = Vec::new();
        for _ in 0..2 {
            let service = service.clone();
            let booking_id = escrow.booking_id;
            handles.push(tokio::spawn(async move {
                service.release_escrow(booking_id).await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 1);
        assert_eq!(balance(&service, escrow.vendor_id).await, 45000);
    }

    #[tokio::test]
    async fn test_release_requires_confirmed_payment() {
        let (service, _) = setup();
        let req = escrow_request(50000);
        let booking_id = req.booking_id.unwrap();
        service.initialize_payment(req).await.unwrap();

        let result = service.release_escrow(booking_id).await;

        assert!(matches!(result, Err(AppError::InvalidState(_))));
        let escrow = service.escrow_status(booking_id).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Held);
    }

    #[tokio::test]
    async fn test_release_finishes_after_lost_status_flip() {
        let (service, _) = setup();
        let (escrow, _) = funded_escrow(&service, 50000).await;

        // The credit landed but the process died before the status change.
        let mut credit = Transaction::new(
            TransactionKind::EscrowRelease,
            escrow.vendor_id,
            ngn(escrow.amount),
            0,
            ProviderKind::Internal,
            escrow.release_reference(),
        )
        .unwrap()
        .with_status(TransactionStatus::Success);
        credit.booking_id = Some(escrow.booking_id);
        service.repo().credit_with_record(&credit).await.unwrap();

        let released = service.release_escrow(escrow.booking_id).await.unwrap();

        assert_eq!(released.status, EscrowStatus::Released);
        assert_eq!(balance(&service, escrow.vendor_id).await, 45000);
    }

    /// Puts the refund credit on the ledger as a crashed refund would have.
    async fn apply_refund_credit(service: &SettlementService<MockRepo>, escrow: &EscrowAccount) {
        let mut credit = Transaction::new(
            TransactionKind::Refund,
            escrow.customer_id,
            ngn(escrow.amount),
            0,
            ProviderKind::Internal,
            escrow.refund_reference(),
        )
        .unwrap()
        .with_status(TransactionStatus::Success);
        credit.booking_id = Some(escrow.booking_id);
        service.repo().credit_with_record(&credit).await.unwrap();
    }

    #[tokio::test]
    async fn test_refund_finishes_after_lost_funding_flip() {
        let (service, _) = setup();
        let (escrow, funding) = funded_escrow(&service, 50000).await;
        apply_refund_credit(&service, &escrow).await;

        let refunded = service
            .refund_escrow(escrow.booking_id, "customer cancelled")
            .await
            .unwrap();

        assert_eq!(refunded.status, EscrowStatus::Refunded);
        assert_eq!(balance(&service, escrow.customer_id).await, 45000);
        let funding = service.get_transaction(funding.id).await.unwrap();
        assert_eq!(funding.status, TransactionStatus::Refunded);
    }

    #[tokio::test]
    async fn test_refund_finishes_after_lost_status_flip() {
        let (service, _) = setup();
        let (escrow, funding) = funded_escrow(&service, 50000).await;
        apply_refund_credit(&service, &escrow).await;

        // The payment was already marked refunded; only the escrow flip was lost.
        let mut funding = service.get_transaction(funding.id).await.unwrap();
        funding.advance(TransactionStatus::Refunded).unwrap();
        service.repo().record_transaction(&funding).await.unwrap();

        let refunded = service
            .refund_escrow(escrow.booking_id, "customer cancelled")
            .await
            .unwrap();

        assert_eq!(refunded.status, EscrowStatus::Refunded);
        assert_eq!(balance(&service, escrow.customer_id).await, 45000);

        let release = service.release_escrow(escrow.booking_id).await;
        assert!(matches!(release, Err(AppError::InvalidState(_))));
        assert_eq!(balance(&service, escrow.vendor_id).await, 0);
    }

    #[tokio::test]
    async fn test_refunded_payment_without_refund_credit_is_refused() {
        let (service, _) = setup();
        let (escrow, funding) = funded_escrow(&service, 50000).await;
        let mut funding = service.get_transaction(funding.id).await.unwrap();
        funding.advance(TransactionStatus::Refunded).unwrap();
        service.repo().record_transaction(&funding).await.unwrap();

        let result = service.refund_escrow(escrow.booking_id, "no show").await;

        assert!(matches!(result, Err(AppError::InvalidState(_))));
        assert_eq!(balance(&service, escrow.customer_id).await, 0);
    }

    #[tokio::test]
    async fn test_missing_escrow_and_empty_reason() {
        let (service, _) = setup();
        let missing = service.release_escrow(BookingId::new()).await;
        assert!(matches!(missing, Err(AppError::EscrowNotFound(_))));

        let (escrow, _) = funded_escrow(&service, 50000).await;
        let no_reason = service.refund_escrow(escrow.booking_id, " ").await;
        assert!(matches!(no_reason, Err(AppError::InvalidRequest(_))));
    }
}
