//! HTTP request handlers.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use settlement_types::{
    AppError, BookingId, Currency, EscrowStore, InitializePaymentRequest, LedgerStore, Page,
    PayoutRequest, PayoutResponse, RefundEscrowRequest, TransactionId, UserId,
};

use crate::SettlementService;

/// Application state shared across handlers.
pub struct AppState<R: LedgerStore + EscrowStore> {
    pub service: Arc<SettlementService<R>>,
}

/// Wrapper to implement IntoResponse for AppError (orphan rule workaround).
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

/// Seconds a client should wait before retrying a provider outage.
const RETRY_AFTER_SECS: &str = "5";

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retryable = self.0.is_retryable();
        let (status, message) = match &self.0 {
            AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            e @ AppError::InsufficientBalance { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            AppError::InvalidState(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, "invalid signature".to_string())
            }
            e @ (AppError::TransactionNotFound(_) | AppError::EscrowNotFound(_)) => {
                (StatusCode::NOT_FOUND, e.to_string())
            }
            AppError::ProviderUnavailable(detail) => {
                tracing::warn!(%detail, "provider unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "payment provider unavailable, try again".to_string(),
                )
            }
            AppError::ProviderRejected(detail) => {
                tracing::warn!(%detail, "provider rejected request");
                (
                    StatusCode::BAD_GATEWAY,
                    "payment was declined by the provider".to_string(),
                )
            }
            AppError::Internal(detail) => {
                tracing::error!(%detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": message,
            "code": status.as_u16()
        });

        let mut response = (status, Json(body)).into_response();
        if retryable {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

fn parse_path<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(AppError::InvalidRequest(format!("Invalid {}", what))))
}

/// Health check endpoint.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Payments
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state, req), fields(user_id = %req.user_id, provider = %req.provider))]
pub async fn initialize_payment<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Json(req): Json<InitializePaymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.service.initialize_payment(req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[tracing::instrument(skip(state))]
pub async fn verify_payment<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let txn = state.service.verify_payment(&reference).await?;
    Ok(Json(txn))
}

#[tracing::instrument(skip(state))]
pub async fn get_transaction<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: TransactionId = parse_path(&id, "transaction ID")?;
    let txn = state.service.get_transaction(id).await?;
    Ok(Json(txn))
}

// ─────────────────────────────────────────────────────────────────────────────
// Wallets
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state))]
pub async fn get_wallet<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path((user_id, currency)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: UserId = parse_path(&user_id, "user ID")?;
    let currency: Currency = parse_path(&currency, "currency")?;
    let wallet = state.service.get_or_create_wallet(user_id, currency).await?;
    Ok(Json(wallet))
}

#[tracing::instrument(skip(state))]
pub async fn list_wallet_transactions<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path(user_id): Path<String>,
    Query(page): Query<Page>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: UserId = parse_path(&user_id, "user ID")?;
    let transactions = state.service.list_wallet_transactions(user_id, page).await?;
    Ok(Json(transactions))
}

// ─────────────────────────────────────────────────────────────────────────────
// Payouts
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state, req), fields(vendor_id = %req.vendor_id, amount = req.amount))]
pub async fn request_payout<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Json(req): Json<PayoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state.service.request_payout(req).await?;
    let body = PayoutResponse {
        transaction: ticket.transaction.clone(),
        balance: ticket.balance,
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

#[tracing::instrument(skip(state))]
pub async fn list_payouts<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path(vendor_id): Path<String>,
    Query(page): Query<Page>,
) -> Result<impl IntoResponse, ApiError> {
    let vendor_id: UserId = parse_path(&vendor_id, "vendor ID")?;
    let payouts = state.service.list_payouts(vendor_id, page).await?;
    Ok(Json(payouts))
}

#[tracing::instrument(skip(state))]
pub async fn get_payout<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path((vendor_id, payout_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let vendor_id: UserId = parse_path(&vendor_id, "vendor ID")?;
    let payout_id: TransactionId = parse_path(&payout_id, "payout ID")?;
    let payout = state.service.get_payout(vendor_id, payout_id).await?;
    Ok(Json(payout))
}

// ─────────────────────────────────────────────────────────────────────────────
// Escrow
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state))]
pub async fn escrow_status<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path(booking_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let booking_id: BookingId = parse_path(&booking_id, "booking ID")?;
    let escrow = state.service.escrow_status(booking_id).await?;
    Ok(Json(escrow))
}

#[tracing::instrument(skip(state))]
pub async fn release_escrow<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path(booking_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let booking_id: BookingId = parse_path(&booking_id, "booking ID")?;
    let escrow = state.service.release_escrow(booking_id).await?;
    Ok(Json(escrow))
}

#[tracing::instrument(skip(state, req))]
pub async fn refund_escrow<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path(booking_id): Path<String>,
    Json(req): Json<RefundEscrowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let booking_id: BookingId = parse_path(&booking_id, "booking ID")?;
    let escrow = state.service.refund_escrow(booking_id, &req.reason).await?;
    Ok(Json(escrow))
}

// ─────────────────────────────────────────────────────────────────────────────
// Webhooks
// ─────────────────────────────────────────────────────────────────────────────

/// Receives a provider webhook. The body is taken raw so the signature is
/// checked over the exact bytes sent.
#[tracing::instrument(skip(state, headers, body))]
pub async fn webhook<R: LedgerStore + EscrowStore>(
    State(state): State<Arc<AppState<R>>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let header = state.service.signature_header(&provider)?;
    let signature = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let affected = state
        .service
        .handle_webhook(&provider, &body, signature)
        .await?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "transaction": affected.map(|t| serde_json::json!({
            "reference": t.reference,
            "status": t.status,
        })),
    })))
}
