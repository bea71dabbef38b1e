//! Flutterwave adapter.
//!
//! Flutterwave takes amounts in major units and authenticates webhooks with a
//! static `verif-hash` header rather than a body signature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::instrument;

use settlement_types::{
    ChargeRequest, ChargeSession, Metadata, PaymentGateway, ProviderError, ProviderEvent,
    ProviderKind, ProviderOutcome, ProviderStatus, TransferInstruction, TransferReceipt,
    TransferStatus,
};

use crate::GatewayConfig;
use crate::http::{self, Reply, id_string, required_str};
use crate::security;

pub const SIGNATURE_HEADER: &str = "verif-hash";

pub struct FlutterwaveGateway {
    client: Client,
    base_url: String,
    secret_key: String,
    webhook_hash: String,
}

impl FlutterwaveGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: http::build_client(config.timeout),
            base_url: config.base_url,
            secret_key: config.secret_key,
            webhook_hash: config.webhook_secret.unwrap_or_default(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Reply, ProviderError> {
        http::send(
            self.client
                .post(http::join(&self.base_url, path))
                .bearer_auth(&self.secret_key)
                .json(&body),
        )
        .await
    }
}

fn accepted_data(reply: &Reply) -> Result<&Value, ProviderError> {
    if reply.body.get("status").and_then(Value::as_str) != Some("success") {
        return Err(ProviderError::Rejected(reply.message()));
    }
    reply
        .data()
        .ok_or_else(|| ProviderError::InvalidResponse("missing `data`".into()))
}

pub fn charge_status(status: &str) -> ProviderStatus {
    match status.to_ascii_lowercase().as_str() {
        "successful" => ProviderStatus::Success,
        "failed" | "cancelled" => ProviderStatus::Failed,
        _ => ProviderStatus::Pending,
    }
}

pub fn transfer_status(status: &str) -> TransferStatus {
    match status.to_ascii_uppercase().as_str() {
        "SUCCESSFUL" => TransferStatus::Success,
        "FAILED" => TransferStatus::Failed,
        _ => TransferStatus::Pending,
    }
}

fn is_not_found(reply: &Reply) -> bool {
    reply.status == StatusCode::NOT_FOUND
        || (reply.status.is_client_error()
            && reply.message().to_ascii_lowercase().contains("no transaction"))
}

fn verify_outcome(reply: Reply) -> Result<ProviderOutcome, ProviderError> {
    if is_not_found(&reply) {
        return Ok(ProviderOutcome::not_found());
    }
    let reply = reply.error_for_status()?;
    let data = accepted_data(&reply)?;

    let status = charge_status(required_str(data, "status")?);
    let paid_at = match status {
        ProviderStatus::Success => data
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    };

    Ok(ProviderOutcome {
        status,
        paid_at,
        provider_ref: id_string(data.get("flw_ref")).or_else(|| id_string(data.get("id"))),
        raw: match data {
            Value::Object(map) => map.clone(),
            _ => Metadata::new(),
        },
    })
}

/// Parses a Flutterwave webhook body.
pub fn parse_webhook(payload: &[u8]) -> Result<ProviderEvent, ProviderError> {
    let body: Value = serde_json::from_slice(payload)
        .map_err(|e| ProviderError::InvalidResponse(format!("webhook body: {}", e)))?;
    let event = required_str(&body, "event")?;
    let data = body.get("data").unwrap_or(&Value::Null);

    Ok(match event {
        "charge.completed" => ProviderEvent::ChargeCompleted {
            reference: required_str(data, "tx_ref")?.to_string(),
        },
        "transfer.completed" => {
            let reference = required_str(data, "reference")?.to_string();
            match transfer_status(data.get("status").and_then(Value::as_str).unwrap_or("")) {
                TransferStatus::Success => ProviderEvent::TransferSucceeded { reference },
                TransferStatus::Failed => ProviderEvent::TransferFailed { reference },
                TransferStatus::Pending => ProviderEvent::Ignored {
                    event_type: event.to_string(),
                },
            }
        }
        other => ProviderEvent::Ignored {
            event_type: other.to_string(),
        },
    })
}

#[async_trait]
impl PaymentGateway for FlutterwaveGateway {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Flutterwave
    }

    fn signature_header(&self) -> &'static str {
        SIGNATURE_HEADER
    }

    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn initialize(&self, request: &ChargeRequest) -> Result<ChargeSession, ProviderError> {
        let currency = request.amount.currency();
        let reply = self
            .post(
                "/v3/payments",
                json!({
                    "tx_ref": request.reference,
                    "amount": currency.format_major(request.amount.amount()),
                    "currency": currency.code(),
                    "redirect_url": request.callback_url,
                    "customer": { "email": request.email },
                    "meta": request.metadata,
                }),
            )
            .await?
            .error_for_status()?;

        let data = accepted_data(&reply)?;
        Ok(ChargeSession {
            authorization_url: required_str(data, "link")?.to_string(),
            access_code: None,
        })
    }

    #[instrument(skip(self))]
    async fn verify(&self, reference: &str) -> Result<ProviderOutcome, ProviderError> {
        let reply = http::send(
            self.client
                .get(http::join(&self.base_url, "/v3/transactions/verify_by_reference"))
                .query(&[("tx_ref", reference)])
                .bearer_auth(&self.secret_key),
        )
        .await?;
        verify_outcome(reply)
    }

    #[instrument(skip(self, instruction), fields(reference = %instruction.reference))]
    async fn initiate_transfer(
        &self,
        instruction: &TransferInstruction,
    ) -> Result<TransferReceipt, ProviderError> {
        let currency = instruction.amount.currency();
        let reply = self
            .post(
                "/v3/transfers",
                json!({
                    "account_bank": instruction.recipient.bank_code,
                    "account_number": instruction.recipient.account_number,
                    "beneficiary_name": instruction.recipient.account_name,
                    "amount": currency.format_major(instruction.amount.amount()),
                    "currency": currency.code(),
                    "narration": instruction.reason,
                    "reference": instruction.reference,
                }),
            )
            .await?
            .error_for_status()?;

        let data = accepted_data(&reply)?;
        Ok(TransferReceipt {
            provider_transfer_ref: id_string(data.get("id")).ok_or_else(|| {
                ProviderError::InvalidResponse("missing field `id`".into())
            })?,
            status: transfer_status(data.get("status").and_then(Value::as_str).unwrap_or("")),
        })
    }

    fn verify_webhook(&self, _payload: &[u8], signature: &str) -> bool {
        !self.webhook_hash.is_empty()
            && security::constant_time_eq(&self.webhook_hash, signature)
    }

    fn parse_event(&self, payload: &[u8]) -> Result<ProviderEvent, ProviderError> {
        parse_webhook(payload)
    }
}
