//! Paystack adapter.
//!
//! Amounts go over the wire in minor units. Webhooks are signed with
//! HMAC-SHA512 of the raw body keyed by the secret key.

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

pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

pub struct PaystackGateway {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl PaystackGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: http::build_client(config.timeout),
            base_url: config.base_url,
            secret_key: config.secret_key,
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

    /// Registers the bank account as a transfer recipient.
    async fn create_recipient(
        &self,
        instruction: &TransferInstruction,
    ) -> Result<String, ProviderError> {
        let reply = self
            .post(
                "/transferrecipient",
                json!({
                    "type": "nuban",
                    "name": instruction.recipient.account_name,
                    "account_number": instruction.recipient.account_number,
                    "bank_code": instruction.recipient.bank_code,
                    "currency": instruction.amount.currency().code(),
                }),
            )
            .await?
            .error_for_status()?;
        let data = accepted_data(&reply)?;
        Ok(required_str(data, "recipient_code")?.to_string())
    }
}

/// Returns `data` from a successful reply, treating `"status": false` as a
/// rejection.
fn accepted_data(reply: &Reply) -> Result<&Value, ProviderError> {
    if reply.body.get("status").and_then(Value::as_bool) != Some(true) {
        return Err(ProviderError::Rejected(reply.message()));
    }
    reply
        .data()
        .ok_or_else(|| ProviderError::InvalidResponse("missing `data`".into()))
}

pub fn charge_status(status: &str) -> ProviderStatus {
    match status {
        "success" => ProviderStatus::Success,
        "failed" | "reversed" => ProviderStatus::Failed,
        _ => ProviderStatus::Pending,
    }
}

pub fn transfer_status(status: &str) -> TransferStatus {
    match status {
        "success" => TransferStatus::Success,
        "failed" | "reversed" | "rejected" => TransferStatus::Failed,
        _ => TransferStatus::Pending,
    }
}

fn is_not_found(reply: &Reply) -> bool {
    reply.status == StatusCode::NOT_FOUND
        || (reply.status.is_client_error()
            && reply.message().to_ascii_lowercase().contains("not found"))
}

/// Maps a `/transaction/verify` reply to an outcome.
fn verify_outcome(reply: Reply) -> Result<ProviderOutcome, ProviderError> {
    if is_not_found(&reply) {
        return Ok(ProviderOutcome::not_found());
    }
    let reply = reply.error_for_status()?;
    let data = accepted_data(&reply)?;

    let status = charge_status(required_str(data, "status")?);
    let paid_at = data
        .get("paid_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(ProviderOutcome {
        status,
        paid_at,
        provider_ref: id_string(data.get("id")),
        raw: match data {
            Value::Object(map) => map.clone(),
            _ => Metadata::new(),
        },
    })
}

/// Parses a Paystack webhook body.
pub fn parse_webhook(payload: &[u8]) -> Result<ProviderEvent, ProviderError> {
    let body: Value = serde_json::from_slice(payload)
        .map_err(|e| ProviderError::InvalidResponse(format!("webhook body: {}", e)))?;
    let event = required_str(&body, "event")?;
    let data = body.get("data").unwrap_or(&Value::Null);

    let reference = || required_str(data, "reference").map(str::to_string);
    Ok(match event {
        "charge.success" => ProviderEvent::ChargeCompleted {
            reference: reference()?,
        },
        "transfer.success" => ProviderEvent::TransferSucceeded {
            reference: reference()?,
        },
        "transfer.failed" | "transfer.reversed" => ProviderEvent::TransferFailed {
            reference: reference()?,
        },
        other => ProviderEvent::Ignored {
            event_type: other.to_string(),
        },
    })
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Paystack
    }

    fn signature_header(&self) -> &'static str {
        SIGNATURE_HEADER
    }

    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn initialize(&self, request: &ChargeRequest) -> Result<ChargeSession, ProviderError> {
        let reply = self
            .post(
                "/transaction/initialize",
                json!({
                    "email": request.email,
                    "amount": request.amount.amount(),
                    "reference": request.reference,
                    "currency": request.amount.currency().code(),
                    "callback_url": request.callback_url,
                    "metadata": request.metadata,
                }),
            )
            .await?
            .error_for_status()?;

        let data = accepted_data(&reply)?;
        Ok(ChargeSession {
            authorization_url: required_str(data, "authorization_url")?.to_string(),
            access_code: data
                .get("access_code")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    #[instrument(skip(self))]
    async fn verify(&self, reference: &str) -> Result<ProviderOutcome, ProviderError> {
        let reply = http::send(
            self.client
                .get(http::join(
                    &self.base_url,
                    &format!("/transaction/verify/{}", reference),
                ))
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
        let recipient = self.create_recipient(instruction).await?;

        let reply = self
            .post(
                "/transfer",
                json!({
                    "source": "balance",
                    "amount": instruction.amount.amount(),
                    "recipient": recipient,
                    "reason": instruction.reason,
                    "reference": instruction.reference,
                }),
            )
            .await?
            .error_for_status()?;

        let data = accepted_data(&reply)?;
        Ok(TransferReceipt {
            provider_transfer_ref: required_str(data, "transfer_code")?.to_string(),
            status: transfer_status(data.get("status").and_then(Value::as_str).unwrap_or("")),
        })
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> bool {
        security::verify_signature(payload, signature, &self.secret_key)
    }

    fn parse_event(&self, payload: &[u8]) -> Result<ProviderEvent, ProviderError> {
        parse_webhook(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use settlement_types::{BankDetails, Currency, Money};

    fn gateway(base_url: String) -> PaystackGateway {
        PaystackGateway::new(GatewayConfig::new(base_url, "sk_test_abc"))
    }

    fn charge(reference: &str) -> ChargeRequest {
        ChargeRequest {
            reference: reference.to_string(),
            amount: Money::new(50000, Currency::NGN).unwrap(),
            email: "ada@example.com".to_string(),
            callback_url: "https://app.example.com/paid".to_string(),
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_initialize_returns_session() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/transaction/initialize")
            .match_header("authorization", "Bearer sk_test_abc")
            .match_body(mockito::Matcher::PartialJson(json!({
                "amount": 50000,
                "reference": "VND-1",
                "currency": "NGN"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"status":true,"message":"Authorization URL created","data":{
                    "authorization_url":"https://checkout.paystack.com/abc",
                    "access_code":"abc","reference":"VND-1"}}"#,
            )
            .create_async()
            .await;

        let session = gateway(server.url()).initialize(&charge("VND-1")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(session.authorization_url, "https://checkout.paystack.com/abc");
        assert_eq!(session.access_code.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_initialize_rejection_carries_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/transaction/initialize")
            .with_status(400)
            .with_body(r#"{"status":false,"message":"Invalid email address passed"}"#)
            .create_async()
            .await;

        let err = gateway(server.url())
            .initialize(&charge("VND-2"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Rejected(ref m) if m.contains("Invalid email")));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/transaction/initialize")
            .with_status(502)
            .with_body("<html>bad gateway</html>")
            .create_async()
            .await;

        let err = gateway(server.url())
            .initialize(&charge("VND-3"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_unavailable() {
        let err = gateway("http://127.0.0.1:1".to_string())
            .verify("VND-4")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_verify_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/transaction/verify/VND-5")
            .with_status(200)
            .with_body(
                r#"{"status":true,"message":"Verification successful","data":{
                    "id":4099260516,"status":"success","reference":"VND-5",
                    "amount":50000,"paid_at":"2024-05-01T10:00:00.000Z","currency":"NGN"}}"#,
            )
            .create_async()
            .await;

        let outcome = gateway(server.url()).verify("VND-5").await.unwrap();

        assert_eq!(outcome.status, ProviderStatus::Success);
        assert_eq!(outcome.provider_ref.as_deref(), Some("4099260516"));
        assert!(outcome.paid_at.is_some());
        assert_eq!(outcome.raw.get("amount"), Some(&json!(50000)));
    }

    #[tokio::test]
    async fn test_verify_unknown_reference_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/transaction/verify/VND-missing")
            .with_status(400)
            .with_body(r#"{"status":false,"message":"Transaction reference not found"}"#)
            .create_async()
            .await;

        let outcome = gateway(server.url()).verify("VND-missing").await.unwrap();

        assert_eq!(outcome.status, ProviderStatus::NotFound);
    }

    #[tokio::test]
    async fn test_transfer_creates_recipient_then_transfers() {
        let mut server = mockito::Server::new_async().await;
        let recipient = server
            .mock("POST", "/transferrecipient")
            .match_body(mockito::Matcher::PartialJson(json!({
                "type": "nuban",
                "bank_code": "058",
                "account_number": "0123456789"
            })))
            .with_status(201)
            .with_body(r#"{"status":true,"message":"ok","data":{"recipient_code":"RCP_1"}}"#)
            .create_async()
            .await;
        let transfer = server
            .mock("POST", "/transfer")
            .match_body(mockito::Matcher::PartialJson(json!({
                "recipient": "RCP_1",
                "amount": 20000,
                "reference": "PAY-1"
            })))
            .with_status(200)
            .with_body(
                r#"{"status":true,"message":"Transfer has been queued","data":{
                    "transfer_code":"TRF_1","status":"pending"}}"#,
            )
            .create_async()
            .await;

        let receipt = gateway(server.url())
            .initiate_transfer(&TransferInstruction {
                reference: "PAY-1".into(),
                amount: Money::new(20000, Currency::NGN).unwrap(),
                recipient: BankDetails {
                    bank_code: "058".into(),
                    account_number: "0123456789".into(),
                    account_name: "Ada Vendor".into(),
                },
                reason: "Vendor payout".into(),
            })
            .await
            .unwrap();

        recipient.assert_async().await;
        transfer.assert_async().await;
        assert_eq!(receipt.provider_transfer_ref, "TRF_1");
        assert_eq!(receipt.status, TransferStatus::Pending);
    }

    #[test]
    fn test_webhook_signature_and_parsing() {
        let gw = gateway("http://unused".into());
        let body = br#"{"event":"transfer.reversed","data":{"reference":"PAY-9"}}"#;
        let signature = security::sign_payload(body, "sk_test_abc").unwrap();

        assert!(gw.verify_webhook(body, &signature));
        assert!(!gw.verify_webhook(b"{}", &signature));
        assert_eq!(
            gw.parse_event(body).unwrap(),
            ProviderEvent::TransferFailed {
                reference: "PAY-9".into()
            }
        );
    }

    #[test]
    fn test_unhandled_events_are_ignored() {
        let event = parse_webhook(br#"{"event":"subscription.create","data":{}}"#).unwrap();
        assert_eq!(
            event,
            ProviderEvent::Ignored {
                event_type: "subscription.create".into()
            }
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(charge_status("abandoned"), ProviderStatus::Pending);
        assert_eq!(charge_status("reversed"), ProviderStatus::Failed);
        assert_eq!(transfer_status("otp"), TransferStatus::Pending);
    }
}
