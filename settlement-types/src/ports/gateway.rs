//! Provider Gateway port.
//!
//! One implementation per external payment provider. The settlement layer
//! sees only this trait and the normalized shapes below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Metadata, Money, ProviderEvent, ProviderKind};
use crate::dto::BankDetails;

/// Errors returned by a gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Transport failure, timeout or 5xx. Safe to retry.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider understood and refused the request.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// The provider answered with something we could not interpret.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: ProviderKind,
        capability: &'static str,
    },
}

/// A request to start collecting a charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub reference: String,
    pub amount: Money,
    pub email: String,
    pub callback_url: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// The provider-hosted session the payer is redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeSession {
    pub authorization_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
}

/// Normalized charge status as reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Success,
    Failed,
    /// Still in flight (abandoned, ongoing, queued).
    Pending,
    /// The provider has no charge with this reference.
    NotFound,
}

/// Result of pulling a charge's status from its provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    pub status: ProviderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    /// Provider-side identifier for the charge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    /// Raw provider payload, kept for audit
    #[serde(default)]
    pub raw: Metadata,
}

impl ProviderOutcome {
    pub fn not_found() -> Self {
        Self {
            status: ProviderStatus::NotFound,
            paid_at: None,
            provider_ref: None,
            raw: Metadata::new(),
        }
    }
}

/// A bank transfer to push out of the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInstruction {
    /// Our payout reference, used as the provider idempotency key
    pub reference: String,
    pub amount: Money,
    pub recipient: BankDetails,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Success,
    /// Accepted; the final outcome arrives by webhook.
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub provider_transfer_ref: String,
    pub status: TransferStatus,
}

/// Contract for payment-provider adapters.
#[async_trait::async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    /// Request header carrying this provider's webhook signature.
    fn signature_header(&self) -> &'static str;

    async fn initialize(&self, request: &ChargeRequest) -> Result<ChargeSession, ProviderError>;

    /// Pulls the authoritative status of the charge `reference`.
    async fn verify(&self, reference: &str) -> Result<ProviderOutcome, ProviderError>;

    async fn initiate_transfer(
        &self,
        instruction: &TransferInstruction,
    ) -> Result<TransferReceipt, ProviderError>;

    /// Checks `signature` against the exact bytes received. Never errors:
    /// anything that does not verify is simply `false`.
    fn verify_webhook(&self, payload: &[u8], signature: &str) -> bool;

    /// Parses a verified webhook body.
    fn parse_event(&self, payload: &[u8]) -> Result<ProviderEvent, ProviderError>;
}
