//! Gateway for wallet-to-wallet movements that never leave the platform.

use async_trait::async_trait;

use settlement_types::{
    ChargeRequest, ChargeSession, Metadata, PaymentGateway, ProviderError, ProviderEvent,
    ProviderKind, ProviderOutcome, ProviderStatus, TransferInstruction, TransferReceipt,
};

/// Internal transactions are settled when recorded, so verification always
/// succeeds and there is nothing to charge, transfer or receive.
pub struct InternalGateway;

impl InternalGateway {
    fn unsupported(capability: &'static str) -> ProviderError {
        ProviderError::Unsupported {
            provider: ProviderKind::Internal,
            capability,
        }
    }
}

#[async_trait]
impl PaymentGateway for InternalGateway {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Internal
    }

    fn signature_header(&self) -> &'static str {
        "x-internal-signature"
    }

    async fn initialize(&self, _request: &ChargeRequest) -> Result<ChargeSession, ProviderError> {
        Err(Self::unsupported("hosted charges"))
    }

    async fn verify(&self, _reference: &str) -> Result<ProviderOutcome, ProviderError> {
        Ok(ProviderOutcome {
            status: ProviderStatus::Success,
            paid_at: None,
            provider_ref: None,
            raw: Metadata::new(),
        })
    }

    async fn initiate_transfer(
        &self,
        _instruction: &TransferInstruction,
    ) -> Result<TransferReceipt, ProviderError> {
        Err(Self::unsupported("bank transfers"))
    }

    fn verify_webhook(&self, _payload: &[u8], _signature: &str) -> bool {
        false
    }

    fn parse_event(&self, _payload: &[u8]) -> Result<ProviderEvent, ProviderError> {
        Err(Self::unsupported("webhooks"))
    }
}
