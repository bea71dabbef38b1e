//! # Settlement Gateways
//!
//! Outbound adapters implementing the `PaymentGateway` port, one per
//! provider. Each adapter owns its wire format; callers only see the
//! normalized types from `settlement-types`.

use std::sync::Arc;
use std::time::Duration;

use settlement_types::{PaymentGateway, ProviderKind};

mod http;
pub mod flutterwave;
pub mod internal;
pub mod paystack;
pub mod security;

pub use flutterwave::FlutterwaveGateway;
pub use internal::InternalGateway;
pub use paystack::PaystackGateway;

/// Connection settings for one external provider.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    /// Shared secret checked on inbound webhooks, where the provider uses
    /// one distinct from the API key.
    pub webhook_secret: Option<String>,
    pub timeout: Duration,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            secret_key: secret_key.into(),
            webhook_secret: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Builds the gateway for `kind`. `Internal` ignores the config.
pub fn build_gateway(kind: ProviderKind, config: GatewayConfig) -> Arc<dyn PaymentGateway> {
    match kind {
        ProviderKind::Paystack => Arc::new(PaystackGateway::new(config)),
        ProviderKind::Flutterwave => Arc::new(FlutterwaveGateway::new(config)),
        ProviderKind::Internal => Arc::new(InternalGateway),
    }
}
