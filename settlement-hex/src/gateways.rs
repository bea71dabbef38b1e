//! Provider lookup and time-bounded provider calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use settlement_types::{AppError, PaymentGateway, ProviderError, ProviderKind};

/// The configured provider adapters, keyed by provider.
///
/// Adding a provider means registering another `PaymentGateway`; the
/// orchestrator never branches on the provider itself.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<ProviderKind, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `gateway` under its own kind, replacing any previous one.
    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.kind(), gateway);
    }

    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.gateways.contains_key(&kind)
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn PaymentGateway>, AppError> {
        self.gateways
            .get(&kind)
            .cloned()
            .ok_or_else(|| AppError::InvalidRequest(format!("provider {} is not configured", kind)))
    }

    /// Resolves a provider by its path name, as used by webhook routes.
    pub fn by_name(&self, name: &str) -> Result<Arc<dyn PaymentGateway>, AppError> {
        let kind: ProviderKind = name.parse()?;
        self.get(kind)
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.gateways.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

/// Runs a provider call under `limit`; running out of time is `Unavailable`.
pub(crate) async fn bounded<T, F>(
    provider: ProviderKind,
    limit: Duration,
    call: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(%provider, timeout_ms = limit.as_millis() as u64, "provider call timed out");
            Err(ProviderError::Unavailable(format!(
                "{} did not answer within {}s",
                provider,
                limit.as_secs()
            )))
        }
    }
}
