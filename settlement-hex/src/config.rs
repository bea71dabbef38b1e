//! Settlement configuration passed at construction.

use std::time::Duration;

use settlement_types::ProviderKind;

/// Tunables for the settlement service.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Platform fee in basis points (1000 = 10%).
    pub fee_bps: u32,
    /// Days an escrow stays held before it is eligible for the expiry sweep.
    pub escrow_expiry_days: i64,
    /// Upper bound on every outbound provider call.
    pub provider_timeout: Duration,
    /// Provider that executes vendor bank transfers.
    pub payout_provider: ProviderKind,
    /// Pending transfer jobs before new payouts are refused.
    pub payout_queue_capacity: usize,
}

impl SettlementConfig {
    /// Highest accepted fee; a fee of the full amount would leave nothing to settle.
    pub const MAX_FEE_BPS: u32 = 9_999;

    /// Converts a percentage such as `10` or `2.5` into basis points.
    pub fn bps_from_percent(percent: f64) -> Result<u32, String> {
        if !percent.is_finite() || percent < 0.0 {
            return Err(format!("fee percent must be a non-negative number, got {}", percent));
        }
        let bps = (percent * 100.0).round();
        if bps > f64::from(Self::MAX_FEE_BPS) {
            return Err(format!("fee percent {} must be below 100", percent));
        }
        Ok(bps as u32)
    }

    pub fn with_fee_bps(mut self, fee_bps: u32) -> Self {
        self.fee_bps = fee_bps.min(Self::MAX_FEE_BPS);
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_payout_provider(mut self, provider: ProviderKind) -> Self {
        self.payout_provider = provider;
        self
    }

    pub fn with_escrow_expiry_days(mut self, days: i64) -> Self {
        self.escrow_expiry_days = days;
        self
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            fee_bps: 1_000,
            escrow_expiry_days: 14,
            provider_timeout: Duration::from_secs(30),
            payout_provider: ProviderKind::Paystack,
            payout_queue_capacity: 256,
        }
    }
}
