//! Configuration loading from the command line and environment.

use std::time::Duration;

use clap::Parser;

use settlement_gateways::GatewayConfig;
use settlement_hex::SettlementConfig;
use settlement_types::ProviderKind;

/// Application configuration.
#[derive(Debug, Parser)]
#[command(name = "settlement-server")]
#[command(author, version, about = "Marketplace settlement and escrow service", long_about = None)]
pub struct Config {
    /// Port the HTTP server listens on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Database connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Platform fee taken from each payment, in percent
    #[arg(long, env = "PLATFORM_FEE_PERCENT", default_value_t = 10.0)]
    pub platform_fee_percent: f64,

    /// Days an escrow is held before it may expire
    #[arg(long, env = "ESCROW_EXPIRY_DAYS", default_value_t = 14)]
    pub escrow_expiry_days: i64,

    /// Timeout for every outbound provider call, in seconds
    #[arg(long, env = "PROVIDER_TIMEOUT_SECS", default_value_t = 30)]
    pub provider_timeout_secs: u64,

    /// Provider used for vendor bank transfers
    #[arg(long, env = "PAYOUT_PROVIDER", default_value = "paystack")]
    pub payout_provider: String,

    /// Capacity of the payout transfer queue
    #[arg(long, env = "PAYOUT_QUEUE_CAPACITY", default_value_t = 256)]
    pub payout_queue_capacity: usize,

    #[arg(long, env = "PAYSTACK_SECRET_KEY")]
    pub paystack_secret_key: Option<String>,

    #[arg(long, env = "PAYSTACK_BASE_URL", default_value = "https://api.paystack.co")]
    pub paystack_base_url: String,

    #[arg(long, env = "FLUTTERWAVE_SECRET_KEY")]
    pub flutterwave_secret_key: Option<String>,

    #[arg(long, env = "FLUTTERWAVE_BASE_URL", default_value = "https://api.flutterwave.com")]
    pub flutterwave_base_url: String,

    /// Secret hash Flutterwave sends in `verif-hash`
    #[arg(long, env = "FLUTTERWAVE_WEBHOOK_HASH")]
    pub flutterwave_webhook_hash: Option<String>,

    /// `json` for structured logs, anything else for human-readable output
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Builds the settlement tunables, validating them once.
    pub fn settlement(&self) -> anyhow::Result<SettlementConfig> {
        let fee_bps =
            SettlementConfig::bps_from_percent(self.platform_fee_percent).map_err(anyhow::Error::msg)?;
        if self.escrow_expiry_days <= 0 {
            anyhow::bail!("ESCROW_EXPIRY_DAYS must be positive");
        }
        let payout_provider: ProviderKind = self.payout_provider.parse()?;

        Ok(SettlementConfig {
            fee_bps,
            escrow_expiry_days: self.escrow_expiry_days,
            provider_timeout: self.provider_timeout(),
            payout_provider,
            payout_queue_capacity: self.payout_queue_capacity,
        })
    }

    /// Connection settings for every provider with a secret key configured.
    pub fn gateways(&self) -> Vec<(ProviderKind, GatewayConfig)> {
        let mut gateways = Vec::new();
        if let Some(key) = &self.paystack_secret_key {
            gateways.push((
                ProviderKind::Paystack,
                GatewayConfig::new(&self.paystack_base_url, key)
                    .with_timeout(self.provider_timeout()),
            ));
        }
        if let Some(key) = &self.flutterwave_secret_key {
            gateways.push((
                ProviderKind::Flutterwave,
                GatewayConfig::new(&self.flutterwave_base_url, key)
                    .with_webhook_secret(self.flutterwave_webhook_hash.clone())
                    .with_timeout(self.provider_timeout()),
            ));
        }
        gateways
    }
}
