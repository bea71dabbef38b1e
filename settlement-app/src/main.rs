//! # Settlement Application
//!
//! Binary that wires together all the components:
//! - Load configuration from the command line and environment
//! - Initialize the ledger store
//! - Build the provider gateways
//! - Create the settlement service
//! - Start the HTTP server

mod config;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use settlement_gateways::{InternalGateway, build_gateway};
use settlement_hex::{GatewayRegistry, SettlementService, inbound::HttpServer};
use settlement_repo::build_repo;

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,settlement_app=debug,settlement_hex=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = config::Config::parse();
    init_tracing(&config.log_format);

    let settlement = config.settlement()?;
    tracing::info!(
        port = config.port,
        fee_bps = settlement.fee_bps,
        payout_provider = %settlement.payout_provider,
        "Starting settlement server"
    );

    // Build repository (handles connection and migration)
    let repo = build_repo(&config.database_url).await?;

    let mut gateways = GatewayRegistry::new().with(std::sync::Arc::new(InternalGateway));
    for (kind, gateway_config) in config.gateways() {
        tracing::info!(provider = %kind, base_url = %gateway_config.base_url, "provider configured");
        gateways.register(build_gateway(kind, gateway_config));
    }

    let service = SettlementService::new(repo, gateways, settlement);

    // Create and run the HTTP server
    let server = HttpServer::new(service);
    let addr = format!("0.0.0.0:{}", config.port);

    server.run(&addr).await?;
    Ok(())
}
