//! # Settlement Hex
//!
//! Application layer of the settlement service:
//! - `service` - the Settlement Orchestrator driving payments, payouts and webhooks
//! - `escrow` - the Escrow Manager owning per-booking holds
//! - `payouts` - the background transfer worker and its write-back path
//! - `gateways` - provider lookup and bounded provider calls
//! - `inbound` - the axum HTTP adapter

pub mod config;
pub mod escrow;
pub mod gateways;
pub mod inbound;
pub mod payouts;
pub mod service;

#[cfg(test)]
mod service_tests;

pub use config::SettlementConfig;
pub use escrow::EscrowManager;
pub use gateways::GatewayRegistry;
pub use payouts::{PayoutTicket, TransferSettler};
pub use service::SettlementService;
