//! HTTP Server configuration and startup.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use settlement_types::{EscrowStore, LedgerStore};

use super::handlers::{self, AppState};
use crate::SettlementService;

/// HTTP Server for the Settlement API.
pub struct HttpServer<R: LedgerStore + EscrowStore> {
    state: Arc<AppState<R>>,
}

impl<R: LedgerStore + EscrowStore> HttpServer<R> {
    /// Creates a new HTTP server with the given service.
    pub fn new(service: SettlementService<R>) -> Self {
        Self {
            state: Arc::new(AppState {
                service: Arc::new(service),
            }),
        }
    }

    /// Shared handle to the service behind the routes.
    pub fn service(&self) -> Arc<SettlementService<R>> {
        self.state.service.clone()
    }

    /// Builds the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route(
                "/api/payments/initialize",
                post(handlers::initialize_payment::<R>),
            )
            .route(
                "/api/payments/verify/{reference}",
                get(handlers::verify_payment::<R>),
            )
            .route("/api/transactions/{id}", get(handlers::get_transaction::<R>))
            .route(
                "/api/wallets/{user_id}/transactions",
                get(handlers::list_wallet_transactions::<R>),
            )
            .route(
                "/api/wallets/{user_id}/{currency}",
                get(handlers::get_wallet::<R>),
            )
            .route("/api/payouts", post(handlers::request_payout::<R>))
            .route("/api/payouts/{vendor_id}", get(handlers::list_payouts::<R>))
            .route(
                "/api/payouts/{vendor_id}/{payout_id}",
                get(handlers::get_payout::<R>),
            )
            .route("/api/escrow/{booking_id}", get(handlers::escrow_status::<R>))
            .route(
                "/api/escrow/{booking_id}/release",
                post(handlers::release_escrow::<R>),
            )
            .route(
                "/api/escrow/{booking_id}/refund",
                post(handlers::refund_escrow::<R>),
            )
            .route("/api/webhooks/{provider}", post(handlers::webhook::<R>))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Runs the server on the given address with graceful shutdown.
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Server listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}
