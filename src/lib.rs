pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;

use axum::{
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use config::Config;
use services::database::PgRepository;
use services::{DynRepository, EscrowLedger, GatewayClient, PayoutProcessor};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub repository: DynRepository,
    pub gateway: GatewayClient,
    pub ledger: EscrowLedger,
    pub payouts: PayoutProcessor,
}

impl AppState {
    /// Wire the engine's components around any repository implementation.
    /// Production uses Postgres; tests inject the in-memory repository.
    pub fn new(config: Config, repository: DynRepository) -> Self {
        let gateway = GatewayClient::new(config.gateway.clone());
        let ledger = EscrowLedger::new(repository.clone(), config.settlement.clone());
        let payouts = PayoutProcessor::new(
            repository.clone(),
            gateway.clone(),
            config.payout.clone(),
            config.settlement.platform_destination.clone(),
        );
        Self {
            config,
            repository,
            gateway,
            ledger,
            payouts,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        // Order intake
        .route("/orders", post(handlers::orders::create_order))
        .route("/orders/:id", get(handlers::orders::get_order))
        // Gateway callbacks
        .route("/webhooks/gateway", post(handlers::webhooks::gateway_webhook))
        // Escrow transitions and status polling
        .route("/escrow/:id", get(handlers::escrow::get_escrow))
        .route("/escrow/:id/release", post(handlers::escrow::release))
        .route("/escrow/:id/refund", post(handlers::escrow::refund))
        .route(
            "/escrow/:id/payouts",
            get(handlers::payouts::list_escrow_payouts),
        )
        // Payout recovery
        .route("/payouts/:id", get(handlers::payouts::get_payout))
        .route("/payouts/:id/retry", post(handlers::payouts::retry_payout))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .with_state(state)
}

pub struct Application {
    port: u16,
    router: Router,
}

impl Application {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let repository = PgRepository::connect(
            config.database.url.expose_secret(),
            config.database.max_connections,
        )
        .await?;
        repository.init_schema().await?;

        let state = AppState::new(config.clone(), Arc::new(repository));

        if state.gateway.is_configured() {
            tracing::info!("payment gateway client initialized");
        } else {
            tracing::warn!("gateway credentials not configured - order and payout calls will fail");
        }

        Ok(Self {
            port: config.server.port,
            router: router(state),
        })
    }

    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        tracing::info!("Listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router).await?;

        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
