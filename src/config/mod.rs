use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub settlement: SettlementConfig,
    pub payout: PayoutRetryConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
    /// Bound on every gateway HTTP call; a timeout is a retryable failure,
    /// never a silent success.
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Commission rates in integer basis points. One canonical table; the
/// divergent rate constants in older deployments are a bug, not config.
#[derive(Deserialize, Clone, Debug)]
pub struct SettlementConfig {
    pub platform_fee_bps: u32,
    pub agent_commission_bps: u32,
    /// Destination account for the platform's own fee payout.
    pub platform_destination: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PayoutRetryConfig {
    /// Submission retries per disbursement (initial attempt not counted).
    pub max_submission_retries: u32,
    /// Hard cap on attempts per (escrow, beneficiary) across synchronous and
    /// webhook-driven failures.
    pub max_total_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for PayoutRetryConfig {
    fn default() -> Self {
        Self {
            max_submission_retries: 3,
            max_total_attempts: 5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("ESCROW_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("ESCROW_SERVICE_PORT")
            .unwrap_or_else(|_| "3006".to_string())
            .parse()?;

        let db_url = env::var("ESCROW_DATABASE_URL").expect("ESCROW_DATABASE_URL must be set");
        let max_connections = env::var("ESCROW_DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;

        let key_id = env::var("GATEWAY_KEY_ID").unwrap_or_default();
        let key_secret = env::var("GATEWAY_KEY_SECRET").unwrap_or_default();
        let webhook_secret =
            env::var("GATEWAY_WEBHOOK_SECRET").expect("GATEWAY_WEBHOOK_SECRET must be set");
        let api_base_url = env::var("GATEWAY_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string());
        let timeout_secs = env::var("GATEWAY_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;

        let platform_fee_bps = env::var("SETTLEMENT_PLATFORM_FEE_BPS")
            .unwrap_or_else(|_| "200".to_string())
            .parse()?;
        let agent_commission_bps = env::var("SETTLEMENT_AGENT_COMMISSION_BPS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()?;
        let platform_destination = env::var("SETTLEMENT_PLATFORM_DESTINATION")
            .unwrap_or_else(|_| "platform@icici".to_string());

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections,
            },
            gateway: GatewayConfig {
                key_id,
                key_secret: Secret::new(key_secret),
                webhook_secret: Secret::new(webhook_secret),
                api_base_url,
                timeout_secs,
            },
            settlement: SettlementConfig {
                platform_fee_bps,
                agent_commission_bps,
                platform_destination,
            },
            payout: PayoutRetryConfig::default(),
            service_name: "escrow-service".to_string(),
        })
    }
}
