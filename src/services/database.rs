//! Postgres repository.
//!
//! Uniqueness of `escrow_transactions.gateway_order_id`,
//! `payout_requests.reference_id` and `webhook_events.event_id` is enforced
//! by the schema, not just in application code. Every webhook's cross-entity
//! effects (order + escrow) commit in one transaction.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    BeneficiaryType, EscrowStatus, EscrowTransaction, OrderStatus, PaymentOrder, PaymentPurpose,
    PayoutRequest, PayoutStatus, SettlementSplit, SettlementState, WebhookEventRecord,
};
use crate::services::repository::{EventDisposition, Repository};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS payment_orders (
    id UUID PRIMARY KEY,
    gateway_order_id TEXT NOT NULL UNIQUE,
    buyer_id UUID NOT NULL,
    amount_minor BIGINT NOT NULL CHECK (amount_minor > 0),
    currency TEXT NOT NULL,
    receipt TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    purpose TEXT NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS escrow_transactions (
    id UUID PRIMARY KEY,
    buyer_id UUID NOT NULL,
    seller_id UUID NOT NULL,
    agent_id UUID,
    subject_id UUID NOT NULL,
    amount_minor BIGINT NOT NULL CHECK (amount_minor > 0),
    status TEXT NOT NULL,
    gateway_order_id TEXT NOT NULL UNIQUE,
    gateway_payment_id TEXT,
    settlement_state TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS settlement_splits (
    escrow_id UUID PRIMARY KEY REFERENCES escrow_transactions(id),
    platform_fee BIGINT NOT NULL CHECK (platform_fee >= 0),
    agent_commission BIGINT NOT NULL CHECK (agent_commission >= 0),
    seller_net BIGINT NOT NULL CHECK (seller_net >= 0),
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS payout_requests (
    id UUID PRIMARY KEY,
    escrow_id UUID NOT NULL REFERENCES escrow_transactions(id),
    beneficiary_type TEXT NOT NULL,
    amount_minor BIGINT NOT NULL CHECK (amount_minor > 0),
    destination TEXT NOT NULL,
    status TEXT NOT NULL,
    gateway_payout_id TEXT,
    reference_id TEXT NOT NULL UNIQUE,
    attempt INT NOT NULL,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS payout_requests_escrow_idx
    ON payout_requests (escrow_id, beneficiary_type, attempt);

CREATE TABLE IF NOT EXISTS webhook_events (
    event_id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    received_at TIMESTAMPTZ NOT NULL,
    processed BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS beneficiary_accounts (
    party_id UUID PRIMARY KEY,
    destination TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
"#;

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AppError> {
        info!(max_connections, "connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create tables and unique indexes if they do not exist yet.
    pub async fn init_schema(&self) -> Result<(), AppError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("escrow schema initialized");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn order_from_row(row: &sqlx::postgres::PgRow) -> Result<PaymentOrder, AppError> {
        let status: String = row.try_get("status")?;
        let purpose: String = row.try_get("purpose")?;
        Ok(PaymentOrder {
            id: row.try_get("id")?,
            gateway_order_id: row.try_get("gateway_order_id")?,
            buyer_id: row.try_get("buyer_id")?,
            amount_minor: row.try_get("amount_minor")?,
            currency: row.try_get("currency")?,
            receipt: row.try_get("receipt")?,
            status: OrderStatus::parse(&status)
                .ok_or_else(|| AppError::DatabaseError(anyhow::anyhow!("bad order status {status}")))?,
            purpose: PaymentPurpose::parse(&purpose).ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!("bad order purpose {purpose}"))
            })?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn escrow_from_row(row: &sqlx::postgres::PgRow) -> Result<EscrowTransaction, AppError> {
        let status: String = row.try_get("status")?;
        let settlement_state: Option<String> = row.try_get("settlement_state")?;
        Ok(EscrowTransaction {
            id: row.try_get("id")?,
            buyer_id: row.try_get("buyer_id")?,
            seller_id: row.try_get("seller_id")?,
            agent_id: row.try_get("agent_id")?,
            subject_id: row.try_get("subject_id")?,
            amount_minor: row.try_get("amount_minor")?,
            status: EscrowStatus::parse(&status).ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!("bad escrow status {status}"))
            })?,
            gateway_order_id: row.try_get("gateway_order_id")?,
            gateway_payment_id: row.try_get("gateway_payment_id")?,
            settlement_state: settlement_state.as_deref().and_then(SettlementState::parse),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn payout_from_row(row: &sqlx::postgres::PgRow) -> Result<PayoutRequest, AppError> {
        let status: String = row.try_get("status")?;
        let beneficiary: String = row.try_get("beneficiary_type")?;
        let attempt: i32 = row.try_get("attempt")?;
        Ok(PayoutRequest {
            id: row.try_get("id")?,
            escrow_id: row.try_get("escrow_id")?,
            beneficiary_type: BeneficiaryType::parse(&beneficiary).ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!("bad beneficiary {beneficiary}"))
            })?,
            amount_minor: row.try_get("amount_minor")?,
            destination: row.try_get("destination")?,
            status: PayoutStatus::parse(&status).ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!("bad payout status {status}"))
            })?,
            gateway_payout_id: row.try_get("gateway_payout_id")?,
            reference_id: row.try_get("reference_id")?,
            attempt: attempt as u32,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn create_order_with_escrow(
        &self,
        order: &PaymentOrder,
        escrow: Option<&EscrowTransaction>,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO payment_orders \
             (id, gateway_order_id, buyer_id, amount_minor, currency, receipt, status, purpose, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(order.id)
        .bind(&order.gateway_order_id)
        .bind(order.buyer_id)
        .bind(order.amount_minor)
        .bind(&order.currency)
        .bind(&order.receipt)
        .bind(order.status.as_str())
        .bind(order.purpose.as_str())
        .bind(&order.metadata)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;

        if let Some(escrow) = escrow {
            sqlx::query(
                "INSERT INTO escrow_transactions \
                 (id, buyer_id, seller_id, agent_id, subject_id, amount_minor, status, gateway_order_id, gateway_payment_id, settlement_state, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(escrow.id)
            .bind(escrow.buyer_id)
            .bind(escrow.seller_id)
            .bind(escrow.agent_id)
            .bind(escrow.subject_id)
            .bind(escrow.amount_minor)
            .bind(escrow.status.as_str())
            .bind(&escrow.gateway_order_id)
            .bind(&escrow.gateway_payment_id)
            .bind(escrow.settlement_state.map(|s| s.as_str()))
            .bind(escrow.created_at)
            .bind(escrow.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<PaymentOrder>, AppError> {
        let row = sqlx::query("SELECT * FROM payment_orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::order_from_row).transpose()
    }

    async fn get_order_by_gateway_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentOrder>, AppError> {
        let row = sqlx::query("SELECT * FROM payment_orders WHERE gateway_order_id = $1")
            .bind(gateway_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::order_from_row).transpose()
    }

    async fn persist_payment_failed(&self, gateway_order_id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payment_orders SET status = 'failed', updated_at = NOW() \
             WHERE gateway_order_id = $1 AND status NOT IN ('paid', 'failed')",
        )
        .bind(gateway_order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_order_paid(&self, gateway_order_id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payment_orders SET status = 'paid', updated_at = NOW() \
             WHERE gateway_order_id = $1 AND status NOT IN ('paid', 'failed')",
        )
        .bind(gateway_order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowTransaction>, AppError> {
        let row = sqlx::query("SELECT * FROM escrow_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::escrow_from_row).transpose()
    }

    async fn get_escrow_by_gateway_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<EscrowTransaction>, AppError> {
        let row = sqlx::query("SELECT * FROM escrow_transactions WHERE gateway_order_id = $1")
            .bind(gateway_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::escrow_from_row).transpose()
    }

    async fn get_escrow_by_payment_id(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Option<EscrowTransaction>, AppError> {
        let row = sqlx::query("SELECT * FROM escrow_transactions WHERE gateway_payment_id = $1")
            .bind(gateway_payment_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::escrow_from_row).transpose()
    }

    async fn persist_funding(
        &self,
        escrow_id: Uuid,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE escrow_transactions \
             SET status = 'held', gateway_payment_id = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(escrow_id)
        .bind(gateway_payment_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE payment_orders SET status = 'paid', updated_at = NOW() \
             WHERE gateway_order_id = $1 AND status NOT IN ('paid', 'failed')",
        )
        .bind(gateway_order_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn persist_release(
        &self,
        escrow_id: Uuid,
        split: &SettlementSplit,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE escrow_transactions \
             SET status = 'released', settlement_state = 'in_progress', updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(escrow_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO settlement_splits (escrow_id, platform_fee, agent_commission, seller_net, created_at) \
             VALUES ($1, $2, $3, $4, NOW())",
        )
        .bind(escrow_id)
        .bind(split.platform_fee)
        .bind(split.agent_commission)
        .bind(split.seller_net)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn persist_refund(&self, escrow_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE escrow_transactions SET status = 'refunded', updated_at = NOW() WHERE id = $1",
        )
        .bind(escrow_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_settlement_state(
        &self,
        escrow_id: Uuid,
        state: SettlementState,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE escrow_transactions SET settlement_state = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(escrow_id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_split(&self, escrow_id: Uuid) -> Result<Option<SettlementSplit>, AppError> {
        let row = sqlx::query(
            "SELECT platform_fee, agent_commission, seller_net FROM settlement_splits WHERE escrow_id = $1",
        )
        .bind(escrow_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SettlementSplit {
                platform_fee: row.try_get("platform_fee")?,
                agent_commission: row.try_get("agent_commission")?,
                seller_net: row.try_get("seller_net")?,
            })
        })
        .transpose()
    }

    async fn insert_payout(&self, payout: &PayoutRequest) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO payout_requests \
             (id, escrow_id, beneficiary_type, amount_minor, destination, status, gateway_payout_id, reference_id, attempt, last_error, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(payout.id)
        .bind(payout.escrow_id)
        .bind(payout.beneficiary_type.as_str())
        .bind(payout.amount_minor)
        .bind(&payout.destination)
        .bind(payout.status.as_str())
        .bind(&payout.gateway_payout_id)
        .bind(&payout.reference_id)
        .bind(payout.attempt as i32)
        .bind(&payout.last_error)
        .bind(payout.created_at)
        .bind(payout.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payout(&self, id: Uuid) -> Result<Option<PayoutRequest>, AppError> {
        let row = sqlx::query("SELECT * FROM payout_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::payout_from_row).transpose()
    }

    async fn get_payout_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<PayoutRequest>, AppError> {
        let row = sqlx::query("SELECT * FROM payout_requests WHERE reference_id = $1")
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::payout_from_row).transpose()
    }

    async fn payouts_for_escrow(&self, escrow_id: Uuid) -> Result<Vec<PayoutRequest>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM payout_requests WHERE escrow_id = $1 ORDER BY beneficiary_type, attempt",
        )
        .bind(escrow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::payout_from_row).collect()
    }

    async fn last_attempt(
        &self,
        escrow_id: Uuid,
        beneficiary: BeneficiaryType,
    ) -> Result<u32, AppError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(attempt), 0) AS last FROM payout_requests \
             WHERE escrow_id = $1 AND beneficiary_type = $2",
        )
        .bind(escrow_id)
        .bind(beneficiary.as_str())
        .fetch_one(&self.pool)
        .await?;
        let last: i32 = row.try_get("last")?;
        Ok(last as u32)
    }

    async fn mark_payout_processing(
        &self,
        payout_id: Uuid,
        gateway_payout_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payout_requests \
             SET status = 'processing', gateway_payout_id = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(payout_id)
        .bind(gateway_payout_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_payout_failed(&self, payout_id: Uuid, error: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payout_requests SET status = 'failed', last_error = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(payout_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_payout_completed(&self, payout_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE payout_requests SET status = 'completed', updated_at = NOW() WHERE id = $1",
        )
        .bind(payout_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn begin_webhook_event(
        &self,
        record: &WebhookEventRecord,
    ) -> Result<EventDisposition, AppError> {
        let inserted = sqlx::query(
            "INSERT INTO webhook_events (event_id, event_type, received_at, processed) \
             VALUES ($1, $2, $3, FALSE) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(record.received_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(EventDisposition::New);
        }

        let row = sqlx::query("SELECT processed FROM webhook_events WHERE event_id = $1")
            .bind(&record.event_id)
            .fetch_one(&self.pool)
            .await?;
        let processed: bool = row.try_get("processed")?;
        Ok(if processed {
            EventDisposition::AlreadyProcessed
        } else {
            EventDisposition::RetryPending
        })
    }

    async fn mark_webhook_processed(&self, event_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE webhook_events SET processed = TRUE WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn payout_destination(&self, party_id: Uuid) -> Result<Option<String>, AppError> {
        let row = sqlx::query("SELECT destination FROM beneficiary_accounts WHERE party_id = $1")
            .bind(party_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("destination").map_err(AppError::from))
            .transpose()
    }

    async fn upsert_payout_destination(
        &self,
        party_id: Uuid,
        destination: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO beneficiary_accounts (party_id, destination, updated_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (party_id) DO UPDATE SET destination = $2, updated_at = NOW()",
        )
        .bind(party_id)
        .bind(destination)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
