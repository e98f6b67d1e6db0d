//! Storage seam for the engine.
//!
//! Every store the engine touches sits behind one `Repository` trait so the
//! state machine and payout logic can be exercised hermetically. The
//! production implementation is Postgres (`services::database`); the
//! in-memory implementation here backs the test suites and enforces the same
//! unique keys the schema does.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    BeneficiaryType, EscrowStatus, EscrowTransaction, OrderStatus, PaymentOrder, PayoutRequest,
    PayoutStatus, SettlementSplit, SettlementState, WebhookEventRecord,
};

/// Outcome of recording an inbound webhook event before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// First delivery; a `processed = false` row was inserted.
    New,
    /// Delivered before and fully handled; acknowledge with no side effects.
    AlreadyProcessed,
    /// Delivered before but the handler failed; safe to reprocess.
    RetryPending,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // --- orders ---

    /// Persist an order and, for acquisitions, its linked escrow in one
    /// storage transaction. An order without its escrow record (or vice
    /// versa) must be impossible.
    async fn create_order_with_escrow(
        &self,
        order: &PaymentOrder,
        escrow: Option<&EscrowTransaction>,
    ) -> Result<(), AppError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<PaymentOrder>, AppError>;

    async fn get_order_by_gateway_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentOrder>, AppError>;

    /// Mark the order Failed after a `payment.failed` event. The linked
    /// escrow (if any) stays Pending; the buyer may retry checkout.
    async fn persist_payment_failed(&self, gateway_order_id: &str) -> Result<(), AppError>;

    /// Mark a non-escrow order Paid (subscription/valuation/matchmaking
    /// purposes have no escrow leg).
    async fn persist_order_paid(&self, gateway_order_id: &str) -> Result<(), AppError>;

    // --- escrows ---

    async fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowTransaction>, AppError>;

    async fn get_escrow_by_gateway_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<EscrowTransaction>, AppError>;

    async fn get_escrow_by_payment_id(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Option<EscrowTransaction>, AppError>;

    /// Escrow Pending -> Held plus order -> Paid, atomically. An order
    /// already terminal (a failed attempt preceded the capture) keeps its
    /// status; only the escrow advances.
    async fn persist_funding(
        &self,
        escrow_id: Uuid,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<(), AppError>;

    /// Escrow Held -> Released plus the split row, atomically.
    async fn persist_release(
        &self,
        escrow_id: Uuid,
        split: &SettlementSplit,
    ) -> Result<(), AppError>;

    /// Escrow Held -> Refunded.
    async fn persist_refund(&self, escrow_id: Uuid) -> Result<(), AppError>;

    async fn set_settlement_state(
        &self,
        escrow_id: Uuid,
        state: SettlementState,
    ) -> Result<(), AppError>;

    async fn get_split(&self, escrow_id: Uuid) -> Result<Option<SettlementSplit>, AppError>;

    // --- payouts ---

    /// Insert a payout row; duplicate `reference_id` is a storage-level
    /// constraint violation, never silently accepted.
    async fn insert_payout(&self, payout: &PayoutRequest) -> Result<(), AppError>;

    async fn get_payout(&self, id: Uuid) -> Result<Option<PayoutRequest>, AppError>;

    async fn get_payout_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<PayoutRequest>, AppError>;

    async fn payouts_for_escrow(&self, escrow_id: Uuid) -> Result<Vec<PayoutRequest>, AppError>;

    /// Highest attempt number recorded for this (escrow, beneficiary), across
    /// all rows. Zero when none exist.
    async fn last_attempt(
        &self,
        escrow_id: Uuid,
        beneficiary: BeneficiaryType,
    ) -> Result<u32, AppError>;

    async fn mark_payout_processing(
        &self,
        payout_id: Uuid,
        gateway_payout_id: &str,
    ) -> Result<(), AppError>;

    async fn mark_payout_failed(&self, payout_id: Uuid, error: &str) -> Result<(), AppError>;

    async fn mark_payout_completed(&self, payout_id: Uuid) -> Result<(), AppError>;

    // --- webhook dedup ---

    async fn begin_webhook_event(
        &self,
        record: &WebhookEventRecord,
    ) -> Result<EventDisposition, AppError>;

    async fn mark_webhook_processed(&self, event_id: &str) -> Result<(), AppError>;

    // --- beneficiary directory ---

    async fn payout_destination(&self, party_id: Uuid) -> Result<Option<String>, AppError>;

    async fn upsert_payout_destination(
        &self,
        party_id: Uuid,
        destination: &str,
    ) -> Result<(), AppError>;
}

pub type DynRepository = Arc<dyn Repository>;

/// In-memory repository for tests. Mirrors the schema's unique keys:
/// `gateway_order_id` per escrow, `reference_id` per payout, `event_id` per
/// webhook record.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    orders: HashMap<Uuid, PaymentOrder>,
    escrows: HashMap<Uuid, EscrowTransaction>,
    splits: HashMap<Uuid, SettlementSplit>,
    payouts: HashMap<Uuid, PayoutRequest>,
    events: HashMap<String, WebhookEventRecord>,
    destinations: HashMap<Uuid, String>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn conflict(what: &str) -> AppError {
        AppError::DatabaseError(anyhow::anyhow!("unique constraint violated: {what}"))
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_order_with_escrow(
        &self,
        order: &PaymentOrder,
        escrow: Option<&EscrowTransaction>,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .orders
            .values()
            .any(|o| o.gateway_order_id == order.gateway_order_id)
        {
            return Err(Self::conflict("payment_orders.gateway_order_id"));
        }
        if inner.orders.values().any(|o| o.receipt == order.receipt) {
            return Err(Self::conflict("payment_orders.receipt"));
        }
        if let Some(escrow) = escrow {
            if inner
                .escrows
                .values()
                .any(|e| e.gateway_order_id == escrow.gateway_order_id)
            {
                return Err(Self::conflict("escrow_transactions.gateway_order_id"));
            }
            inner.escrows.insert(escrow.id, escrow.clone());
        }
        inner.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<PaymentOrder>, AppError> {
        Ok(self.inner.lock().unwrap().orders.get(&id).cloned())
    }

    async fn get_order_by_gateway_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentOrder>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .orders
            .values()
            .find(|o| o.gateway_order_id == gateway_order_id)
            .cloned())
    }

    async fn persist_payment_failed(&self, gateway_order_id: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(order) = inner
            .orders
            .values_mut()
            .find(|o| o.gateway_order_id == gateway_order_id)
        {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Failed;
                order.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn persist_order_paid(&self, gateway_order_id: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(order) = inner
            .orders
            .values_mut()
            .find(|o| o.gateway_order_id == gateway_order_id)
        {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Paid;
                order.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowTransaction>, AppError> {
        Ok(self.inner.lock().unwrap().escrows.get(&id).cloned())
    }

    async fn get_escrow_by_payment_id(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Option<EscrowTransaction>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .escrows
            .values()
            .find(|e| e.gateway_payment_id.as_deref() == Some(gateway_payment_id))
            .cloned())
    }

    async fn get_escrow_by_gateway_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<EscrowTransaction>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .escrows
            .values()
            .find(|e| e.gateway_order_id == gateway_order_id)
            .cloned())
    }

    async fn persist_funding(
        &self,
        escrow_id: Uuid,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let escrow = inner
            .escrows
            .get_mut(&escrow_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("escrow {escrow_id}")))?;
        escrow.status = EscrowStatus::Held;
        escrow.gateway_payment_id = Some(gateway_payment_id.to_string());
        escrow.updated_at = now;
        if let Some(order) = inner
            .orders
            .values_mut()
            .find(|o| o.gateway_order_id == gateway_order_id)
        {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Paid;
                order.updated_at = now;
            }
        }
        Ok(())
    }

    async fn persist_release(
        &self,
        escrow_id: Uuid,
        split: &SettlementSplit,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let escrow = inner
            .escrows
            .get_mut(&escrow_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("escrow {escrow_id}")))?;
        escrow.status = EscrowStatus::Released;
        escrow.settlement_state = Some(SettlementState::InProgress);
        escrow.updated_at = Utc::now();
        inner.splits.insert(escrow_id, *split);
        Ok(())
    }

    async fn persist_refund(&self, escrow_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let escrow = inner
            .escrows
            .get_mut(&escrow_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("escrow {escrow_id}")))?;
        escrow.status = EscrowStatus::Refunded;
        escrow.updated_at = Utc::now();
        Ok(())
    }

    async fn set_settlement_state(
        &self,
        escrow_id: Uuid,
        state: SettlementState,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(escrow) = inner.escrows.get_mut(&escrow_id) {
            escrow.settlement_state = Some(state);
            escrow.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_split(&self, escrow_id: Uuid) -> Result<Option<SettlementSplit>, AppError> {
        Ok(self.inner.lock().unwrap().splits.get(&escrow_id).copied())
    }

    async fn insert_payout(&self, payout: &PayoutRequest) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .payouts
            .values()
            .any(|p| p.reference_id == payout.reference_id)
        {
            return Err(Self::conflict("payout_requests.reference_id"));
        }
        inner.payouts.insert(payout.id, payout.clone());
        Ok(())
    }

    async fn get_payout(&self, id: Uuid) -> Result<Option<PayoutRequest>, AppError> {
        Ok(self.inner.lock().unwrap().payouts.get(&id).cloned())
    }

    async fn get_payout_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<PayoutRequest>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .payouts
            .values()
            .find(|p| p.reference_id == reference_id)
            .cloned())
    }

    async fn payouts_for_escrow(&self, escrow_id: Uuid) -> Result<Vec<PayoutRequest>, AppError> {
        let mut payouts: Vec<PayoutRequest> = self
            .inner
            .lock()
            .unwrap()
            .payouts
            .values()
            .filter(|p| p.escrow_id == escrow_id)
            .cloned()
            .collect();
        payouts.sort_by_key(|p| (p.beneficiary_type.as_str(), p.attempt));
        Ok(payouts)
    }

    async fn last_attempt(
        &self,
        escrow_id: Uuid,
        beneficiary: BeneficiaryType,
    ) -> Result<u32, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .payouts
            .values()
            .filter(|p| p.escrow_id == escrow_id && p.beneficiary_type == beneficiary)
            .map(|p| p.attempt)
            .max()
            .unwrap_or(0))
    }

    async fn mark_payout_processing(
        &self,
        payout_id: Uuid,
        gateway_payout_id: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let payout = inner
            .payouts
            .get_mut(&payout_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("payout {payout_id}")))?;
        payout.status = PayoutStatus::Processing;
        payout.gateway_payout_id = Some(gateway_payout_id.to_string());
        payout.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_payout_failed(&self, payout_id: Uuid, error: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let payout = inner
            .payouts
            .get_mut(&payout_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("payout {payout_id}")))?;
        payout.status = PayoutStatus::Failed;
        payout.last_error = Some(error.to_string());
        payout.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_payout_completed(&self, payout_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let payout = inner
            .payouts
            .get_mut(&payout_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("payout {payout_id}")))?;
        payout.status = PayoutStatus::Completed;
        payout.updated_at = Utc::now();
        Ok(())
    }

    async fn begin_webhook_event(
        &self,
        record: &WebhookEventRecord,
    ) -> Result<EventDisposition, AppError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.events.get(&record.event_id) {
            Some(existing) if existing.processed => Ok(EventDisposition::AlreadyProcessed),
            Some(_) => Ok(EventDisposition::RetryPending),
            None => {
                inner.events.insert(record.event_id.clone(), record.clone());
                Ok(EventDisposition::New)
            }
        }
    }

    async fn mark_webhook_processed(&self, event_id: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.events.get_mut(event_id) {
            record.processed = true;
        }
        Ok(())
    }

    async fn payout_destination(&self, party_id: Uuid) -> Result<Option<String>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .destinations
            .get(&party_id)
            .cloned())
    }

    async fn upsert_payout_destination(
        &self,
        party_id: Uuid,
        destination: &str,
    ) -> Result<(), AppError> {
        self.inner
            .lock()
            .unwrap()
            .destinations
            .insert(party_id, destination.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentPurpose;

    fn order(gateway_order_id: &str, receipt: &str) -> PaymentOrder {
        let now = Utc::now();
        PaymentOrder {
            id: Uuid::new_v4(),
            gateway_order_id: gateway_order_id.to_string(),
            buyer_id: Uuid::new_v4(),
            amount_minor: 49_900,
            currency: "INR".to_string(),
            receipt: receipt.to_string(),
            status: OrderStatus::Created,
            purpose: PaymentPurpose::Subscription,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn duplicate_gateway_order_id_is_rejected() {
        let repo = MemoryRepository::new();
        repo.create_order_with_escrow(&order("order_1", "r1"), None)
            .await
            .unwrap();

        let err = repo
            .create_order_with_escrow(&order("order_1", "r2"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gateway_order_id"));
    }

    #[tokio::test]
    async fn duplicate_receipt_is_rejected() {
        let repo = MemoryRepository::new();
        repo.create_order_with_escrow(&order("order_1", "sub_b_1"), None)
            .await
            .unwrap();

        let err = repo
            .create_order_with_escrow(&order("order_2", "sub_b_1"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("receipt"));
    }
}
