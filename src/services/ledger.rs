//! Escrow state machine.
//!
//! Single writer of escrow status. Status only ever advances along
//! `pending -> held -> {released, refunded}`; every transition runs under a
//! per-escrow mutex so duplicate webhook deliveries cannot interleave, and
//! its cross-entity effects commit in one repository call.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::error::AppError;
use crate::models::{EscrowStatus, EscrowTransaction, SettlementSplit};
use crate::services::repository::DynRepository;
use crate::services::settlement;

/// Result of `mark_funded`.
#[derive(Debug)]
pub enum FundingOutcome {
    /// Pending -> Held happened now.
    Funded(EscrowTransaction),
    /// The same payment was already applied; nothing written.
    AlreadyFunded,
}

/// Result of `release`.
#[derive(Debug)]
pub struct ReleaseOutcome {
    pub escrow: EscrowTransaction,
    pub split: SettlementSplit,
    /// False when this call was an idempotent replay of an earlier release.
    pub newly_released: bool,
}

#[derive(Clone)]
pub struct EscrowLedger {
    repository: DynRepository,
    settlement: SettlementConfig,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl EscrowLedger {
    pub fn new(repository: DynRepository, settlement: SettlementConfig) -> Self {
        Self {
            repository,
            settlement,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, escrow_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(escrow_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Apply a captured payment: Pending -> Held.
    ///
    /// Re-delivery with the same payment id is a no-op in any state. A
    /// different payment id is `ConflictingPayment` and is never silently
    /// overwritten.
    pub async fn mark_funded(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<FundingOutcome, AppError> {
        let escrow = self
            .repository
            .get_escrow_by_gateway_order(gateway_order_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("no escrow for order {gateway_order_id}"))
            })?;

        let lock = self.lock_for(escrow.id);
        let _guard = lock.lock().await;

        // Re-read under the lock; a concurrent delivery may have advanced it.
        let escrow = self
            .repository
            .get_escrow(escrow.id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("escrow {} vanished", escrow.id)))?;

        match escrow.status {
            EscrowStatus::Pending => {
                self.repository
                    .persist_funding(escrow.id, gateway_order_id, gateway_payment_id)
                    .await?;
                metrics::counter!("escrow_transitions_total", "to" => "held").increment(1);
                tracing::info!(
                    escrow_id = %escrow.id,
                    gateway_payment_id = %gateway_payment_id,
                    "escrow funded"
                );
                let funded = self
                    .repository
                    .get_escrow(escrow.id)
                    .await?
                    .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("escrow vanished")))?;
                Ok(FundingOutcome::Funded(funded))
            }
            _ => match escrow.gateway_payment_id.as_deref() {
                Some(existing) if existing == gateway_payment_id => {
                    tracing::debug!(escrow_id = %escrow.id, "duplicate funding event, no-op");
                    Ok(FundingOutcome::AlreadyFunded)
                }
                Some(existing) => {
                    tracing::error!(
                        escrow_id = %escrow.id,
                        existing = %existing,
                        incoming = %gateway_payment_id,
                        "conflicting payment for already-funded escrow"
                    );
                    Err(AppError::ConflictingPayment {
                        existing: existing.to_string(),
                        incoming: gateway_payment_id.to_string(),
                    })
                }
                None => {
                    // Held without a payment id cannot happen through this
                    // ledger; refuse rather than guess.
                    Err(AppError::InternalError(anyhow::anyhow!(
                        "escrow {} is {} with no payment id",
                        escrow.id,
                        escrow.status.as_str()
                    )))
                }
            },
        }
    }

    /// Release held funds: Held -> Released, computing and persisting the
    /// split exactly once.
    pub async fn release(
        &self,
        escrow_id: Uuid,
        triggered_by: &str,
    ) -> Result<ReleaseOutcome, AppError> {
        let lock = self.lock_for(escrow_id);
        let _guard = lock.lock().await;

        let escrow = self
            .repository
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("escrow {escrow_id}")))?;

        let computed = settlement::compute_split(
            escrow.amount_minor,
            escrow.agent_id.is_some(),
            &self.settlement,
        );

        match escrow.status {
            EscrowStatus::Held => {
                self.repository.persist_release(escrow_id, &computed).await?;
                metrics::counter!("escrow_transitions_total", "to" => "released").increment(1);
                tracing::info!(
                    escrow_id = %escrow_id,
                    triggered_by = %triggered_by,
                    platform_fee = computed.platform_fee,
                    agent_commission = computed.agent_commission,
                    seller_net = computed.seller_net,
                    "escrow released"
                );
                let escrow = self
                    .repository
                    .get_escrow(escrow_id)
                    .await?
                    .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("escrow vanished")))?;
                Ok(ReleaseOutcome {
                    escrow,
                    split: computed,
                    newly_released: true,
                })
            }
            EscrowStatus::Released => {
                let stored = self.repository.get_split(escrow_id).await?.ok_or_else(|| {
                    AppError::InternalError(anyhow::anyhow!(
                        "released escrow {escrow_id} has no persisted split"
                    ))
                })?;
                if stored == computed {
                    Ok(ReleaseOutcome {
                        escrow,
                        split: stored,
                        newly_released: false,
                    })
                } else {
                    tracing::error!(
                        escrow_id = %escrow_id,
                        stored = ?stored,
                        computed = ?computed,
                        "recomputed split differs from persisted split"
                    );
                    Err(AppError::SplitMismatch)
                }
            }
            EscrowStatus::Pending => Err(AppError::EscrowNotFunded),
            EscrowStatus::Refunded => Err(AppError::TerminalStateViolation {
                current: "refunded".to_string(),
                requested: "released".to_string(),
            }),
        }
    }

    /// Refund held funds: Held -> Refunded. No split is produced.
    ///
    /// Returns false on an idempotent replay (already refunded).
    pub async fn refund(&self, escrow_id: Uuid, reason: &str) -> Result<bool, AppError> {
        let lock = self.lock_for(escrow_id);
        let _guard = lock.lock().await;

        let escrow = self
            .repository
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("escrow {escrow_id}")))?;

        match escrow.status {
            EscrowStatus::Held => {
                self.repository.persist_refund(escrow_id).await?;
                metrics::counter!("escrow_transitions_total", "to" => "refunded").increment(1);
                tracing::info!(escrow_id = %escrow_id, reason = %reason, "escrow refunded");
                Ok(true)
            }
            EscrowStatus::Refunded => Ok(false),
            // Buyer was never charged; there is nothing to refund.
            EscrowStatus::Pending => Err(AppError::EscrowNotFunded),
            EscrowStatus::Released => Err(AppError::TerminalStateViolation {
                current: "released".to_string(),
                requested: "refunded".to_string(),
            }),
        }
    }
}
