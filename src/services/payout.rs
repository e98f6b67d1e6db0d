//! Payout processor.
//!
//! Turns a settlement split into payout submissions, retries transient
//! failures under fresh reference ids, and reconciles the asynchronous
//! payout webhooks. A synchronous HTTP 200 from the gateway only ever moves
//! a payout to `processing`; `completed` comes from the webhook.

use anyhow::anyhow;
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::PayoutRetryConfig;
use crate::error::AppError;
use crate::models::{
    BeneficiaryType, EscrowTransaction, PayoutRequest, PayoutStatus, SettlementSplit,
    SettlementState,
};
use crate::services::events::PayoutEntity;
use crate::services::gateway::GatewayClient;
use crate::services::repository::DynRepository;

#[derive(Clone)]
pub struct PayoutProcessor {
    repository: DynRepository,
    gateway: GatewayClient,
    retry: PayoutRetryConfig,
    platform_destination: String,
}

impl PayoutProcessor {
    pub fn new(
        repository: DynRepository,
        gateway: GatewayClient,
        retry: PayoutRetryConfig,
        platform_destination: String,
    ) -> Self {
        Self {
            repository,
            gateway,
            retry,
            platform_destination,
        }
    }

    /// Issue payouts for every non-zero component of a freshly released
    /// escrow. Components with no destination on file are recorded as failed
    /// with no retry; the rest are submitted independently, so one bad
    /// beneficiary never blocks the others.
    pub async fn disburse(
        &self,
        escrow: &EscrowTransaction,
        split: &SettlementSplit,
    ) -> Result<Vec<PayoutRequest>, AppError> {
        let currency = self
            .repository
            .get_order_by_gateway_id(&escrow.gateway_order_id)
            .await?
            .map(|o| o.currency)
            .unwrap_or_else(|| "INR".to_string());

        let mut components: Vec<(BeneficiaryType, i64, Option<String>)> = Vec::new();

        if split.seller_net > 0 {
            let destination = self.repository.payout_destination(escrow.seller_id).await?;
            components.push((BeneficiaryType::Seller, split.seller_net, destination));
        }
        if split.agent_commission > 0 {
            let destination = match escrow.agent_id {
                Some(agent_id) => self.repository.payout_destination(agent_id).await?,
                None => None,
            };
            components.push((BeneficiaryType::Agent, split.agent_commission, destination));
        }
        if split.platform_fee > 0 {
            components.push((
                BeneficiaryType::Platform,
                split.platform_fee,
                Some(self.platform_destination.clone()),
            ));
        }

        let mut submitted = Vec::new();
        for (beneficiary, amount, destination) in components {
            match destination.filter(|d| !d.is_empty()) {
                Some(destination) => {
                    match self
                        .submit_with_retry(escrow.id, beneficiary, amount, &destination, &currency)
                        .await
                    {
                        Ok(payout) => submitted.push(payout),
                        Err(err) => {
                            tracing::error!(
                                escrow_id = %escrow.id,
                                beneficiary = beneficiary.as_str(),
                                error = %err,
                                "payout submission gave up; awaiting manual retry"
                            );
                        }
                    }
                }
                None => {
                    self.record_missing_destination(escrow.id, beneficiary, amount)
                        .await?;
                }
            }
        }
        Ok(submitted)
    }

    /// `payout.processed` webhook: Processing -> Completed, and when every
    /// component of the split has a completed payout, the escrow is fully
    /// settled.
    pub async fn reconcile_processed(&self, entity: &PayoutEntity) -> Result<(), AppError> {
        let payout = self
            .repository
            .get_payout_by_reference(&entity.reference_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow!("no payout for reference {}", entity.reference_id))
            })?;

        match payout.status {
            PayoutStatus::Completed => return Ok(()),
            PayoutStatus::Processing | PayoutStatus::Pending => {
                self.repository.mark_payout_completed(payout.id).await?;
                metrics::counter!("payouts_total", "status" => "completed").increment(1);
                tracing::info!(
                    payout_id = %payout.id,
                    reference_id = %payout.reference_id,
                    "payout completed"
                );
            }
            PayoutStatus::Failed => {
                // The gateway confirmed a payout we had written off. Surface
                // it; never guess a correction.
                tracing::error!(
                    payout_id = %payout.id,
                    reference_id = %payout.reference_id,
                    "payout.processed received for a failed payout"
                );
                return Err(AppError::InternalError(anyhow!(
                    "payout {} confirmed after local failure",
                    payout.id
                )));
            }
        }

        self.maybe_mark_settled(payout.escrow_id).await
    }

    /// `payout.failed` webhook: Processing -> Failed. Returns the failed
    /// payout when it is still eligible for resubmission under the global
    /// attempt cap; past the cap the escrow is flagged for manual recovery
    /// and stays Released.
    pub async fn reconcile_failed(
        &self,
        entity: &PayoutEntity,
    ) -> Result<Option<PayoutRequest>, AppError> {
        let payout = self
            .repository
            .get_payout_by_reference(&entity.reference_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow!("no payout for reference {}", entity.reference_id))
            })?;

        if payout.status == PayoutStatus::Completed {
            tracing::warn!(
                payout_id = %payout.id,
                "stale payout.failed for a completed payout, ignoring"
            );
            return Ok(None);
        }

        let reason = entity
            .failure_reason
            .clone()
            .unwrap_or_else(|| "payout failed at gateway".to_string());
        self.repository.mark_payout_failed(payout.id, &reason).await?;
        metrics::counter!("payouts_total", "status" => "failed").increment(1);
        tracing::warn!(
            payout_id = %payout.id,
            reference_id = %payout.reference_id,
            reason = %reason,
            "payout failed at gateway"
        );

        let attempts = self
            .repository
            .last_attempt(payout.escrow_id, payout.beneficiary_type)
            .await?;
        if attempts >= self.retry.max_total_attempts {
            self.escalate(payout.escrow_id, payout.beneficiary_type).await?;
            return Ok(None);
        }
        // Re-read so the caller sees the Failed status just written.
        self.repository.get_payout(payout.id).await
    }

    /// Resubmit a failed payout (same beneficiary, amount and destination,
    /// new reference id). Sole re-entry point for externally scheduled
    /// retries.
    pub async fn resubmit(&self, payout: &PayoutRequest) -> Result<PayoutRequest, AppError> {
        if payout.status != PayoutStatus::Failed {
            return Err(AppError::InvalidRequest(anyhow!(
                "payout {} is {}, only failed payouts can be retried",
                payout.id,
                payout.status.as_str()
            )));
        }

        let currency = match self.repository.get_escrow(payout.escrow_id).await? {
            Some(escrow) => self
                .repository
                .get_order_by_gateway_id(&escrow.gateway_order_id)
                .await?
                .map(|o| o.currency)
                .unwrap_or_else(|| "INR".to_string()),
            None => "INR".to_string(),
        };

        self.submit_with_retry(
            payout.escrow_id,
            payout.beneficiary_type,
            payout.amount_minor,
            &payout.destination,
            &currency,
        )
        .await
    }

    pub async fn retry_payout(&self, payout_id: Uuid) -> Result<PayoutRequest, AppError> {
        let payout = self
            .repository
            .get_payout(payout_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow!("payout {payout_id}")))?;
        self.resubmit(&payout).await
    }

    /// Submit one logical payout, retrying transient failures with
    /// exponential backoff. Every attempt persists its own row under a fresh
    /// reference id before the wire call, so the attempt history stays
    /// visible and reference ids are never reused.
    async fn submit_with_retry(
        &self,
        escrow_id: Uuid,
        beneficiary: BeneficiaryType,
        amount_minor: i64,
        destination: &str,
        currency: &str,
    ) -> Result<PayoutRequest, AppError> {
        let mut submission_failures = 0u32;
        loop {
            let attempt = self
                .repository
                .last_attempt(escrow_id, beneficiary)
                .await?
                + 1;
            if attempt > self.retry.max_total_attempts {
                self.escalate(escrow_id, beneficiary).await?;
                return Err(AppError::InternalError(anyhow!(
                    "payout attempt cap ({}) reached for escrow {} / {}",
                    self.retry.max_total_attempts,
                    escrow_id,
                    beneficiary.as_str()
                )));
            }

            let now = Utc::now();
            let payout = PayoutRequest {
                id: Uuid::new_v4(),
                escrow_id,
                beneficiary_type: beneficiary,
                amount_minor,
                destination: destination.to_string(),
                status: PayoutStatus::Pending,
                gateway_payout_id: None,
                reference_id: PayoutRequest::reference_id_for(escrow_id, beneficiary, attempt),
                attempt,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            self.repository.insert_payout(&payout).await?;

            match self
                .gateway
                .create_payout(
                    amount_minor,
                    currency,
                    &payout.reference_id,
                    destination,
                    beneficiary,
                )
                .await
            {
                Ok(remote) => {
                    self.repository
                        .mark_payout_processing(payout.id, &remote.id)
                        .await?;
                    metrics::counter!("payouts_total", "status" => "processing").increment(1);
                    return self
                        .repository
                        .get_payout(payout.id)
                        .await?
                        .ok_or_else(|| AppError::InternalError(anyhow!("payout vanished")));
                }
                Err(err) if err.is_transient() => {
                    self.repository
                        .mark_payout_failed(payout.id, &err.to_string())
                        .await?;
                    submission_failures += 1;
                    if submission_failures > self.retry.max_submission_retries {
                        tracing::error!(
                            escrow_id = %escrow_id,
                            beneficiary = beneficiary.as_str(),
                            "payout submission retries exhausted"
                        );
                        return Err(err);
                    }
                    let backoff = self.backoff(submission_failures);
                    tracing::warn!(
                        escrow_id = %escrow_id,
                        beneficiary = beneficiary.as_str(),
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient payout failure, retrying under a new reference id"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    self.repository
                        .mark_payout_failed(payout.id, &err.to_string())
                        .await?;
                    tracing::error!(
                        escrow_id = %escrow_id,
                        beneficiary = beneficiary.as_str(),
                        error = %err,
                        "payout permanently rejected by gateway"
                    );
                    return Err(err);
                }
            }
        }
    }

    fn backoff(&self, failure_count: u32) -> Duration {
        let exp = self
            .retry
            .initial_backoff_ms
            .saturating_mul(1u64 << (failure_count - 1).min(16));
        Duration::from_millis(exp.min(self.retry.max_backoff_ms))
    }

    async fn record_missing_destination(
        &self,
        escrow_id: Uuid,
        beneficiary: BeneficiaryType,
        amount_minor: i64,
    ) -> Result<(), AppError> {
        let attempt = self
            .repository
            .last_attempt(escrow_id, beneficiary)
            .await?
            + 1;
        let now = Utc::now();
        let payout = PayoutRequest {
            id: Uuid::new_v4(),
            escrow_id,
            beneficiary_type: beneficiary,
            amount_minor,
            destination: String::new(),
            status: PayoutStatus::Failed,
            gateway_payout_id: None,
            reference_id: PayoutRequest::reference_id_for(escrow_id, beneficiary, attempt),
            attempt,
            last_error: Some(
                AppError::MissingBeneficiaryDetails(beneficiary.as_str().to_string()).to_string(),
            ),
            created_at: now,
            updated_at: now,
        };
        self.repository.insert_payout(&payout).await?;
        self.repository
            .set_settlement_state(escrow_id, SettlementState::Incomplete)
            .await?;
        tracing::error!(
            escrow_id = %escrow_id,
            beneficiary = beneficiary.as_str(),
            "no payout destination on file; requires user action, not retried"
        );
        Ok(())
    }

    async fn escalate(
        &self,
        escrow_id: Uuid,
        beneficiary: BeneficiaryType,
    ) -> Result<(), AppError> {
        self.repository
            .set_settlement_state(escrow_id, SettlementState::Incomplete)
            .await?;
        // Funds already left escrow; this is a payout-recovery problem, not
        // an escrow-state problem. The escrow stays Released.
        tracing::error!(
            escrow_id = %escrow_id,
            beneficiary = beneficiary.as_str(),
            "payout attempt cap reached; escalating for manual intervention"
        );
        Ok(())
    }

    /// Mark the escrow Settled once every non-zero split component has a
    /// completed payout.
    async fn maybe_mark_settled(&self, escrow_id: Uuid) -> Result<(), AppError> {
        let Some(split) = self.repository.get_split(escrow_id).await? else {
            return Ok(());
        };
        let payouts = self.repository.payouts_for_escrow(escrow_id).await?;

        let completed = |beneficiary: BeneficiaryType, amount: i64| {
            amount == 0
                || payouts.iter().any(|p| {
                    p.beneficiary_type == beneficiary
                        && p.status == PayoutStatus::Completed
                        && p.amount_minor == amount
                })
        };

        if completed(BeneficiaryType::Seller, split.seller_net)
            && completed(BeneficiaryType::Agent, split.agent_commission)
            && completed(BeneficiaryType::Platform, split.platform_fee)
        {
            self.repository
                .set_settlement_state(escrow_id, SettlementState::Settled)
                .await?;
            tracing::info!(escrow_id = %escrow_id, "escrow fully settled");
        }
        Ok(())
    }
}
