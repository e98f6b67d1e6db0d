//! Domain records owned by the escrow engine.
//!
//! All money amounts are integers in the smallest currency unit (paise for
//! INR); floating point never touches a balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a payment order was created.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    Subscription,
    Valuation,
    Matchmaking,
    Acquisition,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::Subscription => "subscription",
            PaymentPurpose::Valuation => "valuation",
            PaymentPurpose::Matchmaking => "matchmaking",
            PaymentPurpose::Acquisition => "acquisition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(PaymentPurpose::Subscription),
            "valuation" => Some(PaymentPurpose::Valuation),
            "matchmaking" => Some(PaymentPurpose::Matchmaking),
            "acquisition" => Some(PaymentPurpose::Acquisition),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Attempted,
    Paid,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Attempted => "attempted",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(OrderStatus::Created),
            "attempted" => Some(OrderStatus::Attempted),
            "paid" => Some(OrderStatus::Paid),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    /// Paid and Failed orders are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Failed)
    }
}

/// A gateway-side payment order and its local mirror.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentOrder {
    pub id: Uuid,
    pub gateway_order_id: String,
    pub buyer_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    /// Unique tracking id sent to the gateway: `{purpose}_{entity}_{unix_ts}`.
    pub receipt: String,
    pub status: OrderStatus,
    pub purpose: PaymentPurpose,
    /// Opaque key/value map echoed back by the gateway in webhooks.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Held,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Held => "held",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EscrowStatus::Pending),
            "held" => Some(EscrowStatus::Held),
            "released" => Some(EscrowStatus::Released),
            "refunded" => Some(EscrowStatus::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded)
    }
}

/// Post-release payout reconciliation progress. Never set before `released`
/// and never feeds back into the escrow status machine.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    InProgress,
    Settled,
    Incomplete,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::InProgress => "in_progress",
            SettlementState::Settled => "settled",
            SettlementState::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(SettlementState::InProgress),
            "settled" => Some(SettlementState::Settled),
            "incomplete" => Some(SettlementState::Incomplete),
            _ => None,
        }
    }
}

/// The money-holding record. Status only moves forward along
/// `pending -> held -> {released, refunded}`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EscrowTransaction {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub agent_id: Option<Uuid>,
    /// The business/listing being transacted.
    pub subject_id: Uuid,
    pub amount_minor: i64,
    pub status: EscrowStatus,
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    pub settlement_state: Option<SettlementState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable breakdown of one release event. The three parts always sum
/// exactly to the escrow's `amount_minor`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SettlementSplit {
    pub platform_fee: i64,
    pub agent_commission: i64,
    pub seller_net: i64,
}

impl SettlementSplit {
    pub fn total(&self) -> i64 {
        self.platform_fee + self.agent_commission + self.seller_net
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BeneficiaryType {
    Seller,
    Agent,
    Platform,
}

impl BeneficiaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeneficiaryType::Seller => "seller",
            BeneficiaryType::Agent => "agent",
            BeneficiaryType::Platform => "platform",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seller" => Some(BeneficiaryType::Seller),
            "agent" => Some(BeneficiaryType::Agent),
            "platform" => Some(BeneficiaryType::Platform),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PayoutStatus::Pending),
            "processing" => Some(PayoutStatus::Processing),
            "completed" => Some(PayoutStatus::Completed),
            "failed" => Some(PayoutStatus::Failed),
            _ => None,
        }
    }
}

/// One outbound transfer attempt. A retried transfer is a NEW row with a new
/// `reference_id`; reference ids are never reused.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PayoutRequest {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub beneficiary_type: BeneficiaryType,
    pub amount_minor: i64,
    /// Bank account or VPA; validated non-empty before submission.
    pub destination: String,
    pub status: PayoutStatus,
    pub gateway_payout_id: Option<String>,
    /// Idempotency key sent to the gateway: `{escrow_id}_{beneficiary}_{attempt}`.
    pub reference_id: String,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PayoutRequest {
    pub fn reference_id_for(escrow_id: Uuid, beneficiary: BeneficiaryType, attempt: u32) -> String {
        format!("{}_{}_{}", escrow_id, beneficiary.as_str(), attempt)
    }
}

/// Dedup record for at-least-once webhook delivery. Inserted before the
/// handler runs, flipped to `processed` only after it succeeds.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
}
