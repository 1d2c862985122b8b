use crate::models::WalletMovement;
use crate::money::CommissionSplit;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Escrow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    /// Payment intent created, gateway has not confirmed the charge
    Pending,
    /// Funds captured and held until the delivery segment completes
    Held,
    Released,
    Refunded,
    Failed,
}

impl EscrowStatus {
    pub const ALL: [EscrowStatus; 5] = [
        EscrowStatus::Pending,
        EscrowStatus::Held,
        EscrowStatus::Released,
        EscrowStatus::Refunded,
        EscrowStatus::Failed,
    ];

    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(EscrowStatus::Pending),
            "HELD" => Ok(EscrowStatus::Held),
            "RELEASED" => Ok(EscrowStatus::Released),
            "REFUNDED" => Ok(EscrowStatus::Refunded),
            "FAILED" => Ok(EscrowStatus::Failed),
            _ => Err(format!("Invalid escrow status: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "PENDING",
            EscrowStatus::Held => "HELD",
            EscrowStatus::Released => "RELEASED",
            EscrowStatus::Refunded => "REFUNDED",
            EscrowStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Released | EscrowStatus::Refunded | EscrowStatus::Failed
        )
    }

    /// States from which a transition into `self` is legal.
    ///
    /// RELEASED is reached from HELD; releasing a PENDING escrow is a
    /// separately gated degraded path and is not listed here.
    pub fn predecessors(&self) -> &'static [EscrowStatus] {
        match self {
            EscrowStatus::Pending => &[],
            EscrowStatus::Held => &[EscrowStatus::Pending],
            EscrowStatus::Released => &[EscrowStatus::Held],
            EscrowStatus::Refunded => &[EscrowStatus::Pending, EscrowStatus::Held],
            EscrowStatus::Failed => &[EscrowStatus::Pending, EscrowStatus::Held],
        }
    }

    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl From<String> for EscrowStatus {
    fn from(s: String) -> Self {
        Self::from_str(&s).unwrap_or(EscrowStatus::Pending)
    }
}

impl From<EscrowStatus> for String {
    fn from(status: EscrowStatus) -> Self {
        status.as_str().to_string()
    }
}

/// One funded delivery segment held in escrow
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EscrowTransaction {
    pub id: Uuid,
    /// Gateway payment-intent reference
    pub payment_intent_id: String,
    pub client_id: Uuid,
    pub delivery_id: Uuid,
    /// None means the whole announcement
    pub segment_number: Option<i32>,
    pub total_amount: Decimal,
    pub commission_amount: Decimal,
    pub courier_amount: Decimal,
    pub status: String, // Stored as TEXT, use EscrowStatus enum for type safety
    /// Set only on release
    pub courier_id: Option<Uuid>,
    pub refund_id: Option<String>,
    pub notes: Option<String>,
    /// Released while still PENDING (webhook confirmation missed)
    pub unconfirmed_release: bool,
    /// Set while a gateway refund is outstanding; release is refused meanwhile
    pub refund_requested_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub held_since: Option<NaiveDateTime>,
    pub released_at: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}

impl EscrowTransaction {
    /// Build a PENDING escrow for a freshly created payment intent
    pub fn new(new: NewEscrow) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4(),
            payment_intent_id: new.payment_intent_id,
            client_id: new.client_id,
            delivery_id: new.delivery_id,
            segment_number: new.segment_number,
            total_amount: new.split.total,
            commission_amount: new.split.commission,
            courier_amount: new.split.courier_amount,
            status: EscrowStatus::Pending.as_str().to_string(),
            courier_id: None,
            refund_id: None,
            notes: None,
            unconfirmed_release: false,
            refund_requested_at: None,
            created_at: now,
            held_since: None,
            released_at: None,
            updated_at: now,
        }
    }

    /// Get status as an enum
    pub fn status_enum(&self) -> EscrowStatus {
        EscrowStatus::from_str(&self.status).unwrap_or(EscrowStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        self.status_enum().is_terminal()
    }

    pub fn has_refund_claim(&self) -> bool {
        self.refund_requested_at.is_some()
    }

    pub fn is_partial_delivery(&self) -> bool {
        self.segment_number.map(|s| s > 0).unwrap_or(false)
    }

    /// Key used to serialize release and refund on one escrow slot
    pub fn slot(&self) -> EscrowSlot {
        EscrowSlot {
            delivery_id: self.delivery_id,
            segment_number: self.segment_number,
        }
    }

    /// Check that the commission split is internally consistent
    pub fn validate(&self) -> Result<(), String> {
        if self.total_amount <= Decimal::ZERO {
            return Err("Total must be greater than zero".to_string());
        }
        if self.commission_amount < Decimal::ZERO || self.courier_amount < Decimal::ZERO {
            return Err("Commission and courier amount must not be negative".to_string());
        }
        if self.commission_amount + self.courier_amount != self.total_amount {
            return Err(format!(
                "Split mismatch: {} + {} != {}",
                self.commission_amount, self.courier_amount, self.total_amount
            ));
        }
        Ok(())
    }
}

/// Delivery / segment pair an escrow funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscrowSlot {
    pub delivery_id: Uuid,
    pub segment_number: Option<i32>,
}

/// Insert payload for a new PENDING escrow
#[derive(Debug, Clone)]
pub struct NewEscrow {
    pub payment_intent_id: String,
    pub client_id: Uuid,
    pub delivery_id: Uuid,
    pub segment_number: Option<i32>,
    pub split: CommissionSplit,
}

/// Extra columns written alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub note: Option<String>,
    pub refund_id: Option<String>,
}

impl TransitionUpdate {
    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            refund_id: None,
        }
    }
}

/// Listing filters for escrows
#[derive(Debug, Clone, Copy)]
pub enum EscrowFilter {
    Delivery(Uuid),
    Client(Uuid),
    Courier(Uuid),
    Status(EscrowStatus),
}

/// Result of opening an escrow: the record plus what the client needs to pay
#[derive(Debug, Clone, Serialize)]
pub struct OpenedEscrow {
    pub escrow: EscrowTransaction,
    pub client_secret: String,
}

/// Store-level release of one escrow to a courier
#[derive(Debug, Clone)]
pub struct EscrowRelease {
    pub escrow_id: Uuid,
    pub courier_id: Uuid,
    /// Accept a PENDING escrow (confirmation webhook missed)
    pub allow_unconfirmed: bool,
    /// Ledger description of the courier credit
    pub description: String,
}

/// Escrow after release together with the courier credit it produced
#[derive(Debug, Clone)]
pub struct ReleasedEscrow {
    pub escrow: EscrowTransaction,
    pub movement: WalletMovement,
    pub was_unconfirmed: bool,
}

/// Aggregates over all escrows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscrowStats {
    pub pending: i64,
    pub held: i64,
    pub released: i64,
    pub refunded: i64,
    pub failed: i64,
    /// Platform commission earned on RELEASED escrows
    pub total_commission_released: Decimal,
    /// Client money currently held (PENDING + HELD totals)
    pub total_in_escrow: Decimal,
}

impl EscrowStats {
    pub fn count_for(&mut self, status: EscrowStatus) -> &mut i64 {
        match status {
            EscrowStatus::Pending => &mut self.pending,
            EscrowStatus::Held => &mut self.held,
            EscrowStatus::Released => &mut self.released,
            EscrowStatus::Refunded => &mut self.refunded,
            EscrowStatus::Failed => &mut self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::split_commission;

    fn sample() -> EscrowTransaction {
        EscrowTransaction::new(NewEscrow {
            payment_intent_id: "pi_123".to_string(),
            client_id: Uuid::new_v4(),
            delivery_id: Uuid::new_v4(),
            segment_number: Some(1),
            split: split_commission(Decimal::new(7500, 2), Decimal::new(10, 2)),
        })
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in EscrowStatus::ALL {
            assert_eq!(EscrowStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(EscrowStatus::from_str("LOST").is_err());
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in EscrowStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in EscrowStatus::ALL {
                assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(EscrowStatus::Pending.can_transition_to(EscrowStatus::Held));
        assert!(EscrowStatus::Held.can_transition_to(EscrowStatus::Released));
        assert!(EscrowStatus::Held.can_transition_to(EscrowStatus::Refunded));
        assert!(EscrowStatus::Pending.can_transition_to(EscrowStatus::Failed));
        assert!(!EscrowStatus::Held.can_transition_to(EscrowStatus::Pending));
    }

    #[test]
    fn test_new_escrow_is_pending_and_consistent() {
        let escrow = sample();
        assert_eq!(escrow.status_enum(), EscrowStatus::Pending);
        assert!(escrow.validate().is_ok());
        assert!(escrow.is_partial_delivery());
        assert_eq!(escrow.commission_amount, Decimal::new(750, 2));
        assert_eq!(escrow.courier_amount, Decimal::new(6750, 2));
    }
}
