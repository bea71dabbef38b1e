//! Escrow domain model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::money::{Currency, Money};
use super::transaction::{Transaction, TransactionId};
use super::wallet::UserId;
use crate::error::DomainError;

define_id!(
    /// Unique identifier for an EscrowAccount.
    EscrowId
);

define_id!(
    /// The booking an escrow protects.
    BookingId
);

/// Release policy applied when none is given.
pub const DEFAULT_RELEASE_CONDITION: &str = "service_completed";

/// Status of an escrow hold. `Released`, `Refunded` and `Expired` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    Released,
    Disputed,
    Refunded,
    Expired,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Held => "held",
            EscrowStatus::Released => "released",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Released | EscrowStatus::Refunded | EscrowStatus::Expired
        )
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscrowStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(EscrowStatus::Held),
            "released" => Ok(EscrowStatus::Released),
            "disputed" => Ok(EscrowStatus::Disputed),
            "refunded" => Ok(EscrowStatus::Refunded),
            "expired" => Ok(EscrowStatus::Expired),
            _ => Err(DomainError::ValidationError(format!(
                "Unknown escrow status: {}",
                s
            ))),
        }
    }
}

/// Funds collected for one booking, held until released to the vendor or
/// refunded to the customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub id: EscrowId,
    /// The payment that funded this hold
    pub transaction_id: TransactionId,
    pub booking_id: BookingId,
    pub customer_id: UserId,
    pub vendor_id: UserId,
    pub amount: i64,
    pub currency: Currency,
    pub status: EscrowStatus,
    pub release_condition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EscrowAccount {
    /// Opens a `held` escrow funded by `funding`.
    ///
    /// # Validation
    /// - amount must be positive and in the funding currency
    /// - amount cannot exceed what the funding transaction collected
    pub fn open(
        funding: &Transaction,
        booking_id: BookingId,
        customer_id: UserId,
        vendor_id: UserId,
        amount: Money,
        release_condition: impl Into<String>,
        expiry_days: i64,
    ) -> Result<Self, DomainError> {
        if amount.amount() <= 0 {
            return Err(DomainError::InvalidAmount(amount.amount()));
        }
        if amount.currency() != funding.currency {
            return Err(DomainError::CurrencyMismatch {
                expected: funding.currency,
                got: amount.currency(),
            });
        }
        if amount.amount() > funding.amount {
            return Err(DomainError::ValidationError(format!(
                "Escrow amount {} exceeds funding amount {}",
                amount.amount(),
                funding.amount
            )));
        }

        let now = Utc::now();
        Ok(Self {
            id: EscrowId::new(),
            transaction_id: funding.id,
            booking_id,
            customer_id,
            vendor_id,
            amount: amount.amount(),
            currency: amount.currency(),
            status: EscrowStatus::Held,
            release_condition: release_condition.into(),
            dispute_id: None,
            expires_at: now + Duration::days(expiry_days),
            released_at: None,
            created_at: now,
        })
    }

    pub fn money(&self) -> Money {
        Money::new(self.amount, self.currency).unwrap_or(Money::zero(self.currency))
    }

    /// Fails unless the escrow can still be released or refunded.
    pub fn ensure_held(&self) -> Result<(), DomainError> {
        if self.status != EscrowStatus::Held {
            return Err(DomainError::InvalidState(format!(
                "escrow for booking {} is {}, not held",
                self.booking_id, self.status
            )));
        }
        Ok(())
    }

    /// Ledger reference of the vendor credit.
    pub fn release_reference(&self) -> String {
        format!("release:{}", self.booking_id)
    }

    /// Ledger reference of the customer credit.
    pub fn refund_reference(&self) -> String {
        format!("refund:{}", self.booking_id)
    }
}
