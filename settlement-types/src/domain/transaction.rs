//! Transaction domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::escrow::BookingId;
use super::money::{Currency, Money};
use super::wallet::UserId;
use crate::error::DomainError;

define_id!(
    /// Unique identifier for a Transaction.
    TransactionId
);

/// Open, schema-less key/value bag carried on transactions.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// What kind of money movement a transaction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Customer paying through an external provider
    Payment,
    /// Wallet withdrawal to a bank account
    Payout,
    /// Escrowed funds returned to the customer
    Refund,
    EscrowHold,
    /// Escrowed funds credited to the vendor
    EscrowRelease,
    Subscription,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Payment => "payment",
            TransactionKind::Payout => "payout",
            TransactionKind::Refund => "refund",
            TransactionKind::EscrowHold => "escrow_hold",
            TransactionKind::EscrowRelease => "escrow_release",
            TransactionKind::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment" => Ok(TransactionKind::Payment),
            "payout" => Ok(TransactionKind::Payout),
            "refund" => Ok(TransactionKind::Refund),
            "escrow_hold" => Ok(TransactionKind::EscrowHold),
            "escrow_release" => Ok(TransactionKind::EscrowRelease),
            "subscription" => Ok(TransactionKind::Subscription),
            _ => Err(DomainError::ValidationError(format!(
                "Unknown transaction type: {}",
                s
            ))),
        }
    }
}

/// Lifecycle status of a transaction.
///
/// `pending -> processing -> {success | failed | cancelled}`, and
/// `success -> refunded`. Re-entering the current status is allowed so
/// provider metadata can be refreshed; everything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Refunded,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal for the provider flow: no provider outcome may move it.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TransactionStatus::Pending | TransactionStatus::Processing
        )
    }

    /// Statuses from which `self` may be entered, including `self`.
    pub fn predecessors(&self) -> &'static [TransactionStatus] {
        use TransactionStatus::*;
        match self {
            Pending => &[Pending],
            Processing => &[Pending, Processing],
            Success => &[Pending, Processing, Success],
            Failed => &[Pending, Processing, Failed],
            Cancelled => &[Pending, Processing, Cancelled],
            Refunded => &[Success, Refunded],
        }
    }

    pub fn can_advance_to(&self, next: TransactionStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "processing" => Ok(TransactionStatus::Processing),
            "success" => Ok(TransactionStatus::Success),
            "failed" => Ok(TransactionStatus::Failed),
            "refunded" => Ok(TransactionStatus::Refunded),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            _ => Err(DomainError::ValidationError(format!(
                "Unknown transaction status: {}",
                s
            ))),
        }
    }
}

/// The payment providers the platform can route through.
///
/// This is the closed set of gateway variants; a new provider is a new
/// variant plus its gateway implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Paystack,
    Flutterwave,
    /// Wallet-to-wallet movements that never leave the platform
    Internal,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Paystack,
        ProviderKind::Flutterwave,
        ProviderKind::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Paystack => "paystack",
            ProviderKind::Flutterwave => "flutterwave",
            ProviderKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paystack" => Ok(ProviderKind::Paystack),
            "flutterwave" => Ok(ProviderKind::Flutterwave),
            "internal" => Ok(ProviderKind::Internal),
            _ => Err(DomainError::UnknownProvider(s.to_string())),
        }
    }
}

/// Platform fee for `amount` at `fee_bps` basis points, truncated toward zero.
pub fn platform_fee(amount: i64, fee_bps: u32) -> i64 {
    (i128::from(amount) * i128::from(fee_bps) / 10_000) as i64
}

/// A recorded money movement.
///
/// `amount`, `currency`, `fee` and `net_amount` are fixed at creation;
/// only status and provider fields change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Platform-generated idempotency key shared with providers
    pub reference: String,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub provider: ProviderKind,
    /// Gross amount in minor units
    pub amount: i64,
    pub currency: Currency,
    pub fee: i64,
    pub net_amount: i64,
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    #[serde(default)]
    pub provider_data: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Creates a new `pending` transaction with the fee locked in.
    ///
    /// # Validation
    /// - amount must be positive
    /// - fee must lie within `0..=amount`
    pub fn new(
        kind: TransactionKind,
        user_id: UserId,
        amount: Money,
        fee: i64,
        provider: ProviderKind,
        reference: impl Into<String>,
    ) -> Result<Self, DomainError> {
        if amount.amount() <= 0 {
            return Err(DomainError::InvalidAmount(amount.amount()));
        }
        if fee < 0 || fee > amount.amount() {
            return Err(DomainError::ValidationError(format!(
                "Fee {} outside of 0..={}",
                fee,
                amount.amount()
            )));
        }
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "Reference cannot be empty".into(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id: TransactionId::new(),
            reference,
            user_id,
            vendor_id: None,
            booking_id: None,
            kind,
            status: TransactionStatus::Pending,
            provider,
            amount: amount.amount(),
            currency: amount.currency(),
            fee,
            net_amount: amount.amount() - fee,
            description: String::new(),
            metadata: Metadata::new(),
            provider_ref: None,
            provider_data: Metadata::new(),
            paid_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Creates a customer payment, charging the platform fee.
    pub fn payment(
        user_id: UserId,
        amount: Money,
        fee_bps: u32,
        provider: ProviderKind,
        reference: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let fee = platform_fee(amount.amount(), fee_bps);
        Self::new(
            TransactionKind::Payment,
            user_id,
            amount,
            fee,
            provider,
            reference,
        )
    }

    pub fn with_vendor(mut self, vendor_id: Option<UserId>) -> Self {
        self.vendor_id = vendor_id;
        self
    }

    pub fn with_booking(mut self, booking_id: Option<BookingId>) -> Self {
        self.booking_id = booking_id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    /// The gross amount as Money.
    pub fn money(&self) -> Money {
        Money::new(self.amount, self.currency).unwrap_or(Money::zero(self.currency))
    }

    /// Reference of the credit that reverses this (payout) transaction.
    pub fn reversal_reference(&self) -> String {
        format!("reversal:{}", self.reference)
    }

    /// Moves to `next`, stamping `updated_at`.
    pub fn advance(&mut self, next: TransactionStatus) -> Result<(), DomainError> {
        if !self.status.can_advance_to(next) {
            return Err(DomainError::InvalidState(format!(
                "transaction {} cannot move from {} to {}",
                self.reference, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Applies the mutable fields of `incoming` (a later version of the same
    /// transaction). Returns false, leaving `self` untouched, when the status
    /// change is not a legal forward move.
    pub fn absorb(&mut self, incoming: &Transaction) -> bool {
        if !self.status.can_advance_to(incoming.status) {
            return false;
        }
        self.status = incoming.status;
        if incoming.provider_ref.is_some() {
            self.provider_ref = incoming.provider_ref.clone();
        }
        if !incoming.provider_data.is_empty() {
            self.provider_data = incoming.provider_data.clone();
        }
        if incoming.paid_at.is_some() {
            self.paid_at = incoming.paid_at;
        }
        self.updated_at = incoming.updated_at;
        true
    }
}
