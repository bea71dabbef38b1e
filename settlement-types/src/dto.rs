//! Request and response shapes for the settlement operations.

use serde::{Deserialize, Serialize};

use crate::domain::{
    BookingId, Currency, Metadata, ProviderKind, Transaction, TransactionId, UserId,
};

// ─────────────────────────────────────────────────────────────────────────────
// Payment DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Request to start a customer payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializePaymentRequest {
    /// Paying customer
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<BookingId>,
    /// Amount in minor units (kobo, cents)
    pub amount: i64,
    pub currency: Currency,
    #[serde(default)]
    pub description: String,
    /// Payer email forwarded to the provider
    pub email: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub metadata: Metadata,
    /// Hold the net amount in escrow until the booking completes
    #[serde(default)]
    pub use_escrow: bool,
    #[serde(default)]
    pub callback_url: String,
}

/// Response after a payment has been initialized with its provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializePaymentResponse {
    pub transaction_id: TransactionId,
    pub reference: String,
    /// Where the payer completes the charge
    pub authorization_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
    pub provider: ProviderKind,
}

// ─────────────────────────────────────────────────────────────────────────────
// Payout DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Destination bank account for a payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub bank_code: String,
    pub account_number: String,
    pub account_name: String,
}

impl BankDetails {
    pub fn validate(&self) -> Result<(), String> {
        if self.bank_code.trim().is_empty() {
            return Err("bank_code is required".into());
        }
        if self.account_number.trim().is_empty() {
            return Err("account_number is required".into());
        }
        if self.account_name.trim().is_empty() {
            return Err("account_name is required".into());
        }
        Ok(())
    }
}

/// Request to withdraw vendor wallet funds to a bank account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub vendor_id: UserId,
    /// Amount in minor units
    pub amount: i64,
    pub currency: Currency,
    #[serde(flatten)]
    pub bank: BankDetails,
}

/// Response after a payout has been accepted for transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutResponse {
    pub transaction: Transaction,
    /// Remaining available balance after the debit
    pub balance: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Escrow DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Request to return escrowed funds to the customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundEscrowRequest {
    pub reason: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Listing
// ─────────────────────────────────────────────────────────────────────────────

/// Pagination for history listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

impl Page {
    pub const MAX_LIMIT: i64 = 100;

    /// Clamps limit into `1..=MAX_LIMIT` and offset to non-negative.
    pub fn normalized(self) -> Self {
        Self {
            limit: self.limit.clamp(1, Self::MAX_LIMIT),
            offset: self.offset.max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
        }
    }
}
