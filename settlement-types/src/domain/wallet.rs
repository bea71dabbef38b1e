//! Wallet domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::money::{Currency, Money};
use crate::error::DomainError;

define_id!(
    /// Unique identifier for a Wallet.
    WalletId
);

define_id!(
    /// A platform user: customer or vendor.
    UserId
);

/// Internal balance for one user in one currency.
///
/// `balance` is spendable; `pending_balance` is money reported as held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub balance: Money,
    pub pending_balance: Money,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Creates an empty, active wallet.
    pub fn new(user_id: UserId, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id: WalletId::new(),
            user_id,
            balance: Money::zero(currency),
            pending_balance: Money::zero(currency),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn currency(&self) -> Currency {
        self.balance.currency()
    }

    /// Credits (adds) money to the available balance.
    pub fn credit(&mut self, amount: Money) -> Result<(), DomainError> {
        if amount.amount() <= 0 {
            return Err(DomainError::InvalidAmount(amount.amount()));
        }
        self.balance = self.balance.checked_add(amount)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Debits money from the available balance, refusing to go below zero.
    pub fn debit(&mut self, amount: Money) -> Result<(), DomainError> {
        if amount.amount() <= 0 {
            return Err(DomainError::InvalidAmount(amount.amount()));
        }
        self.balance = self.balance.checked_sub(amount)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn has_sufficient_funds(&self, amount: &Money) -> bool {
        self.balance.covers(amount)
    }
}
