//! Escrow storage port.

use chrono::{DateTime, Utc};

use crate::domain::{BookingId, EscrowAccount, EscrowStatus};
use crate::error::RepoError;

/// Persistence for escrow accounts, one per booking.
#[async_trait::async_trait]
pub trait EscrowStore: Send + Sync + 'static {
    /// Inserts a new escrow. A second escrow for the same booking is a
    /// `Conflict`.
    async fn insert_escrow(&self, escrow: &EscrowAccount) -> Result<(), RepoError>;

    async fn find_escrow_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<EscrowAccount>, RepoError>;

    /// Atomically moves the booking's escrow from `from` to `to`.
    ///
    /// Returns `None` when the escrow is not currently in `from`. Moving to
    /// `Released` stamps `released_at` with `at`.
    async fn transition_escrow(
        &self,
        booking_id: BookingId,
        from: EscrowStatus,
        to: EscrowStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<EscrowAccount>, RepoError>;
}
