//! Provider webhook events, reduced to what settlement acts on.

use serde::{Deserialize, Serialize};

/// A webhook event after provider-specific parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// A charge reached a final state at the provider. The pushed status is
    /// deliberately not carried: the outcome is pulled through verification.
    ChargeCompleted { reference: String },
    TransferSucceeded { reference: String },
    /// Failed or reversed transfer.
    TransferFailed { reference: String },
    Ignored { event_type: String },
}

impl ProviderEvent {
    pub fn reference(&self) -> Option<&str> {
        match self {
            ProviderEvent::ChargeCompleted { reference }
            | ProviderEvent::TransferSucceeded { reference }
            | ProviderEvent::TransferFailed { reference } => Some(reference),
            ProviderEvent::Ignored { .. } => None,
        }
    }
}
