use super::subscription::Subscription;
use super::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// Signals emitted by the billing flows for the host application to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BillingEvent {
    SubscriptionCharged {
        subscription: Subscription,
        transaction: Transaction,
    },
    /// `transaction` is absent when no charge could be attempted (no card on file).
    SubscriptionChargeFailed {
        subscription: Subscription,
        transaction: Option<Transaction>,
    },
    ThreedsCallbackSucceeded {
        transaction: Transaction,
    },
    ThreedsCallbackCanceled {
        transaction: Transaction,
    },
}

impl BillingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubscriptionCharged { .. } => "subscription_charged",
            Self::SubscriptionChargeFailed { .. } => "subscription_charge_failed",
            Self::ThreedsCallbackSucceeded { .. } => "threeds_callback_succeeded",
            Self::ThreedsCallbackCanceled { .. } => "threeds_callback_canceled",
        }
    }
}
