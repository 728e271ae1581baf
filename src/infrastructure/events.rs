use crate::domain::events::BillingEvent;
use crate::domain::ports::EventSink;
use async_trait::async_trait;
use tracing::info;

/// Publishes events to the log. Used when no host application listens.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: BillingEvent) {
        match &event {
            BillingEvent::SubscriptionCharged {
                subscription,
                transaction,
            } => info!(
                event = event.name(),
                subscription_id = %subscription.id,
                transaction_id = %transaction.id,
                amount = %transaction.amount,
                "subscription charged"
            ),
            BillingEvent::SubscriptionChargeFailed {
                subscription,
                transaction,
            } => info!(
                event = event.name(),
                subscription_id = %subscription.id,
                transaction_id = ?transaction.as_ref().map(|tx| tx.id),
                "subscription charge failed"
            ),
            BillingEvent::ThreedsCallbackSucceeded { transaction }
            | BillingEvent::ThreedsCallbackCanceled { transaction } => info!(
                event = event.name(),
                transaction_id = %transaction.id,
                status = %transaction.status,
                "3-D Secure callback handled"
            ),
        }
    }
}
