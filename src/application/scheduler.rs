use super::engine::BillingEngine;
use crate::domain::card::CardId;
use crate::domain::events::BillingEvent;
use crate::domain::plan::LineItem;
use crate::domain::subscription::{Subscription, SubscriptionId};
use crate::domain::transaction::{
    NewTransaction, Transaction, TransactionId, TransactionKind, TransactionStatus,
};
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    Charged,
    Failed,
    /// The billable has no stored card; nothing was sent to the gateway.
    NoCard,
    /// No longer due when its turn came.
    Skipped,
    /// The gateway may hold a capture the local stores do not reflect. The
    /// subscription is not charged again until the period is reconciled.
    Unreconciled,
}

impl ChargeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Charged => "charged",
            Self::Failed => "failed",
            Self::NoCard => "no_card",
            Self::Skipped => "skipped",
            Self::Unreconciled => "unreconciled",
        }
    }
}

impl fmt::Display for ChargeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one due subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueCharge {
    pub subscription_id: SubscriptionId,
    pub outcome: ChargeOutcome,
    pub transaction_id: Option<TransactionId>,
    pub message: Option<String>,
}

impl DueCharge {
    fn new(subscription_id: SubscriptionId, outcome: ChargeOutcome) -> Self {
        Self {
            subscription_id,
            outcome,
            transaction_id: None,
            message: None,
        }
    }

    fn transaction(mut self, id: TransactionId) -> Self {
        self.transaction_id = Some(id);
        self
    }

    fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Charges every subscription whose next charge date has passed.
///
/// Subscriptions are processed one at a time in id order. A failing item is
/// reported and the run moves on; the subscription keeps its charge date and
/// is picked up again by the next run. A period that already has a live charge
/// is never sent to the gateway twice.
pub struct DueBillingScheduler {
    engine: Arc<BillingEngine>,
    running: Mutex<()>,
}

impl DueBillingScheduler {
    pub fn new(engine: Arc<BillingEngine>) -> Self {
        Self {
            engine,
            running: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<Vec<DueCharge>> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| BillingError::AlreadyRunning("due billing"))?;

        let due = self
            .engine
            .stores()
            .subscriptions
            .list_due(self.engine.now())
            .await?;
        info!(due = due.len(), "due billing started");

        let mut report = Vec::with_capacity(due.len());
        for subscription in due {
            report.push(self.bill(subscription.id).await);
        }

        let charged = report
            .iter()
            .filter(|item| item.outcome == ChargeOutcome::Charged)
            .count();
        let unreconciled = report
            .iter()
            .filter(|item| item.outcome == ChargeOutcome::Unreconciled)
            .count();
        info!(processed = report.len(), charged, unreconciled, "due billing finished");
        Ok(report)
    }

    async fn bill(&self, id: SubscriptionId) -> DueCharge {
        let engine = &self.engine;

        // Re-read: an earlier item or another flow may have touched it.
        let subscription = match engine.stores().subscriptions.get(id).await {
            Ok(Some(subscription)) => subscription,
            Ok(None) => return DueCharge::new(id, ChargeOutcome::Skipped).message("subscription removed"),
            Err(e) => {
                error!(subscription_id = %id, error = %e, "due charge aborted");
                return DueCharge::new(id, ChargeOutcome::Failed).message(e.to_string());
            }
        };
        if !subscription.is_due(engine.now()) {
            return DueCharge::new(id, ChargeOutcome::Skipped).message("no longer due");
        }

        match self.period_charge(&subscription).await {
            Ok(Some(earlier)) if earlier.status == TransactionStatus::Pending => {
                error!(
                    subscription_id = %id,
                    transaction_id = %earlier.id,
                    "charge for this period never completed locally, reconcile manually"
                );
                return DueCharge::new(id, ChargeOutcome::Unreconciled)
                    .transaction(earlier.id)
                    .message("charge for this period is still pending");
            }
            Ok(Some(earlier)) => {
                info!(
                    subscription_id = %id,
                    transaction_id = %earlier.id,
                    "period already charged, recording the next charge date"
                );
                let charged_at = earlier.created_at;
                return self.record_period(subscription, earlier, charged_at).await;
            }
            Ok(None) => {}
            Err(e) => return self.failed(subscription, None, e).await,
        }

        let card = match engine.stores().cards.latest_for(subscription.billable_id).await {
            Ok(Some(card)) => card,
            Ok(None) => {
                warn!(subscription_id = %id, billable_id = %subscription.billable_id, "no card on file");
                engine
                    .publish(BillingEvent::SubscriptionChargeFailed {
                        subscription,
                        transaction: None,
                    })
                    .await;
                return DueCharge::new(id, ChargeOutcome::NoCard).message("no card on file");
            }
            Err(e) => return self.failed(subscription, None, e).await,
        };

        let mut tx = match engine.create_transaction(renewal(&subscription, card.id)).await {
            Ok(tx) => tx,
            Err(e) => return self.failed(subscription, None, e).await,
        };
        match engine.charge(&mut tx).await {
            Ok(()) => {
                let charged_at = engine.now();
                self.record_period(subscription, tx, charged_at).await
            }
            Err(e @ BillingError::CaptureNotRecorded { .. }) => {
                DueCharge::new(id, ChargeOutcome::Unreconciled)
                    .transaction(tx.id)
                    .message(e.to_string())
            }
            Err(e) => self.failed(subscription, Some(tx), e).await,
        }
    }

    /// Latest charge opened for the current period that did not fail.
    async fn period_charge(&self, subscription: &Subscription) -> Result<Option<Transaction>> {
        let Some(due_at) = subscription.next_charge_at else {
            return Ok(None);
        };
        let linked = self
            .engine
            .stores()
            .transactions
            .list_for_subscription(subscription.id)
            .await?;
        Ok(linked.into_iter().rev().find(|tx| {
            tx.kind == TransactionKind::Charge
                && tx.status != TransactionStatus::Failed
                && tx.created_at >= due_at
        }))
    }

    /// Moves the subscription past the period `tx` paid for.
    async fn record_period(
        &self,
        mut subscription: Subscription,
        tx: Transaction,
        charged_at: DateTime<Utc>,
    ) -> DueCharge {
        let id = subscription.id;
        let saved = match subscription.advance(charged_at) {
            Ok(()) => {
                self.engine
                    .stores()
                    .subscriptions
                    .store(subscription.clone())
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            error!(
                subscription_id = %id,
                transaction_id = %tx.id,
                error = %e,
                "subscription charged but its next charge date was not saved, reconcile manually"
            );
            return DueCharge::new(id, ChargeOutcome::Unreconciled)
                .transaction(tx.id)
                .message(e.to_string());
        }

        info!(
            subscription_id = %id,
            transaction_id = %tx.id,
            next_charge_at = ?subscription.next_charge_at,
            "subscription charged"
        );
        let transaction_id = tx.id;
        self.engine
            .publish(BillingEvent::SubscriptionCharged {
                subscription,
                transaction: tx,
            })
            .await;
        DueCharge::new(id, ChargeOutcome::Charged).transaction(transaction_id)
    }

    async fn failed(&self, subscription: Subscription, tx: Option<Transaction>, e: BillingError) -> DueCharge {
        let id = subscription.id;
        let transaction_id = tx.as_ref().map(|tx| tx.id);
        warn!(subscription_id = %id, ?transaction_id, error = %e, "subscription charge failed");
        self.engine
            .publish(BillingEvent::SubscriptionChargeFailed {
                subscription,
                transaction: tx,
            })
            .await;
        DueCharge {
            subscription_id: id,
            outcome: ChargeOutcome::Failed,
            transaction_id,
            message: Some(e.to_string()),
        }
    }
}

/// Pending charge for the subscription's next period, priced at `next_charge_amount`.
fn renewal(subscription: &Subscription, card_id: CardId) -> NewTransaction {
    let mut plan = subscription.plan.clone();
    plan.price = subscription.next_charge_amount;

    NewTransaction {
        kind: TransactionKind::Charge,
        billable_id: subscription.billable_id,
        card_id: Some(card_id),
        subscription_id: Some(subscription.id),
        opens_subscription: false,
        amount: subscription.next_charge_amount,
        currency: subscription.currency,
        installment: 1,
        products: vec![LineItem::Plan(plan)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::{card, harness, start};
    use crate::domain::billable::BillableId;
    use crate::domain::gateway::GatewayError;
    use crate::domain::ports::{CardStore, SubscriptionStore, TransactionStore};
    use crate::domain::subscription::fixtures::plan;
    use crate::infrastructure::sandbox::GatewayOperation;
    use crate::infrastructure::in_memory::InMemorySubscriptionStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    async fn seed_subscription(
        subscriptions: &InMemorySubscriptionStore,
        id: u64,
        billable: u64,
        next_charge_at: DateTime<Utc>,
    ) {
        let mut sub = Subscription::open(
            SubscriptionId(id),
            BillableId(billable),
            plan(0),
            start() - Duration::days(60),
        )
        .unwrap();
        sub.next_charge_at = Some(next_charge_at);
        subscriptions.store(sub).await.unwrap();
    }

    #[tokio::test]
    async fn test_charges_due_and_leaves_future_untouched() {
        let h = harness().await;
        let yesterday = start() - Duration::days(1);
        let future = start() + Duration::days(3);
        seed_subscription(&h.subscriptions, 1, 1, yesterday).await;
        seed_subscription(&h.subscriptions, 2, 1, yesterday).await;
        seed_subscription(&h.subscriptions, 3, 1, future).await;

        let scheduler = DueBillingScheduler::new(h.engine.clone());
        let report = scheduler.run().await.unwrap();

        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|item| item.outcome == ChargeOutcome::Charged));

        let next_month = Utc.with_ymd_and_hms(2026, 4, 15, 10, 0, 0).unwrap();
        for id in [1, 2] {
            let sub = h.subscriptions.get(SubscriptionId(id)).await.unwrap().unwrap();
            assert_eq!(sub.next_charge_at, Some(next_month));
        }
        let untouched = h.subscriptions.get(SubscriptionId(3)).await.unwrap().unwrap();
        assert_eq!(untouched.next_charge_at, Some(future));
        assert_eq!(
            h.events.names().await,
            vec!["subscription_charged", "subscription_charged"]
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let h = harness().await;
        let yesterday = start() - Duration::days(1);
        for id in 1..=3 {
            seed_subscription(&h.subscriptions, id, 1, yesterday).await;
        }
        h.gateway.fail_next(GatewayOperation::CreatePayment, GatewayError::declined("Insufficient funds")).await;

        let report = DueBillingScheduler::new(h.engine.clone()).run().await.unwrap();
        let outcomes: Vec<ChargeOutcome> = report.iter().map(|item| item.outcome).collect();
        assert_eq!(
            outcomes,
            vec![ChargeOutcome::Failed, ChargeOutcome::Charged, ChargeOutcome::Charged]
        );

        let failed = h.subscriptions.get(SubscriptionId(1)).await.unwrap().unwrap();
        assert_eq!(failed.next_charge_at, Some(yesterday));
        let tx = h
            .transactions
            .get(report[0].transaction_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.subscription_id, Some(SubscriptionId(1)));
        assert_eq!(h.events.names().await[0], "subscription_charge_failed");
    }

    #[tokio::test]
    async fn test_missing_card_creates_no_transaction() {
        let h = harness().await;
        h.cards.delete(CardId(1)).await.unwrap();
        seed_subscription(&h.subscriptions, 1, 1, start() - Duration::days(1)).await;

        let report = DueBillingScheduler::new(h.engine.clone()).run().await.unwrap();
        assert_eq!(report[0].outcome, ChargeOutcome::NoCard);
        assert_eq!(report[0].transaction_id, None);
        assert!(h.transactions.all().await.is_empty());
        assert_eq!(h.events.names().await, vec!["subscription_charge_failed"]);
    }

    #[tokio::test]
    async fn test_uses_latest_card() {
        let h = harness().await;
        let mut newer = card(5, 1);
        newer.created_at = start() + Duration::minutes(1);
        h.cards.store(newer).await.unwrap();
        seed_subscription(&h.subscriptions, 1, 1, start() - Duration::days(1)).await;

        let report = DueBillingScheduler::new(h.engine.clone()).run().await.unwrap();
        let tx = h
            .transactions
            .get(report[0].transaction_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.card_id, Some(CardId(5)));
        assert!(h.cards.get(CardId(5)).await.unwrap().unwrap().verified);
    }

    #[tokio::test]
    async fn test_second_run_finds_nothing_due() {
        let h = harness().await;
        seed_subscription(&h.subscriptions, 1, 1, start() - Duration::days(1)).await;
        let scheduler = DueBillingScheduler::new(h.engine.clone());

        assert_eq!(scheduler.run().await.unwrap().len(), 1);
        assert!(scheduler.run().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsaved_charge_date_is_not_charged_twice() {
        let h = harness().await;
        let yesterday = start() - Duration::days(1);
        seed_subscription(&h.subscriptions, 1, 1, yesterday).await;
        let scheduler = DueBillingScheduler::new(h.engine.clone());

        h.failures.subscriptions(true);
        let report = scheduler.run().await.unwrap();
        assert_eq!(report[0].outcome, ChargeOutcome::Unreconciled);
        let transaction_id = report[0].transaction_id.unwrap();
        assert!(report[0].message.as_deref().unwrap().contains("disk full"));
        assert!(h.events.names().await.is_empty());
        let stuck = h.subscriptions.get(SubscriptionId(1)).await.unwrap().unwrap();
        assert_eq!(stuck.next_charge_at, Some(yesterday));

        h.failures.subscriptions(false);
        let report = scheduler.run().await.unwrap();
        assert_eq!(report[0].outcome, ChargeOutcome::Charged);
        assert_eq!(report[0].transaction_id, Some(transaction_id));
        assert_eq!(h.gateway.calls(GatewayOperation::CreatePayment).await, 1);
        assert_eq!(h.transactions.all().await.len(), 1);

        let sub = h.subscriptions.get(SubscriptionId(1)).await.unwrap().unwrap();
        let next_month = Utc.with_ymd_and_hms(2026, 4, 15, 10, 0, 0).unwrap();
        assert_eq!(sub.next_charge_at, Some(next_month));
        assert_eq!(h.events.names().await, vec!["subscription_charged"]);

        assert!(scheduler.run().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_capture_blocks_further_charges() {
        let h = harness().await;
        let yesterday = start() - Duration::days(1);
        seed_subscription(&h.subscriptions, 1, 1, yesterday).await;
        let scheduler = DueBillingScheduler::new(h.engine.clone());

        h.failures.captures(true);
        let report = scheduler.run().await.unwrap();
        assert_eq!(report[0].outcome, ChargeOutcome::Unreconciled);
        let transaction_id = report[0].transaction_id.unwrap();
        let tx = h.transactions.get(transaction_id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);

        h.failures.captures(false);
        let report = scheduler.run().await.unwrap();
        assert_eq!(report[0].outcome, ChargeOutcome::Unreconciled);
        assert_eq!(report[0].transaction_id, Some(transaction_id));
        assert_eq!(h.gateway.calls(GatewayOperation::CreatePayment).await, 1);
        assert!(h.events.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_before_gateway_publishes_event() {
        let h = harness().await;
        seed_subscription(&h.subscriptions, 1, 1, start() - Duration::days(1)).await;

        h.failures.transactions(true);
        let report = DueBillingScheduler::new(h.engine.clone()).run().await.unwrap();
        assert_eq!(report[0].outcome, ChargeOutcome::Failed);
        assert_eq!(report[0].transaction_id, None);
        assert_eq!(h.gateway.calls(GatewayOperation::CreatePayment).await, 0);

        let events = h.events.events().await;
        assert!(matches!(
            &events[..],
            [BillingEvent::SubscriptionChargeFailed { transaction: None, .. }]
        ));
    }

    #[tokio::test]
    async fn test_declined_charge_event_carries_transaction() {
        let h = harness().await;
        seed_subscription(&h.subscriptions, 1, 1, start() - Duration::days(1)).await;
        h.gateway.fail_next(GatewayOperation::CreatePayment, GatewayError::declined("Do not honour")).await;

        let report = DueBillingScheduler::new(h.engine.clone()).run().await.unwrap();
        let transaction_id = report[0].transaction_id.unwrap();
        let events = h.events.events().await;
        match &events[..] {
            [BillingEvent::SubscriptionChargeFailed { transaction: Some(tx), .. }] => {
                assert_eq!(tx.id, transaction_id);
                assert_eq!(tx.status, TransactionStatus::Failed);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overlapping_run_is_refused() {
        let h = harness().await;
        let scheduler = DueBillingScheduler::new(h.engine.clone());

        let _held = scheduler.running.lock().await;
        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadyRunning(_)));
    }
}
