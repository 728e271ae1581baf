use super::engine::BillingEngine;
use crate::domain::billable::BillableId;
use crate::domain::card::{CardId, StoredCard};
use crate::domain::gateway::ThreedsSession;
use crate::domain::plan::{ItemType, LineItem, PlanSnapshot, Product};
use crate::domain::subscription::{Subscription, SubscriptionId};
use crate::domain::transaction::{NewTransaction, Transaction, TransactionKind};
use crate::error::{BillingError, Result};
use chrono::NaiveTime;
use tracing::info;

pub const VERIFICATION_PRODUCT_ID: &str = "card-verification";

/// Result of a subscribe call. The payer must be sent to `session.html_content`.
#[derive(Debug, Clone)]
pub struct Subscribed {
    pub subscription: Subscription,
    pub transaction: Transaction,
    pub session: ThreedsSession,
}

impl BillingEngine {
    /// Subscribes a billable to `plan`, paying with `card_id` through 3-D Secure.
    ///
    /// A trial on a card that was never charged successfully only verifies the
    /// card for the configured nominal amount; any other case charges the plan
    /// price. The subscription is removed again if the payment never completes.
    pub async fn subscribe(&self, billable_id: BillableId, plan: PlanSnapshot, card_id: CardId) -> Result<Subscribed> {
        plan.validate()?;
        let card = self.payer_card(billable_id, card_id).await?;

        let id = self.stores().subscriptions.next_id().await?;
        let subscription = Subscription::open(id, billable_id, plan, self.now())?;
        self.stores().subscriptions.store(subscription.clone()).await?;

        let new = self.first_payment(&subscription, &card);
        let mut transaction = match self.create_transaction(new).await {
            Ok(tx) => tx,
            Err(e) => {
                self.stores().subscriptions.delete(subscription.id).await?;
                return Err(e);
            }
        };

        let session = self.initialize_threeds(&mut transaction).await?;
        info!(
            subscription_id = %subscription.id,
            transaction_id = %transaction.id,
            plan = %subscription.plan.id,
            kind = ?transaction.kind,
            "subscription opened"
        );

        Ok(Subscribed {
            subscription,
            transaction,
            session,
        })
    }

    /// Graceful cancellation; access lasts until the paid period ends.
    pub async fn cancel_subscription(&self, id: SubscriptionId) -> Result<Subscription> {
        let mut subscription = self.subscription(id).await?;
        subscription.cancel(self.now());
        self.stores().subscriptions.store(subscription.clone()).await?;
        info!(subscription_id = %id, canceled_at = ?subscription.canceled_at, "subscription canceled");
        Ok(subscription)
    }

    pub async fn force_cancel_subscription(&self, id: SubscriptionId) -> Result<Subscription> {
        let mut subscription = self.subscription(id).await?;
        subscription.force_cancel(self.now());
        self.stores().subscriptions.store(subscription.clone()).await?;
        info!(subscription_id = %id, "subscription force-canceled");
        Ok(subscription)
    }

    /// Whether the billable holds a live subscription to `plan_id` today.
    pub async fn is_subscribed_to(&self, billable_id: BillableId, plan_id: &str) -> Result<bool> {
        let today = self.now().date_naive().and_time(NaiveTime::MIN).and_utc();
        let subscriptions = self.stores().subscriptions.list_for_billable(billable_id).await?;
        Ok(subscriptions.iter().any(|sub| {
            sub.plan.id == plan_id
                && sub.canceled_at.is_none()
                && sub.next_charge_at.is_some_and(|next| next > today)
        }))
    }

    pub async fn subscription(&self, id: SubscriptionId) -> Result<Subscription> {
        self.stores()
            .subscriptions
            .get(id)
            .await?
            .ok_or_else(|| BillingError::not_found("Subscription", id))
    }

    /// Checks that the billable can pay and owns the card.
    async fn payer_card(&self, billable_id: BillableId, card_id: CardId) -> Result<StoredCard> {
        let billable = self
            .stores()
            .billables
            .find(billable_id)
            .await?
            .ok_or_else(|| BillingError::not_found("Billable", billable_id))?;
        if !billable.is_billable() {
            return Err(BillingError::BillFieldsMissing(billable_id));
        }

        let card = self
            .stores()
            .cards
            .get(card_id)
            .await?
            .ok_or_else(|| BillingError::not_found("Card", card_id))?;
        if !card.belongs_to(billable_id) {
            return Err(BillingError::CardNotOwned {
                card: card_id,
                billable: billable_id,
            });
        }
        Ok(card)
    }

    fn first_payment(&self, subscription: &Subscription, card: &StoredCard) -> NewTransaction {
        let plan = &subscription.plan;
        let (kind, amount, item) = if plan.has_trial() && !card.verified {
            let amount = self.config().verification_amount;
            let item = LineItem::Product(Product {
                id: VERIFICATION_PRODUCT_ID.to_string(),
                name: "Card Verification".to_string(),
                price: amount,
                currency: plan.currency,
                category: "Verification".to_string(),
                item_type: ItemType::Virtual,
            });
            (TransactionKind::Verification, amount, item)
        } else {
            (TransactionKind::Charge, plan.price, LineItem::Plan(plan.clone()))
        };

        NewTransaction {
            kind,
            billable_id: subscription.billable_id,
            card_id: Some(card.id),
            subscription_id: Some(subscription.id),
            opens_subscription: true,
            amount,
            currency: plan.currency,
            installment: 1,
            products: vec![item],
        }
    }
}
