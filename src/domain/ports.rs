use super::billable::{Billable, BillableId, Customer};
use super::card::{CardId, StoredCard};
use super::events::BillingEvent;
use super::subscription::{Subscription, SubscriptionId};
use super::transaction::{Transaction, TransactionId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn next_id(&self) -> Result<TransactionId>;
    async fn store(&self, tx: Transaction) -> Result<()>;
    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>>;
    /// Verification transactions created at or before `cutoff` that were neither
    /// voided nor refunded, oldest first.
    async fn list_stale_verifications(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>>;
    /// Transactions linked to `subscription_id`, in id order.
    async fn list_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<Transaction>>;
    /// Nulls the card reference of every transaction made with `card_id`.
    async fn detach_card(&self, card_id: CardId) -> Result<()>;
    /// Nulls the subscription reference of every transaction linked to `subscription_id`.
    async fn detach_subscription(&self, subscription_id: SubscriptionId) -> Result<()>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn next_id(&self) -> Result<SubscriptionId>;
    async fn store(&self, subscription: Subscription) -> Result<()>;
    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>>;
    async fn delete(&self, id: SubscriptionId) -> Result<()>;
    /// Subscriptions due at `now`, ordered by id.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>>;
    async fn list_for_billable(&self, billable_id: BillableId) -> Result<Vec<Subscription>>;
}

#[async_trait]
pub trait CardStore: Send + Sync {
    async fn next_id(&self) -> Result<CardId>;
    async fn store(&self, card: StoredCard) -> Result<()>;
    async fn get(&self, id: CardId) -> Result<Option<StoredCard>>;
    async fn delete(&self, id: CardId) -> Result<()>;
    /// Most recently stored card of the billable.
    async fn latest_for(&self, billable_id: BillableId) -> Result<Option<StoredCard>>;
}

/// Lookup of owner entities by id.
#[async_trait]
pub trait BillableDirectory: Send + Sync {
    async fn find(&self, id: BillableId) -> Result<Option<Arc<dyn Billable>>>;
    /// Registers or replaces a stock [`Customer`].
    async fn add_customer(&self, customer: Customer) -> Result<()>;
    async fn card_user_key(&self, id: BillableId) -> Result<Option<String>>;
    async fn set_card_user_key(&self, id: BillableId, key: String) -> Result<()>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: BillingEvent);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type TransactionStoreBox = Box<dyn TransactionStore>;
pub type SubscriptionStoreBox = Box<dyn SubscriptionStore>;
pub type CardStoreBox = Box<dyn CardStore>;
pub type BillableDirectoryBox = Box<dyn BillableDirectory>;
pub type EventSinkBox = Box<dyn EventSink>;
pub type ClockBox = Box<dyn Clock>;
