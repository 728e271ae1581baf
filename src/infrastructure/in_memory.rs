use crate::domain::billable::{Billable, BillableId, Customer};
use crate::domain::card::{CardId, StoredCard};
use crate::domain::events::BillingEvent;
use crate::domain::ports::{
    BillableDirectory, CardStore, EventSink, SubscriptionStore, TransactionStore,
};
use crate::domain::subscription::{Subscription, SubscriptionId};
use crate::domain::transaction::{Transaction, TransactionId, TransactionKind};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Hands out ids starting at 1, never reusing one.
#[derive(Default, Clone)]
struct IdSequence(Arc<AtomicU64>);

impl IdSequence {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Keeps the sequence ahead of ids stored from outside (seeds, imports).
    fn observe(&self, id: u64) {
        self.0.fetch_max(id, Ordering::SeqCst);
    }
}

/// A thread-safe in-memory store for transactions.
///
/// Keyed by id in a `BTreeMap` so scans come back in id order.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<BTreeMap<TransactionId, Transaction>>>,
    ids: IdSequence,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Transaction> {
        self.transactions.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn next_id(&self) -> Result<TransactionId> {
        Ok(TransactionId(self.ids.next()))
    }

    async fn store(&self, tx: Transaction) -> Result<()> {
        self.ids.observe(tx.id.0);
        let mut transactions = self.transactions.write().await;
        transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(&id).cloned())
    }

    async fn list_stale_verifications(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        let mut stale: Vec<Transaction> = transactions
            .values()
            .filter(|tx| {
                tx.kind == TransactionKind::Verification
                    && tx.voided_at.is_none()
                    && tx.refunded_at.is_none()
                    && tx.created_at <= cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(stale)
    }

    async fn list_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|tx| tx.subscription_id == Some(subscription_id))
            .cloned()
            .collect())
    }

    async fn detach_card(&self, card_id: CardId) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        for tx in transactions.values_mut() {
            if tx.card_id == Some(card_id) {
                tx.card_id = None;
            }
        }
        Ok(())
    }

    async fn detach_subscription(&self, subscription_id: SubscriptionId) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        for tx in transactions.values_mut() {
            if tx.subscription_id == Some(subscription_id) {
                tx.subscription_id = None;
            }
        }
        Ok(())
    }
}

/// A thread-safe in-memory store for subscriptions.
#[derive(Default, Clone)]
pub struct InMemorySubscriptionStore {
    subscriptions: Arc<RwLock<BTreeMap<SubscriptionId, Subscription>>>,
    ids: IdSequence,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn next_id(&self) -> Result<SubscriptionId> {
        Ok(SubscriptionId(self.ids.next()))
    }

    async fn store(&self, subscription: Subscription) -> Result<()> {
        self.ids.observe(subscription.id.0);
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions.get(&id).cloned())
    }

    async fn delete(&self, id: SubscriptionId) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.remove(&id);
        Ok(())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|sub| sub.is_due(now))
            .cloned()
            .collect())
    }

    async fn list_for_billable(&self, billable_id: BillableId) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|sub| sub.billable_id == billable_id)
            .cloned()
            .collect())
    }
}

/// A thread-safe in-memory store for stored cards.
#[derive(Default, Clone)]
pub struct InMemoryCardStore {
    cards: Arc<RwLock<BTreeMap<CardId, StoredCard>>>,
    ids: IdSequence,
}

impl InMemoryCardStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CardStore for InMemoryCardStore {
    async fn next_id(&self) -> Result<CardId> {
        Ok(CardId(self.ids.next()))
    }

    async fn store(&self, card: StoredCard) -> Result<()> {
        self.ids.observe(card.id.0);
        let mut cards = self.cards.write().await;
        cards.insert(card.id, card);
        Ok(())
    }

    async fn get(&self, id: CardId) -> Result<Option<StoredCard>> {
        let cards = self.cards.read().await;
        Ok(cards.get(&id).cloned())
    }

    async fn delete(&self, id: CardId) -> Result<()> {
        let mut cards = self.cards.write().await;
        cards.remove(&id);
        Ok(())
    }

    async fn latest_for(&self, billable_id: BillableId) -> Result<Option<StoredCard>> {
        let cards = self.cards.read().await;
        Ok(cards
            .values()
            .filter(|card| card.belongs_to(billable_id))
            .max_by_key(|card| (card.created_at, card.id))
            .cloned())
    }
}

/// Owner lookup backed by a map of trait objects.
#[derive(Default, Clone)]
pub struct InMemoryBillableDirectory {
    billables: Arc<RwLock<HashMap<BillableId, Arc<dyn Billable>>>>,
    card_user_keys: Arc<RwLock<HashMap<BillableId, String>>>,
}

impl InMemoryBillableDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, billable: Arc<dyn Billable>) {
        let mut billables = self.billables.write().await;
        billables.insert(billable.billable_id(), billable);
    }
}

#[async_trait]
impl BillableDirectory for InMemoryBillableDirectory {
    async fn find(&self, id: BillableId) -> Result<Option<Arc<dyn Billable>>> {
        let billables = self.billables.read().await;
        Ok(billables.get(&id).cloned())
    }

    async fn add_customer(&self, customer: Customer) -> Result<()> {
        if let Some(key) = customer.card_user_key.clone() {
            self.set_card_user_key(customer.id, key).await?;
        }
        self.register(Arc::new(customer)).await;
        Ok(())
    }

    async fn card_user_key(&self, id: BillableId) -> Result<Option<String>> {
        let keys = self.card_user_keys.read().await;
        Ok(keys.get(&id).cloned())
    }

    async fn set_card_user_key(&self, id: BillableId, key: String) -> Result<()> {
        let mut keys = self.card_user_keys.write().await;
        keys.insert(id, key);
        Ok(())
    }
}

/// Keeps every published event, in order.
#[derive(Default, Clone)]
pub struct RecordingEventSink {
    events: Arc<RwLock<Vec<BillingEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<BillingEvent> {
        self.events.read().await.clone()
    }

    pub async fn names(&self) -> Vec<&'static str> {
        self.events.read().await.iter().map(BillingEvent::name).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, event: BillingEvent) {
        self.events.write().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::subscription::fixtures::plan;
    use crate::domain::transaction::fixtures::transaction;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap()
    }

    fn card(id: u64, billable: u64, created_at: DateTime<Utc>) -> StoredCard {
        StoredCard {
            id: CardId(id),
            billable_id: BillableId(billable),
            alias: format!("card-{id}"),
            bin: "552879".to_string(),
            last_four: "0008".to_string(),
            token: format!("tok-{id}"),
            bank: None,
            network: None,
            verified: false,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_in_memory_transaction_store() {
        let store = InMemoryTransactionStore::new();
        let id = store.next_id().await.unwrap();
        let mut tx = transaction(dec!(100), now());
        tx.id = id;

        store.store(tx.clone()).await.unwrap();
        let retrieved = store.get(id).await.unwrap().unwrap();
        assert_eq!(retrieved, tx);

        assert!(store.get(TransactionId(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ids_stay_ahead_of_seeded_rows() {
        let store = InMemoryTransactionStore::new();
        let mut tx = transaction(dec!(1), now());
        tx.id = TransactionId(41);
        store.store(tx).await.unwrap();

        assert_eq!(store.next_id().await.unwrap(), TransactionId(42));
    }

    #[tokio::test]
    async fn test_stale_verifications_filter_and_order() {
        let store = InMemoryTransactionStore::new();
        let cutoff = now() - Duration::minutes(5);

        let mut old = transaction(dec!(1), now() - Duration::hours(2));
        old.id = TransactionId(2);
        old.kind = TransactionKind::Verification;

        let mut older = transaction(dec!(1), now() - Duration::hours(3));
        older.id = TransactionId(3);
        older.kind = TransactionKind::Verification;

        let mut fresh = transaction(dec!(1), now());
        fresh.id = TransactionId(4);
        fresh.kind = TransactionKind::Verification;

        let mut voided = older.clone();
        voided.id = TransactionId(5);
        voided.voided_at = Some(now());

        let mut charge = older.clone();
        charge.id = TransactionId(6);
        charge.kind = TransactionKind::Charge;

        for tx in [old, older, fresh, voided, charge] {
            store.store(tx).await.unwrap();
        }

        let stale = store.list_stale_verifications(cutoff).await.unwrap();
        let ids: Vec<u64> = stale.iter().map(|tx| tx.id.0).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_detach_references() {
        let store = InMemoryTransactionStore::new();
        let mut tx = transaction(dec!(1), now());
        tx.subscription_id = Some(SubscriptionId(9));
        store.store(tx.clone()).await.unwrap();

        store.detach_card(CardId(1)).await.unwrap();
        store.detach_subscription(SubscriptionId(9)).await.unwrap();

        let stored = store.get(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.card_id, None);
        assert_eq!(stored.subscription_id, None);
    }

    #[tokio::test]
    async fn test_list_for_subscription() {
        let store = InMemoryTransactionStore::new();
        for (id, subscription) in [(1, Some(7)), (2, None), (3, Some(7)), (4, Some(8))] {
            let mut tx = transaction(dec!(5), now());
            tx.id = TransactionId(id);
            tx.subscription_id = subscription.map(SubscriptionId);
            store.store(tx).await.unwrap();
        }

        let linked = store.list_for_subscription(SubscriptionId(7)).await.unwrap();
        let ids: Vec<u64> = linked.iter().map(|tx| tx.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_due_subscriptions_ordered_by_id() {
        let store = InMemorySubscriptionStore::new();
        let long_ago = now() - Duration::days(60);

        for id in [3, 1, 2] {
            let sub = Subscription::open(SubscriptionId(id), BillableId(1), plan(0), long_ago).unwrap();
            store.store(sub).await.unwrap();
        }
        let mut future = Subscription::open(SubscriptionId(4), BillableId(1), plan(0), now()).unwrap();
        store.store(future.clone()).await.unwrap();
        future.id = SubscriptionId(5);
        future.cancel(now());
        future.next_charge_at = None;
        store.store(future).await.unwrap();

        let due = store.list_due(now()).await.unwrap();
        let ids: Vec<u64> = due.iter().map(|sub| sub.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        store.delete(SubscriptionId(2)).await.unwrap();
        assert!(store.get(SubscriptionId(2)).await.unwrap().is_none());
        assert_eq!(store.list_for_billable(BillableId(1)).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_latest_card_for_billable() {
        let store = InMemoryCardStore::new();
        store.store(card(1, 1, now() - Duration::days(2))).await.unwrap();
        store.store(card(2, 1, now())).await.unwrap();
        store.store(card(3, 2, now() + Duration::days(1))).await.unwrap();

        let latest = store.latest_for(BillableId(1)).await.unwrap().unwrap();
        assert_eq!(latest.id, CardId(2));
        assert!(store.latest_for(BillableId(7)).await.unwrap().is_none());

        store.delete(CardId(2)).await.unwrap();
        let latest = store.latest_for(BillableId(1)).await.unwrap().unwrap();
        assert_eq!(latest.id, CardId(1));
    }

    #[tokio::test]
    async fn test_billable_directory() {
        let directory = InMemoryBillableDirectory::new();
        directory
            .register(Arc::new(Customer::new(BillableId(1), None)))
            .await;

        let found = directory.find(BillableId(1)).await.unwrap().unwrap();
        assert_eq!(found.billable_id(), BillableId(1));
        assert!(directory.find(BillableId(2)).await.unwrap().is_none());

        assert!(directory.card_user_key(BillableId(1)).await.unwrap().is_none());
        directory
            .set_card_user_key(BillableId(1), "cuk".to_string())
            .await
            .unwrap();
        assert_eq!(
            directory.card_user_key(BillableId(1)).await.unwrap().as_deref(),
            Some("cuk")
        );
    }
}
