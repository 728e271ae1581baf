use crate::domain::billable::{Billable, BillableId, Customer};
use crate::domain::card::{CardId, StoredCard};
use crate::domain::ports::{BillableDirectory, CardStore, SubscriptionStore, TransactionStore};
use crate::domain::subscription::{Subscription, SubscriptionId};
use crate::domain::transaction::{Transaction, TransactionId, TransactionKind};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Column Family for transactions, keyed by id.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for subscriptions, keyed by id.
pub const CF_SUBSCRIPTIONS: &str = "subscriptions";
/// Column Family for stored cards, keyed by id.
pub const CF_CARDS: &str = "cards";
/// Column Family for customers, keyed by billable id.
pub const CF_BILLABLES: &str = "billables";

const COLUMN_FAMILIES: [&str; 4] = [CF_TRANSACTIONS, CF_SUBSCRIPTIONS, CF_CARDS, CF_BILLABLES];

#[derive(Default)]
struct Sequences {
    transactions: AtomicU64,
    subscriptions: AtomicU64,
    cards: AtomicU64,
}

/// A persistent store implementation using RocksDB.
///
/// One Column Family per entity. Keys are big-endian ids so iteration runs in
/// id order; values are JSON. Id sequences resume from the highest stored key.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    sequences: Arc<Sequences>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// missing column families.
    ///
    /// RocksDB locks the directory, so a second process opening the same
    /// path fails here instead of racing the first one.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let store = Self {
            db: Arc::new(db),
            sequences: Arc::new(Sequences::default()),
        };
        store
            .sequences
            .transactions
            .store(store.last_id(CF_TRANSACTIONS)?, Ordering::SeqCst);
        store
            .sequences
            .subscriptions
            .store(store.last_id(CF_SUBSCRIPTIONS)?, Ordering::SeqCst);
        store
            .sequences
            .cards
            .store(store.last_id(CF_CARDS)?, Ordering::SeqCst);
        Ok(store)
    }

    fn handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            BillingError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn put<T: Serialize>(&self, cf: &str, id: u64, value: &T) -> Result<()> {
        let handle = self.handle(cf)?;
        self.db.put_cf(handle, id.to_be_bytes(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, cf: &str, id: u64) -> Result<Option<T>> {
        let handle = self.handle(cf)?;
        match self.db.get_pinned_cf(handle, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, cf: &str, id: u64) -> Result<()> {
        let handle = self.handle(cf)?;
        self.db.delete_cf(handle, id.to_be_bytes())?;
        Ok(())
    }

    /// Every value of the column family, in key order.
    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let handle = self.handle(cf)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn last_id(&self, cf: &str) -> Result<u64> {
        let handle = self.handle(cf)?;
        match self.db.iterator_cf(handle, IteratorMode::End).next() {
            Some(item) => {
                let (key, _value) = item?;
                let bytes: [u8; 8] = key[..].try_into().map_err(|_| {
                    BillingError::InternalError(Box::new(std::io::Error::other(format!(
                        "Malformed key in {cf}"
                    ))))
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    /// Persists, in one atomic batch, every transaction `update` reports as changed.
    fn rewrite_transactions<F>(&self, mut update: F) -> Result<()>
    where
        F: FnMut(&mut Transaction) -> bool,
    {
        let handle = self.handle(CF_TRANSACTIONS)?;
        let mut batch = WriteBatch::default();
        for mut tx in self.scan::<Transaction>(CF_TRANSACTIONS)? {
            if update(&mut tx) {
                batch.put_cf(handle, tx.id.0.to_be_bytes(), serde_json::to_vec(&tx)?);
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}

fn observe(sequence: &AtomicU64, id: u64) {
    sequence.fetch_max(id, Ordering::SeqCst);
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn next_id(&self) -> Result<TransactionId> {
        Ok(TransactionId(
            self.sequences.transactions.fetch_add(1, Ordering::SeqCst) + 1,
        ))
    }

    async fn store(&self, tx: Transaction) -> Result<()> {
        observe(&self.sequences.transactions, tx.id.0);
        self.put(CF_TRANSACTIONS, tx.id.0, &tx)
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>> {
        self.fetch(CF_TRANSACTIONS, id.0)
    }

    async fn list_stale_verifications(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let mut stale: Vec<Transaction> = self
            .scan::<Transaction>(CF_TRANSACTIONS)?
            .into_iter()
            .filter(|tx| {
                tx.kind == TransactionKind::Verification
                    && tx.voided_at.is_none()
                    && tx.refunded_at.is_none()
                    && tx.created_at <= cutoff
            })
            .collect();
        stale.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(stale)
    }

    async fn list_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<Transaction>> {
        Ok(self
            .scan::<Transaction>(CF_TRANSACTIONS)?
            .into_iter()
            .filter(|tx| tx.subscription_id == Some(subscription_id))
            .collect())
    }

    async fn detach_card(&self, card_id: CardId) -> Result<()> {
        self.rewrite_transactions(|tx| {
            if tx.card_id == Some(card_id) {
                tx.card_id = None;
                true
            } else {
                false
            }
        })
    }

    async fn detach_subscription(&self, subscription_id: SubscriptionId) -> Result<()> {
        self.rewrite_transactions(|tx| {
            if tx.subscription_id == Some(subscription_id) {
                tx.subscription_id = None;
                true
            } else {
                false
            }
        })
    }
}

#[async_trait]
impl SubscriptionStore for RocksDBStore {
    async fn next_id(&self) -> Result<SubscriptionId> {
        Ok(SubscriptionId(
            self.sequences.subscriptions.fetch_add(1, Ordering::SeqCst) + 1,
        ))
    }

    async fn store(&self, subscription: Subscription) -> Result<()> {
        observe(&self.sequences.subscriptions, subscription.id.0);
        self.put(CF_SUBSCRIPTIONS, subscription.id.0, &subscription)
    }

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.fetch(CF_SUBSCRIPTIONS, id.0)
    }

    async fn delete(&self, id: SubscriptionId) -> Result<()> {
        self.remove(CF_SUBSCRIPTIONS, id.0)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        Ok(self
            .scan::<Subscription>(CF_SUBSCRIPTIONS)?
            .into_iter()
            .filter(|sub| sub.is_due(now))
            .collect())
    }

    async fn list_for_billable(&self, billable_id: BillableId) -> Result<Vec<Subscription>> {
        Ok(self
            .scan::<Subscription>(CF_SUBSCRIPTIONS)?
            .into_iter()
            .filter(|sub| sub.billable_id == billable_id)
            .collect())
    }
}

#[async_trait]
impl CardStore for RocksDBStore {
    async fn next_id(&self) -> Result<CardId> {
        Ok(CardId(self.sequences.cards.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn store(&self, card: StoredCard) -> Result<()> {
        observe(&self.sequences.cards, card.id.0);
        self.put(CF_CARDS, card.id.0, &card)
    }

    async fn get(&self, id: CardId) -> Result<Option<StoredCard>> {
        self.fetch(CF_CARDS, id.0)
    }

    async fn delete(&self, id: CardId) -> Result<()> {
        self.remove(CF_CARDS, id.0)
    }

    async fn latest_for(&self, billable_id: BillableId) -> Result<Option<StoredCard>> {
        Ok(self
            .scan::<StoredCard>(CF_CARDS)?
            .into_iter()
            .filter(|card| card.belongs_to(billable_id))
            .max_by_key(|card| (card.created_at, card.id)))
    }
}

/// Only the stock [`Customer`] owner type is persisted.
#[async_trait]
impl BillableDirectory for RocksDBStore {
    async fn find(&self, id: BillableId) -> Result<Option<Arc<dyn Billable>>> {
        let customer: Option<Customer> = self.fetch(CF_BILLABLES, id.0)?;
        Ok(customer.map(|customer| Arc::new(customer) as Arc<dyn Billable>))
    }

    async fn add_customer(&self, customer: Customer) -> Result<()> {
        self.put(CF_BILLABLES, customer.id.0, &customer)
    }

    async fn card_user_key(&self, id: BillableId) -> Result<Option<String>> {
        let customer: Option<Customer> = self.fetch(CF_BILLABLES, id.0)?;
        Ok(customer.and_then(|customer| customer.card_user_key))
    }

    async fn set_card_user_key(&self, id: BillableId, key: String) -> Result<()> {
        let mut customer: Customer = self
            .fetch(CF_BILLABLES, id.0)?
            .ok_or_else(|| BillingError::not_found("Billable", id))?;
        customer.card_user_key = Some(key);
        self.put(CF_BILLABLES, id.0, &customer)
    }
}
