//! Shared fixture for the application tests: in-memory stores, the sandbox
//! gateway and a clock pinned to 2026-03-15 10:00 UTC.

use super::config::BillingConfig;
use super::engine::{BillingEngine, Stores};
use crate::domain::billable::fixtures::bill_fields;
use crate::domain::billable::{BillableId, Customer};
use crate::domain::card::{CardId, StoredCard};
use crate::domain::ports::{CardStore, SubscriptionStore, TransactionStore};
use crate::domain::subscription::{Subscription, SubscriptionId};
use crate::domain::transaction::fixtures::product;
use crate::domain::transaction::{NewTransaction, Transaction, TransactionId, TransactionStatus};
use crate::error::{BillingError, Result};
use crate::infrastructure::clock::FixedClock;
use crate::infrastructure::in_memory::{
    InMemoryBillableDirectory, InMemoryCardStore, InMemorySubscriptionStore,
    InMemoryTransactionStore, RecordingEventSink,
};
use crate::infrastructure::sandbox::SandboxGateway;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Harness {
    pub engine: Arc<BillingEngine>,
    pub gateway: SandboxGateway,
    pub clock: FixedClock,
    pub cards: InMemoryCardStore,
    pub subscriptions: InMemorySubscriptionStore,
    pub transactions: InMemoryTransactionStore,
    pub events: RecordingEventSink,
    pub failures: WriteFailures,
}

/// Switches that make the engine's store writes fail with a disk error.
#[derive(Clone, Default)]
pub struct WriteFailures {
    subscriptions: Arc<AtomicBool>,
    transactions: Arc<AtomicBool>,
    captures: Arc<AtomicBool>,
}

impl WriteFailures {
    /// Every subscription write.
    pub fn subscriptions(&self, failing: bool) {
        self.subscriptions.store(failing, Ordering::SeqCst);
    }

    /// Every transaction write.
    pub fn transactions(&self, failing: bool) {
        self.transactions.store(failing, Ordering::SeqCst);
    }

    /// Only writes of transactions that reached `Success`.
    pub fn captures(&self, failing: bool) {
        self.captures.store(failing, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(BillingError::IoError(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

struct FailingSubscriptions {
    inner: InMemorySubscriptionStore,
    failures: WriteFailures,
}

#[async_trait]
impl SubscriptionStore for FailingSubscriptions {
    async fn next_id(&self) -> Result<SubscriptionId> {
        self.inner.next_id().await
    }

    async fn store(&self, subscription: Subscription) -> Result<()> {
        WriteFailures::check(&self.failures.subscriptions)?;
        self.inner.store(subscription).await
    }

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: SubscriptionId) -> Result<()> {
        WriteFailures::check(&self.failures.subscriptions)?;
        self.inner.delete(id).await
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        self.inner.list_due(now).await
    }

    async fn list_for_billable(&self, billable_id: BillableId) -> Result<Vec<Subscription>> {
        self.inner.list_for_billable(billable_id).await
    }
}

struct FailingTransactions {
    inner: InMemoryTransactionStore,
    failures: WriteFailures,
}

#[async_trait]
impl TransactionStore for FailingTransactions {
    async fn next_id(&self) -> Result<TransactionId> {
        self.inner.next_id().await
    }

    async fn store(&self, tx: Transaction) -> Result<()> {
        WriteFailures::check(&self.failures.transactions)?;
        if tx.status == TransactionStatus::Success {
            WriteFailures::check(&self.failures.captures)?;
        }
        self.inner.store(tx).await
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>> {
        self.inner.get(id).await
    }

    async fn list_stale_verifications(&self, cutoff: DateTime<Utc>) -> Result<Vec<Transaction>> {
        self.inner.list_stale_verifications(cutoff).await
    }

    async fn list_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<Transaction>> {
        self.inner.list_for_subscription(subscription_id).await
    }

    async fn detach_card(&self, card_id: CardId) -> Result<()> {
        WriteFailures::check(&self.failures.transactions)?;
        self.inner.detach_card(card_id).await
    }

    async fn detach_subscription(&self, subscription_id: SubscriptionId) -> Result<()> {
        WriteFailures::check(&self.failures.transactions)?;
        self.inner.detach_subscription(subscription_id).await
    }
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap()
}

pub fn card(id: u64, owner: u64) -> StoredCard {
    StoredCard {
        id: CardId(id),
        billable_id: BillableId(owner),
        alias: "main".to_string(),
        bin: "552879".to_string(),
        last_four: "0008".to_string(),
        token: format!("tok-{id}"),
        bank: None,
        network: None,
        verified: false,
        created_at: start(),
    }
}

pub async fn harness() -> Harness {
    harness_with(BillingConfig::default()).await
}

/// Billable 1 is complete and owns card 1; billable 2 has no profile and owns card 2.
pub async fn harness_with(config: BillingConfig) -> Harness {
    let billables = InMemoryBillableDirectory::new();
    billables
        .register(Arc::new(Customer::new(BillableId(1), Some(bill_fields()))))
        .await;
    billables
        .register(Arc::new(Customer::new(BillableId(2), None)))
        .await;

    let cards = InMemoryCardStore::new();
    cards.store(card(1, 1)).await.unwrap();
    cards.store(card(2, 2)).await.unwrap();

    let gateway = SandboxGateway::new();
    let clock = FixedClock::new(start());
    let subscriptions = InMemorySubscriptionStore::new();
    let transactions = InMemoryTransactionStore::new();
    let events = RecordingEventSink::new();
    let failures = WriteFailures::default();

    let stores = Stores {
        transactions: Box::new(FailingTransactions {
            inner: transactions.clone(),
            failures: failures.clone(),
        }),
        subscriptions: Box::new(FailingSubscriptions {
            inner: subscriptions.clone(),
            failures: failures.clone(),
        }),
        cards: Box::new(cards.clone()),
        billables: Box::new(billables),
    };
    let engine = BillingEngine::new(
        stores,
        Box::new(gateway.clone()),
        Box::new(events.clone()),
        config,
    )
    .with_clock(Box::new(clock.clone()));

    Harness {
        engine: Arc::new(engine),
        gateway,
        clock,
        cards,
        subscriptions,
        transactions,
        events,
        failures,
    }
}

pub async fn pending(h: &Harness, billable: u64, card: u64, amount: Decimal) -> Transaction {
    let new = NewTransaction::charge(BillableId(billable), CardId(card), vec![product(amount)]).unwrap();
    h.engine.create_transaction(new).await.unwrap()
}
