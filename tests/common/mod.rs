#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use recurbill::application::config::BillingConfig;
use recurbill::application::engine::{BillingEngine, Stores};
use recurbill::domain::billable::{Address, BillFields, BillableId, Customer};
use recurbill::domain::card::{CardId, StoredCard};
use recurbill::domain::money::{Amount, Currency};
use recurbill::domain::plan::{ItemType, LineItem, PlanSnapshot, Product};
use recurbill::domain::ports::CardStore;
use recurbill::infrastructure::clock::FixedClock;
use recurbill::infrastructure::in_memory::{
    InMemoryBillableDirectory, InMemoryCardStore, InMemorySubscriptionStore,
    InMemoryTransactionStore, RecordingEventSink,
};
use recurbill::infrastructure::sandbox::SandboxGateway;
use rust_decimal::Decimal;
use std::sync::Arc;

pub struct World {
    pub engine: Arc<BillingEngine>,
    pub gateway: SandboxGateway,
    pub clock: FixedClock,
    pub cards: InMemoryCardStore,
    pub subscriptions: InMemorySubscriptionStore,
    pub transactions: InMemoryTransactionStore,
    pub events: RecordingEventSink,
}

pub fn monday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
}

pub fn bill_fields(email: &str) -> BillFields {
    let address = Address {
        city: "Ankara".to_string(),
        country: "Turkey".to_string(),
        address: "Cankaya Cad. 12".to_string(),
    };
    BillFields {
        first_name: "Deniz".to_string(),
        last_name: "Kaya".to_string(),
        email: email.to_string(),
        identity_number: "10000000146".to_string(),
        mobile_number: "+905551112233".to_string(),
        shipping_address: address.clone(),
        billing_address: address,
    }
}

pub fn stored_card(id: u64, owner: u64, token: &str) -> StoredCard {
    StoredCard {
        id: CardId(id),
        billable_id: BillableId(owner),
        alias: "work".to_string(),
        bin: "454671".to_string(),
        last_four: "9876".to_string(),
        token: token.to_string(),
        bank: Some("Sandbox Bank".to_string()),
        network: Some("VISA".to_string()),
        verified: false,
        created_at: monday_morning(),
    }
}

pub fn item(id: &str, price: Decimal) -> LineItem {
    LineItem::Product(Product {
        id: id.to_string(),
        name: format!("Item {id}"),
        price: Amount::new(price).unwrap(),
        currency: Currency::Try,
        category: "Books".to_string(),
        item_type: ItemType::Physical,
    })
}

pub fn plan(price: Decimal, trial_days: u32) -> PlanSnapshot {
    PlanSnapshot::new("team", "Team", Amount::new(price).unwrap())
        .unwrap()
        .trial_days(trial_days)
}

/// Customers 1 and 2 are billable, each with one card (ids 1 and 2).
/// Card 2 is always declined by the sandbox.
pub async fn world() -> World {
    let billables = InMemoryBillableDirectory::new();
    billables
        .register(Arc::new(Customer::new(BillableId(1), Some(bill_fields("deniz@example.com")))))
        .await;
    billables
        .register(Arc::new(Customer::new(BillableId(2), Some(bill_fields("ece@example.com")))))
        .await;

    let cards = InMemoryCardStore::new();
    cards.store(stored_card(1, 1, "tok-good")).await.unwrap();
    cards.store(stored_card(2, 2, "sbx-decline-2")).await.unwrap();

    let gateway = SandboxGateway::new();
    let clock = FixedClock::new(monday_morning());
    let subscriptions = InMemorySubscriptionStore::new();
    let transactions = InMemoryTransactionStore::new();
    let events = RecordingEventSink::new();

    let engine = BillingEngine::new(
        Stores {
            transactions: Box::new(transactions.clone()),
            subscriptions: Box::new(subscriptions.clone()),
            cards: Box::new(cards.clone()),
            billables: Box::new(billables),
        },
        Box::new(gateway.clone()),
        Box::new(events.clone()),
        BillingConfig::default(),
    )
    .with_clock(Box::new(clock.clone()));

    World {
        engine: Arc::new(engine),
        gateway,
        clock,
        cards,
        subscriptions,
        transactions,
        events,
    }
}
