use crate::application::engine::Stores;
use crate::domain::billable::Customer;
use crate::domain::card::StoredCard;
use crate::domain::subscription::Subscription;
use crate::domain::transaction::Transaction;
use crate::error::Result;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;

/// A JSON snapshot of billing state, loaded into the stores at startup.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub customers: Vec<Customer>,
    pub cards: Vec<StoredCard>,
    pub subscriptions: Vec<Subscription>,
    pub transactions: Vec<Transaction>,
}

impl Seed {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Writes every record through the ports. Existing records with the same
    /// id are overwritten.
    pub async fn load(self, stores: &Stores) -> Result<()> {
        let counts = (
            self.customers.len(),
            self.cards.len(),
            self.subscriptions.len(),
            self.transactions.len(),
        );
        for customer in self.customers {
            stores.billables.add_customer(customer).await?;
        }
        for card in self.cards {
            stores.cards.store(card).await?;
        }
        for subscription in self.subscriptions {
            stores.subscriptions.store(subscription).await?;
        }
        for tx in self.transactions {
            stores.transactions.store(tx).await?;
        }
        info!(
            customers = counts.0,
            cards = counts.1,
            subscriptions = counts.2,
            transactions = counts.3,
            "seed loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billable::BillableId;
    use crate::domain::ports::{BillableDirectory, CardStore, SubscriptionStore};
    use crate::domain::subscription::SubscriptionId;
    use crate::infrastructure::in_memory::{
        InMemoryBillableDirectory, InMemoryCardStore, InMemorySubscriptionStore,
        InMemoryTransactionStore,
    };

    const SEED: &str = r#"{
        "customers": [
            {"id": 1, "bill_fields": {
                "firstName": "Ada", "lastName": "Yilmaz", "email": "ada@example.com",
                "identityNumber": "74300864791", "mobileNumber": "+905350000000",
                "shippingAddress": {"city": "Istanbul", "country": "Turkey", "address": "Kadikoy"},
                "billingAddress": {"city": "Istanbul", "country": "Turkey", "address": "Kadikoy"}
            }, "card_user_key": "user-1"}
        ],
        "cards": [
            {"id": 1, "billable_id": 1, "alias": "personal", "bin": "552879", "last_four": "0008",
             "token": "tok-1", "bank": null, "network": null, "verified": true,
             "created_at": "2026-01-01T00:00:00Z"}
        ],
        "subscriptions": [
            {"id": 4, "billable_id": 1, "next_charge_amount": "9.99", "currency": "TRY",
             "next_charge_at": "2026-02-01T00:00:00Z", "canceled_at": null,
             "plan": {"id": "pro", "name": "Pro", "price": "9.99"},
             "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"}
        ]
    }"#;

    fn stores() -> Stores {
        Stores {
            transactions: Box::new(InMemoryTransactionStore::new()),
            subscriptions: Box::new(InMemorySubscriptionStore::new()),
            cards: Box::new(InMemoryCardStore::new()),
            billables: Box::new(InMemoryBillableDirectory::new()),
        }
    }

    #[tokio::test]
    async fn test_loads_partial_snapshot() {
        let seed = Seed::from_reader(SEED.as_bytes()).unwrap();
        assert!(seed.transactions.is_empty());

        let stores = stores();
        seed.load(&stores).await.unwrap();

        let customer = stores.billables.find(BillableId(1)).await.unwrap().unwrap();
        assert!(customer.is_billable());
        assert_eq!(
            stores.billables.card_user_key(BillableId(1)).await.unwrap().as_deref(),
            Some("user-1")
        );
        assert!(stores.cards.latest_for(BillableId(1)).await.unwrap().is_some());

        let sub = stores.subscriptions.get(SubscriptionId(4)).await.unwrap().unwrap();
        assert_eq!(sub.plan.id, "pro");
        assert_eq!(stores.subscriptions.next_id().await.unwrap(), SubscriptionId(5));
    }

    #[test]
    fn test_rejects_invalid_amount() {
        let err = Seed::from_reader(
            r#"{"subscriptions": [{"id": 1, "billable_id": 1, "next_charge_amount": "0",
            "currency": "TRY", "next_charge_at": null, "canceled_at": null,
            "plan": {"id": "p", "name": "P", "price": "1"},
            "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"}]}"#
                .as_bytes(),
        );
        assert!(err.is_err());
    }
}
