use super::engine::BillingEngine;
use crate::domain::billable::BillableId;
use crate::domain::card::{CardData, CardId, StoredCard};
use crate::domain::gateway::{DeleteCardRequest, StoreCardRequest, ThreedsSession};
use crate::domain::plan::LineItem;
use crate::domain::transaction::{NewTransaction, Transaction};
use crate::error::{BillingError, Result};
use tracing::{info, warn};

impl BillingEngine {
    /// One-off direct payment for `products` with a stored card.
    ///
    /// The transaction is persisted in every case; on failure it is returned
    /// through the error path only, read it back by id if needed.
    pub async fn pay(
        &self,
        billable_id: BillableId,
        card_id: CardId,
        products: Vec<LineItem>,
        installment: u8,
    ) -> Result<Transaction> {
        let mut new = NewTransaction::charge(billable_id, card_id, products)?;
        new.installment = installment;
        let mut tx = self.create_transaction(new).await?;
        self.charge(&mut tx).await?;
        Ok(tx)
    }

    /// One-off 3-D Secure payment; completes when the bank calls back.
    pub async fn secure_pay(
        &self,
        billable_id: BillableId,
        card_id: CardId,
        products: Vec<LineItem>,
        installment: u8,
    ) -> Result<(Transaction, ThreedsSession)> {
        let mut new = NewTransaction::charge(billable_id, card_id, products)?;
        new.installment = installment;
        let mut tx = self.create_transaction(new).await?;
        let session = self.initialize_threeds(&mut tx).await?;
        Ok((tx, session))
    }

    /// Tokenizes a card on the gateway and keeps the stored reference.
    pub async fn add_card(&self, billable_id: BillableId, data: CardData) -> Result<StoredCard> {
        data.validate()?;
        let billable = self
            .stores()
            .billables
            .find(billable_id)
            .await?
            .ok_or_else(|| BillingError::not_found("Billable", billable_id))?;
        let email = billable
            .bill_fields()
            .map(|fields| fields.email.clone())
            .ok_or(BillingError::BillFieldsMissing(billable_id))?;

        let request = StoreCardRequest {
            locale: self.config().locale,
            email,
            card_user_key: self.stores().billables.card_user_key(billable_id).await?,
            alias: data.alias,
            holder_name: data.holder_name,
            number: data.number,
            expire_month: data.expire_month,
            expire_year: data.expire_year,
        };
        let stored = match self
            .call("create_stored_card", self.gateway().create_stored_card(request))
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!(billable_id = %billable_id, error = %e, "card could not be saved");
                return Err(BillingError::CardSaveFailed(e));
            }
        };

        self.stores()
            .billables
            .set_card_user_key(billable_id, stored.card_user_key)
            .await?;

        let card = StoredCard {
            id: self.stores().cards.next_id().await?,
            billable_id,
            alias: stored.alias,
            bin: stored.bin,
            last_four: stored.last_four,
            token: stored.token,
            bank: stored.bank,
            network: stored.network,
            verified: false,
            created_at: self.now(),
        };
        self.stores().cards.store(card.clone()).await?;
        info!(billable_id = %billable_id, card_id = %card.id, card = %card.masked_number(), "card saved");
        Ok(card)
    }

    /// Deletes a stored card on the gateway and locally. Past transactions
    /// keep their history but lose the card reference.
    pub async fn remove_card(&self, billable_id: BillableId, card_id: CardId) -> Result<()> {
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

        let request = DeleteCardRequest {
            locale: self.config().locale,
            card_user_key: self.stores().billables.card_user_key(billable_id).await?,
            card_token: card.token.clone(),
        };
        if let Err(e) = self
            .call("delete_stored_card", self.gateway().delete_stored_card(request))
            .await
        {
            warn!(card_id = %card_id, error = %e, "card could not be removed");
            return Err(BillingError::CardRemoveFailed(e));
        }

        self.stores().cards.delete(card_id).await?;
        self.stores().transactions.detach_card(card_id).await?;
        info!(billable_id = %billable_id, card_id = %card_id, "card removed");
        Ok(())
    }
}
