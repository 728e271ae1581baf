use super::config::BillingConfig;
use crate::domain::billable::BillFields;
use crate::domain::card::StoredCard;
use crate::domain::events::BillingEvent;
use crate::domain::gateway::{
    BasketItem, BkmSession, Buyer, CardReference, GatewayBox, GatewayError, GatewayResult,
    PaymentGroup, PaymentRequest, PaymentResult, PostalAddress, RefundRequest,
    ThreedsConfirmRequest, ThreedsSession, VoidRequest,
};
use crate::domain::ledger::ReversalEvent;
use crate::domain::money::Money;
use crate::domain::ports::{
    BillableDirectoryBox, CardStoreBox, ClockBox, EventSinkBox, SubscriptionStoreBox,
    TransactionStoreBox,
};
use crate::domain::transaction::{
    NewTransaction, Transaction, TransactionError, TransactionId, TransactionStatus,
};
use crate::error::{BillingError, Result};
use crate::infrastructure::clock::SystemClock;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use tracing::{error, info, warn};

/// Error message recorded when the payer leaves the bank page without finishing.
pub const PAYMENT_CANCELLED: &str = "payment cancelled";

/// The storage backends the engine drives.
pub struct Stores {
    pub transactions: TransactionStoreBox,
    pub subscriptions: SubscriptionStoreBox,
    pub cards: CardStoreBox,
    pub billables: BillableDirectoryBox,
}

/// Payload of the bank's 3-D Secure callback once it reported success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreedsConfirmation {
    /// Local transaction id, echoed back by the gateway.
    pub conversation_id: TransactionId,
    pub payment_id: String,
    pub conversation_data: Option<String>,
}

/// Everything needed to talk to the gateway on behalf of a transaction's owner.
struct Payer {
    fields: BillFields,
    card: StoredCard,
    card_user_key: Option<String>,
}

/// Orchestrates every transaction flow against the gateway.
///
/// Each operation persists the transaction before returning, whatever the
/// outcome. Gateway failures are recorded on the transaction and then returned
/// as a typed [`BillingError`]; nothing is retried.
pub struct BillingEngine {
    stores: Stores,
    gateway: GatewayBox,
    events: EventSinkBox,
    clock: ClockBox,
    config: BillingConfig,
}

impl BillingEngine {
    pub fn new(stores: Stores, gateway: GatewayBox, events: EventSinkBox, config: BillingConfig) -> Self {
        Self {
            stores,
            gateway,
            events,
            clock: Box::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: ClockBox) -> Self {
        self.clock = clock;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn gateway(&self) -> &GatewayBox {
        &self.gateway
    }

    pub(crate) async fn publish(&self, event: BillingEvent) {
        self.events.publish(event).await;
    }

    pub async fn transaction(&self, id: TransactionId) -> Result<Transaction> {
        self.stores
            .transactions
            .get(id)
            .await?
            .ok_or_else(|| BillingError::not_found("Transaction", id))
    }

    /// Validates and persists a new pending transaction.
    pub async fn create_transaction(&self, new: NewTransaction) -> Result<Transaction> {
        new.validate()?;
        let id = self.stores.transactions.next_id().await?;
        let tx = Transaction::pending(id, new, self.now());
        self.stores.transactions.store(tx.clone()).await?;
        info!(
            transaction_id = %tx.id,
            kind = ?tx.kind,
            amount = %tx.amount,
            "transaction created"
        );
        Ok(tx)
    }

    /// Charges the transaction's card directly.
    pub async fn charge(&self, tx: &mut Transaction) -> Result<()> {
        tx.ensure_status(&[TransactionStatus::Pending], TransactionStatus::Success)?;
        let payer = self.prepare(tx).await?;

        let request = self.payment_request(tx, &payer, None);
        match self
            .call("create_payment", self.gateway.create_payment(request))
            .await
        {
            Ok(payment) => {
                self.complete(tx, payment, Some(payer.card)).await?;
                info!(transaction_id = %tx.id, amount = %tx.amount, "charge succeeded");
                Ok(())
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "charge declined");
                self.fail(tx, &e.message, Some(&payer.card)).await?;
                Err(BillingError::PaymentDeclined(e))
            }
        }
    }

    /// Starts a 3-D Secure payment. The transaction stays pending until the
    /// bank calls back.
    pub async fn initialize_threeds(&self, tx: &mut Transaction) -> Result<ThreedsSession> {
        tx.ensure_status(&[TransactionStatus::Pending], TransactionStatus::Success)?;
        let payer = self.prepare(tx).await?;

        let request = self.payment_request(tx, &payer, Some(self.config.threeds_callback_url.clone()));
        match self
            .call("initialize_threeds", self.gateway.initialize_threeds(request))
            .await
        {
            Ok(session) => {
                tx.gateway_reference = Some(session.reference_key.clone());
                tx.updated_at = self.now();
                self.stores.transactions.store(tx.clone()).await?;
                info!(transaction_id = %tx.id, "3-D Secure initialized");
                Ok(session)
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "3-D Secure initialization failed");
                self.fail(tx, &e.message, Some(&payer.card)).await?;
                Err(BillingError::ThreedsInitializeFailed(e))
            }
        }
    }

    /// Completes a 3-D Secure payment from the bank's success callback.
    pub async fn confirm_threeds(&self, confirmation: ThreedsConfirmation) -> Result<Transaction> {
        let mut tx = self.transaction(confirmation.conversation_id).await?;
        tx.ensure_status(&[TransactionStatus::Pending], TransactionStatus::Success)?;
        let card = self.card_of(&tx).await?;

        let request = ThreedsConfirmRequest {
            locale: self.config.locale,
            conversation_id: tx.id.to_string(),
            payment_id: confirmation.payment_id,
            conversation_data: confirmation.conversation_data,
        };
        match self
            .call("confirm_threeds", self.gateway.confirm_threeds(request))
            .await
        {
            Ok(payment) => {
                self.complete(&mut tx, payment, card).await?;
                info!(transaction_id = %tx.id, amount = %tx.amount, "3-D Secure payment succeeded");
                self.publish(BillingEvent::ThreedsCallbackSucceeded {
                    transaction: tx.clone(),
                })
                .await;
                Ok(tx)
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "3-D Secure payment failed");
                self.fail(&mut tx, &e.message, card.as_ref()).await?;
                self.publish(BillingEvent::ThreedsCallbackCanceled { transaction: tx })
                    .await;
                Err(BillingError::ThreedsConfirmFailed(e))
            }
        }
    }

    /// Fails a pending transaction whose payer abandoned the bank page.
    pub async fn cancel_threeds(&self, id: TransactionId) -> Result<Transaction> {
        let mut tx = self.transaction(id).await?;
        tx.ensure_status(&[TransactionStatus::Pending], TransactionStatus::Failed)?;
        let card = self.card_of(&tx).await?;

        self.fail(&mut tx, PAYMENT_CANCELLED, card.as_ref()).await?;
        info!(transaction_id = %tx.id, "3-D Secure payment cancelled by payer");
        self.publish(BillingEvent::ThreedsCallbackCanceled {
            transaction: tx.clone(),
        })
        .await;
        Ok(tx)
    }

    /// Starts a BKM wallet payment. Like 3-D Secure, it completes on callback.
    pub async fn initialize_bkm(&self, tx: &mut Transaction) -> Result<BkmSession> {
        tx.ensure_status(&[TransactionStatus::Pending], TransactionStatus::Success)?;
        let payer = self.prepare(tx).await?;

        let request = self.payment_request(tx, &payer, Some(self.config.bkm_callback_url.clone()));
        match self
            .call("initialize_bkm", self.gateway.initialize_bkm(request))
            .await
        {
            Ok(session) => {
                tx.gateway_reference = Some(session.reference_key.clone());
                tx.updated_at = self.now();
                self.stores.transactions.store(tx.clone()).await?;
                info!(transaction_id = %tx.id, "BKM payment initialized");
                Ok(session)
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "BKM initialization failed");
                self.fail(tx, &e.message, Some(&payer.card)).await?;
                Err(BillingError::BkmInitializeFailed(e))
            }
        }
    }

    /// Completes a BKM wallet payment from its callback token.
    pub async fn confirm_bkm(&self, id: TransactionId, token: &str) -> Result<Transaction> {
        let mut tx = self.transaction(id).await?;
        tx.ensure_status(&[TransactionStatus::Pending], TransactionStatus::Success)?;
        let card = self.card_of(&tx).await?;

        match self.call("retrieve_bkm", self.gateway.retrieve_bkm(token)).await {
            Ok(payment) => {
                self.complete(&mut tx, payment, card).await?;
                info!(transaction_id = %tx.id, amount = %tx.amount, "BKM payment succeeded");
                self.publish(BillingEvent::ThreedsCallbackSucceeded {
                    transaction: tx.clone(),
                })
                .await;
                Ok(tx)
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "BKM payment failed");
                self.fail(&mut tx, &e.message, card.as_ref()).await?;
                self.publish(BillingEvent::ThreedsCallbackCanceled { transaction: tx })
                    .await;
                Err(BillingError::PaymentDeclined(e))
            }
        }
    }

    /// Cancels a successful transaction on the day it was created.
    pub async fn void(&self, tx: &mut Transaction) -> Result<()> {
        tx.ensure_status(&[TransactionStatus::Success], TransactionStatus::Voided)?;
        let now = self.now();
        if !tx.created_same_day(now) {
            return Err(BillingError::VoidNotAllowed(tx.id));
        }
        let reference_key = tx.gateway_reference.clone().ok_or_else(|| {
            BillingError::ValidationError(format!("Transaction {} has no gateway reference", tx.id))
        })?;

        let request = VoidRequest {
            locale: self.config.locale,
            reference_key,
        };
        let result = match self.call("create_void", self.gateway.create_void(request)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "void failed");
                return Err(BillingError::VoidFailed(e));
            }
        };

        let amount = Money::from_gateway(result.amount);
        tx.record_void(ReversalEvent::void(amount, result.reference_key, now), now)?;
        self.stores.transactions.store(tx.clone()).await?;
        info!(transaction_id = %tx.id, %amount, "transaction voided");
        Ok(())
    }

    /// Refunds `amount`, or the whole remaining balance when `None`.
    pub async fn refund(&self, tx: &mut Transaction, amount: Option<Decimal>) -> Result<()> {
        tx.ensure_status(
            &[TransactionStatus::Success, TransactionStatus::PartialRefunded],
            TransactionStatus::PartialRefunded,
        )?;
        let requested = tx.ledger().resolve_refund(amount)?;
        let payment_transaction_id = tx
            .gateway_transaction_id
            .clone()
            .ok_or(BillingError::MissingGatewayTransactionId(tx.id))?;

        let request = RefundRequest {
            locale: self.config.locale,
            payment_transaction_id,
            amount: requested.value(),
            currency: tx.currency,
        };
        let result = match self.call("create_refund", self.gateway.create_refund(request)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "refund failed");
                return Err(BillingError::RefundFailed(e));
            }
        };

        let reported = Money::from_gateway(result.amount);
        let remaining = tx.ledger().remaining_balance();
        let recorded = if reported.is_positive() && reported <= remaining {
            reported
        } else {
            warn!(
                transaction_id = %tx.id,
                %requested,
                %reported,
                "gateway reported an out-of-range refund amount, recording the requested amount"
            );
            requested
        };

        let now = self.now();
        let event = ReversalEvent::refund(
            recorded,
            result.reference_key,
            Some(result.payment_transaction_id),
            now,
        );
        tx.record_refund(event, now)?;
        self.stores.transactions.store(tx.clone()).await?;
        info!(
            transaction_id = %tx.id,
            amount = %recorded,
            status = %tx.status,
            "transaction refunded"
        );
        Ok(())
    }

    /// Bounds a gateway call by the configured timeout.
    pub(crate) async fn call<T, F>(&self, operation: &'static str, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        match tokio::time::timeout(self.config.gateway_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    operation,
                    "gateway call timed out, remote state must be reconciled manually"
                );
                Err(GatewayError::timeout(operation))
            }
        }
    }

    /// Checks the charge preconditions, failing the transaction when they do not hold.
    async fn prepare(&self, tx: &mut Transaction) -> Result<Payer> {
        match self.payer(tx).await {
            Ok(payer) => Ok(payer),
            Err(e @ (BillingError::BillFieldsMissing(_)
            | BillingError::CardNotOwned { .. }
            | BillingError::ValidationError(_)
            | BillingError::NotFound { .. })) => {
                warn!(transaction_id = %tx.id, error = %e, "charge rejected before reaching the gateway");
                self.fail(tx, &e.to_string(), None).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn payer(&self, tx: &Transaction) -> Result<Payer> {
        let billable = self
            .stores
            .billables
            .find(tx.billable_id)
            .await?
            .ok_or_else(|| BillingError::not_found("Billable", tx.billable_id))?;
        let fields = billable
            .bill_fields()
            .filter(|fields| fields.validate().is_ok())
            .cloned()
            .ok_or(BillingError::BillFieldsMissing(tx.billable_id))?;

        let card_id = tx.card_id.ok_or_else(|| {
            BillingError::ValidationError(format!("Transaction {} has no card", tx.id))
        })?;
        let card = self
            .stores
            .cards
            .get(card_id)
            .await?
            .ok_or_else(|| BillingError::not_found("Card", card_id))?;
        if !card.belongs_to(tx.billable_id) {
            return Err(BillingError::CardNotOwned {
                card: card_id,
                billable: tx.billable_id,
            });
        }

        let card_user_key = self.stores.billables.card_user_key(tx.billable_id).await?;
        Ok(Payer {
            fields,
            card,
            card_user_key,
        })
    }

    async fn card_of(&self, tx: &Transaction) -> Result<Option<StoredCard>> {
        match tx.card_id {
            Some(id) => self.stores.cards.get(id).await,
            None => Ok(None),
        }
    }

    fn payment_request(&self, tx: &Transaction, payer: &Payer, callback_url: Option<String>) -> PaymentRequest {
        let contact_name = payer.fields.contact_name();
        PaymentRequest {
            locale: self.config.locale,
            conversation_id: tx.id.to_string(),
            price: tx.amount.value(),
            paid_price: tx.amount.value(),
            currency: tx.currency,
            installment: tx.installment,
            basket_id: tx.id.to_string(),
            payment_group: if tx.subscription_id.is_some() {
                PaymentGroup::Subscription
            } else {
                PaymentGroup::Product
            },
            card: CardReference {
                card_user_key: payer.card_user_key.clone(),
                card_token: payer.card.token.clone(),
            },
            buyer: Buyer::from_bill_fields(tx.billable_id, &payer.fields),
            shipping_address: PostalAddress::new(contact_name.clone(), &payer.fields.shipping_address),
            billing_address: PostalAddress::new(contact_name, &payer.fields.billing_address),
            basket_items: tx.products.iter().map(BasketItem::from).collect(),
            callback_url,
        }
    }

    /// Marks the transaction successful and its card verified.
    ///
    /// Runs after the gateway captured the payment, so any storage failure is
    /// surfaced as [`BillingError::CaptureNotRecorded`].
    async fn complete(&self, tx: &mut Transaction, payment: PaymentResult, card: Option<StoredCard>) -> Result<()> {
        let id = tx.id;
        self.record_capture(tx, payment, card).await.map_err(|e| {
            error!(
                transaction_id = %id,
                error = %e,
                "payment captured but could not be recorded, reconcile manually"
            );
            BillingError::CaptureNotRecorded {
                transaction: id,
                reason: e.to_string(),
            }
        })
    }

    async fn record_capture(&self, tx: &mut Transaction, payment: PaymentResult, card: Option<StoredCard>) -> Result<()> {
        let transaction_id = payment.first_payment_transaction_id();
        tx.mark_succeeded(payment.reference_key, transaction_id, self.now())?;
        self.stores.transactions.store(tx.clone()).await?;

        if let Some(mut card) = card
            && !card.verified
        {
            card.verified = true;
            self.stores.cards.store(card).await?;
        }
        Ok(())
    }

    /// Records the failure and drops a subscription opened for this attempt.
    async fn fail(&self, tx: &mut Transaction, message: &str, card: Option<&StoredCard>) -> Result<()> {
        let error = TransactionError {
            message: message.to_string(),
            card: card.map(StoredCard::masked_number),
        };
        tx.mark_failed(error, self.now())?;

        if tx.opens_subscription
            && let Some(subscription_id) = tx.subscription_id.take()
        {
            self.stores.subscriptions.delete(subscription_id).await?;
            self.stores
                .transactions
                .detach_subscription(subscription_id)
                .await?;
            info!(
                transaction_id = %tx.id,
                %subscription_id,
                "subscription opened for a failed payment removed"
            );
        }

        self.stores.transactions.store(tx.clone()).await
    }
}
