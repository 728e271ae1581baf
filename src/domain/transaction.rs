use super::billable::BillableId;
use super::card::CardId;
use super::ledger::{Ledger, ReversalEvent};
use super::money::{Amount, Currency};
use super::plan::{LineItem, line_items_total};
use super::subscription::SubscriptionId;
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

crate::id_type!(
    /// Local transaction id, also sent to the gateway as the conversation id.
    TransactionId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    #[default]
    Charge,
    Verification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Success,
    Failed,
    Voided,
    Refunded,
    PartialRefunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Voided => "voided",
            Self::Refunded => "refunded",
            Self::PartialRefunded => "partial_refunded",
        }
    }

    /// Allowed edges of the transaction lifecycle.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Success)
                | (Pending, Failed)
                | (Success, Voided)
                | (Success, Refunded)
                | (Success, PartialRefunded)
                | (PartialRefunded, PartialRefunded)
                | (PartialRefunded, Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Voided | Self::Refunded)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure recorded on a failed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionError {
    pub message: String,
    /// Masked number of the card the attempt was made with.
    #[serde(default)]
    pub card: Option<String>,
}

/// Input for creating a pending transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub billable_id: BillableId,
    pub card_id: Option<CardId>,
    pub subscription_id: Option<SubscriptionId>,
    /// Set when the subscription was created for this very charge attempt.
    pub opens_subscription: bool,
    pub amount: Amount,
    pub currency: Currency,
    pub installment: u8,
    pub products: Vec<LineItem>,
}

impl NewTransaction {
    pub fn charge(billable_id: BillableId, card_id: CardId, products: Vec<LineItem>) -> Result<Self> {
        let total = line_items_total(&products);
        let amount = Amount::new(total.value())?;
        let currency = products
            .first()
            .map(|item| match item {
                LineItem::Plan(plan) => plan.currency,
                LineItem::Product(product) => product.currency,
            })
            .unwrap_or_default();

        Ok(Self {
            kind: TransactionKind::Charge,
            billable_id,
            card_id: Some(card_id),
            subscription_id: None,
            opens_subscription: false,
            amount,
            currency,
            installment: 1,
            products,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.installment == 0 {
            return Err(BillingError::ValidationError(
                "Installment must be at least 1".to_string(),
            ));
        }
        if self.products.is_empty() {
            return Err(BillingError::ValidationError(
                "A transaction needs at least one line item".to_string(),
            ));
        }
        let total = line_items_total(&self.products);
        if total != self.amount.money() {
            return Err(BillingError::ValidationError(format!(
                "Line items total {total} does not match amount {}",
                self.amount
            )));
        }
        Ok(())
    }
}

/// A single charge attempt and its reversal history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub billable_id: BillableId,
    pub card_id: Option<CardId>,
    pub subscription_id: Option<SubscriptionId>,
    #[serde(default)]
    pub opens_subscription: bool,
    pub amount: Amount,
    pub currency: Currency,
    pub installment: u8,
    pub products: Vec<LineItem>,
    pub gateway_reference: Option<String>,
    /// First payment item id; required for refunds.
    pub gateway_transaction_id: Option<String>,
    pub status: TransactionStatus,
    pub error: Option<TransactionError>,
    #[serde(default)]
    pub refunds: Vec<ReversalEvent>,
    pub voided_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn pending(id: TransactionId, new: NewTransaction, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: new.kind,
            billable_id: new.billable_id,
            card_id: new.card_id,
            subscription_id: new.subscription_id,
            opens_subscription: new.opens_subscription,
            amount: new.amount,
            currency: new.currency,
            installment: new.installment,
            products: new.products,
            gateway_reference: None,
            gateway_transaction_id: None,
            status: TransactionStatus::Pending,
            error: None,
            refunds: Vec::new(),
            voided_at: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn ledger(&self) -> Ledger<'_> {
        Ledger::new(self.amount.money(), &self.refunds)
    }

    pub fn ensure_status(&self, expected: &[TransactionStatus], next: TransactionStatus) -> Result<()> {
        if expected.contains(&self.status) && self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(BillingError::InvalidTransition {
                from: self.status,
                to: next,
            })
        }
    }

    fn transition(&mut self, next: TransactionStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BillingError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_succeeded(
        &mut self,
        gateway_reference: String,
        gateway_transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(TransactionStatus::Success, now)?;
        self.gateway_reference = Some(gateway_reference);
        if gateway_transaction_id.is_some() {
            self.gateway_transaction_id = gateway_transaction_id;
        }
        self.error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: TransactionError, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Failed, now)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn record_void(&mut self, event: ReversalEvent, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Voided, now)?;
        self.refunds.push(event);
        self.voided_at = Some(now);
        Ok(())
    }

    /// Appends a refund event and settles the status from the cumulative total.
    pub fn record_refund(&mut self, event: ReversalEvent, now: DateTime<Utc>) -> Result<()> {
        let remaining = self.ledger().remaining_balance();
        if event.amount > remaining {
            return Err(BillingError::InvalidArgument(format!(
                "Refund of {} exceeds the remaining balance ({remaining})",
                event.amount
            )));
        }

        let fully_refunded = event.amount == remaining;
        let next = if fully_refunded {
            TransactionStatus::Refunded
        } else {
            TransactionStatus::PartialRefunded
        };
        self.transition(next, now)?;

        self.refunds.push(event);
        if fully_refunded {
            self.refunded_at = Some(now);
        }
        Ok(())
    }

    /// Whether the transaction was created on the same calendar day (UTC) as `now`.
    pub fn created_same_day(&self, now: DateTime<Utc>) -> bool {
        self.created_at.date_naive() == now.date_naive()
    }
}
