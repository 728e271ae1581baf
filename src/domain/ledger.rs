//! Refund and void bookkeeping for a single transaction.
//!
//! Reversal events are append-only. Refund events count toward the refund cap,
//! void events are tracked separately.

use super::money::Money;
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReversalKind {
    Void,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalEvent {
    #[serde(rename = "type")]
    pub kind: ReversalKind,
    pub amount: Money,
    pub gateway_reference: String,
    /// Present on refunds only.
    #[serde(default)]
    pub gateway_transaction_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl ReversalEvent {
    pub fn void(amount: Money, gateway_reference: String, at: DateTime<Utc>) -> Self {
        Self {
            kind: ReversalKind::Void,
            amount,
            gateway_reference,
            gateway_transaction_id: None,
            at,
        }
    }

    pub fn refund(
        amount: Money,
        gateway_reference: String,
        gateway_transaction_id: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ReversalKind::Refund,
            amount,
            gateway_reference,
            gateway_transaction_id,
            at,
        }
    }
}

/// Read-only view over a transaction's amount and its reversal log.
#[derive(Debug, Clone, Copy)]
pub struct Ledger<'a> {
    amount: Money,
    events: &'a [ReversalEvent],
}

impl<'a> Ledger<'a> {
    pub fn new(amount: Money, events: &'a [ReversalEvent]) -> Self {
        Self { amount, events }
    }

    fn total_of(&self, kind: ReversalKind) -> Money {
        self.events
            .iter()
            .filter(|event| event.kind == kind)
            .map(|event| event.amount)
            .sum()
    }

    pub fn refunded_amount(&self) -> Money {
        self.total_of(ReversalKind::Refund)
    }

    pub fn voided_amount(&self) -> Money {
        self.total_of(ReversalKind::Void)
    }

    pub fn remaining_balance(&self) -> Money {
        self.amount - self.refunded_amount()
    }

    pub fn is_fully_refunded(&self) -> bool {
        self.remaining_balance().is_zero()
    }

    /// Resolves the amount of a refund request.
    ///
    /// `None` means the whole remaining balance. The resolved amount must be
    /// positive, in whole cents, and no larger than the remaining balance.
    pub fn resolve_refund(&self, requested: Option<Decimal>) -> Result<Money> {
        let remaining = self.remaining_balance();
        let amount = match requested {
            Some(value) => Money::exact(value)?,
            None => remaining,
        };

        if !amount.is_positive() {
            return Err(BillingError::InvalidArgument(
                "Refund amount must be greater than zero".to_string(),
            ));
        }
        if amount > remaining {
            return Err(BillingError::InvalidArgument(format!(
                "Refund amount ({amount}) exceeds the remaining refundable balance ({remaining})"
            )));
        }
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn money(value: Decimal) -> Money {
        Money::exact(value).unwrap()
    }

    fn refund(value: Decimal) -> ReversalEvent {
        ReversalEvent::refund(money(value), "ref".to_string(), Some("ptx".to_string()), Utc::now())
    }

    #[test]
    fn test_empty_ledger() {
        let ledger = Ledger::new(money(dec!(100)), &[]);
        assert_eq!(ledger.refunded_amount(), Money::ZERO);
        assert_eq!(ledger.remaining_balance(), money(dec!(100)));
        assert!(!ledger.is_fully_refunded());
    }

    #[test]
    fn test_voids_do_not_count_toward_refunds() {
        let events = vec![
            ReversalEvent::void(money(dec!(100)), "v".to_string(), Utc::now()),
            refund(dec!(10)),
        ];
        let ledger = Ledger::new(money(dec!(100)), &events);
        assert_eq!(ledger.voided_amount(), money(dec!(100)));
        assert_eq!(ledger.refunded_amount(), money(dec!(10)));
        assert_eq!(ledger.remaining_balance(), money(dec!(90)));
    }

    #[test]
    fn test_resolve_defaults_to_remaining_balance() {
        let events = vec![refund(dec!(40))];
        let ledger = Ledger::new(money(dec!(100)), &events);
        assert_eq!(ledger.resolve_refund(None).unwrap(), money(dec!(60)));
        assert_eq!(ledger.resolve_refund(Some(dec!(60.00))).unwrap(), money(dec!(60)));
    }

    #[test]
    fn test_resolve_rejects_invalid_amounts() {
        let events = vec![refund(dec!(40))];
        let ledger = Ledger::new(money(dec!(100)), &events);

        for requested in [dec!(0), dec!(-5), dec!(60.01), dec!(60.0002)] {
            assert!(
                matches!(
                    ledger.resolve_refund(Some(requested)),
                    Err(BillingError::InvalidArgument(_))
                ),
                "{requested} should be rejected"
            );
        }
    }

    #[test]
    fn test_fully_refunded_ledger_rejects_default_refund() {
        let events = vec![refund(dec!(40)), refund(dec!(60))];
        let ledger = Ledger::new(money(dec!(100)), &events);
        assert!(ledger.is_fully_refunded());
        assert!(matches!(
            ledger.resolve_refund(None),
            Err(BillingError::InvalidArgument(_))
        ));
    }
}
