use super::billable::BillableId;
use super::money::{Amount, Currency};
use super::plan::PlanSnapshot;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

crate::id_type!(SubscriptionId);

/// Status derived from the subscription's dates; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PendingCancellation,
    Canceled,
    Overdue,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Active => "active",
            Self::PendingCancellation => "pending_cancellation",
            Self::Canceled => "canceled",
            Self::Overdue => "overdue",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub billable_id: BillableId,
    pub next_charge_amount: Amount,
    pub currency: Currency,
    pub next_charge_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub plan: PlanSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Opens a subscription on `plan`. The first charge date is the end of the
    /// trial when the plan has one, otherwise one billing interval from now.
    pub fn open(
        id: SubscriptionId,
        billable_id: BillableId,
        plan: PlanSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let next_charge_at = if plan.has_trial() {
            now + Duration::days(i64::from(plan.trial_days))
        } else {
            plan.interval.advance(now)?
        };

        Ok(Self {
            id,
            billable_id,
            next_charge_amount: plan.price,
            currency: plan.currency,
            next_charge_at: Some(next_charge_at),
            canceled_at: None,
            plan,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn status(&self, now: DateTime<Utc>) -> SubscriptionStatus {
        if let Some(canceled_at) = self.canceled_at {
            return if canceled_at > now {
                SubscriptionStatus::PendingCancellation
            } else {
                SubscriptionStatus::Canceled
            };
        }

        match self.next_charge_at {
            Some(next) if next >= now => SubscriptionStatus::Active,
            Some(_) => SubscriptionStatus::Overdue,
            None => SubscriptionStatus::Canceled,
        }
    }

    /// Due for billing: not canceled and the next charge date has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.canceled_at.is_none() && self.next_charge_at.is_some_and(|next| next < now)
    }

    pub fn is_canceled(&self, now: DateTime<Utc>) -> bool {
        self.canceled_at.is_some_and(|canceled_at| canceled_at <= now)
    }

    pub fn trial_ends_at(&self) -> Option<DateTime<Utc>> {
        self.plan
            .has_trial()
            .then(|| self.created_at + Duration::days(i64::from(self.plan.trial_days)))
    }

    pub fn is_trial(&self, now: DateTime<Utc>) -> bool {
        self.trial_ends_at().is_some_and(|ends| now < ends)
    }

    /// Moves the next charge date one interval past `now` after a successful charge.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.next_charge_at = Some(self.plan.interval.advance(now)?);
        self.updated_at = now;
        Ok(())
    }

    /// Graceful cancellation: access is kept until the paid period ends.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.canceled_at = Some(self.next_charge_at.unwrap_or(now));
        self.next_charge_at = None;
        self.updated_at = now;
    }

    /// Immediate cancellation.
    pub fn force_cancel(&mut self, now: DateTime<Utc>) {
        self.canceled_at = Some(now);
        self.next_charge_at = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use rust_decimal_macros::dec;

    pub fn plan(trial_days: u32) -> PlanSnapshot {
        PlanSnapshot::new("gold-monthly", "Gold Membership", Amount::new(dec!(100)).unwrap())
            .unwrap()
            .trial_days(trial_days)
    }
}
