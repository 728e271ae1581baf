use super::money::{Amount, Currency, Money};
use crate::error::{BillingError, Result};
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[default]
    Monthly,
    Yearly,
}

impl Interval {
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Yearly => 12,
        }
    }

    /// Moves `from` forward by one billing period, keeping the day of month
    /// (clamped to the last day of shorter months).
    pub fn advance(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        from.checked_add_months(Months::new(self.months()))
            .ok_or_else(|| BillingError::ValidationError(format!("Cannot advance {from} by {self:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    #[default]
    Physical,
    Virtual,
}

/// Immutable copy of a catalog plan, captured when a subscription is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSnapshot {
    pub id: String,
    pub name: String,
    pub price: Amount,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default)]
    pub interval: Interval,
    #[serde(default)]
    pub trial_days: u32,
    #[serde(default)]
    pub features: Vec<String>,
}

impl PlanSnapshot {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: Amount) -> Result<Self> {
        let plan = Self {
            id: id.into(),
            name: name.into(),
            price,
            currency: Currency::default(),
            interval: Interval::default(),
            trial_days: 0,
            features: Vec::new(),
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BillingError::ValidationError(
                "Plan ID cannot be blank".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(BillingError::ValidationError(
                "Plan name cannot be blank".to_string(),
            ));
        }
        Ok(())
    }

    pub fn currency(mut self, currency: Currency) -> Self {
        self.currency = currency;
        self
    }

    pub fn yearly(mut self) -> Self {
        self.interval = Interval::Yearly;
        self
    }

    pub fn monthly(mut self) -> Self {
        self.interval = Interval::Monthly;
        self
    }

    pub fn trial_days(mut self, days: u32) -> Self {
        self.trial_days = days;
        self
    }

    pub fn has_trial(&self) -> bool {
        self.trial_days > 0
    }
}

/// A one-off product sold outside a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: Amount,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default = "Product::default_category")]
    pub category: String,
    #[serde(default)]
    pub item_type: ItemType,
}

impl Product {
    fn default_category() -> String {
        "General".to_string()
    }
}

/// A priced basket entry on a transaction.
///
/// Persisted with an explicit `kind` tag and decoded by matching on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineItem {
    Plan(PlanSnapshot),
    Product(Product),
}

impl LineItem {
    pub fn id(&self) -> &str {
        match self {
            Self::Plan(plan) => &plan.id,
            Self::Product(product) => &product.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Plan(plan) => &plan.name,
            Self::Product(product) => &product.name,
        }
    }

    pub fn price(&self) -> Amount {
        match self {
            Self::Plan(plan) => plan.price,
            Self::Product(product) => product.price,
        }
    }

    pub fn category(&self) -> &str {
        match self {
            Self::Plan(_) => "Plan",
            Self::Product(product) => &product.category,
        }
    }

    pub fn item_type(&self) -> ItemType {
        match self {
            Self::Plan(_) => ItemType::Virtual,
            Self::Product(product) => product.item_type,
        }
    }
}

pub fn line_items_total(items: &[LineItem]) -> Money {
    items.iter().map(|item| item.price().money()).sum()
}
