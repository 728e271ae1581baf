use super::billable::BillableId;
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

crate::id_type!(CardId);

/// A card tokenized and stored on the gateway side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCard {
    pub id: CardId,
    pub billable_id: BillableId,
    pub alias: String,
    /// Bank identification number (first six digits).
    pub bin: String,
    pub last_four: String,
    pub token: String,
    pub bank: Option<String>,
    /// Card network, e.g. `MASTER_CARD`.
    pub network: Option<String>,
    /// Flips to true after the first successful charge on this card.
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredCard {
    /// Masked card number used as the card reference in transaction errors.
    pub fn masked_number(&self) -> String {
        format!("{}******{}", self.bin, self.last_four)
    }

    pub fn belongs_to(&self, billable_id: BillableId) -> bool {
        self.billable_id == billable_id
    }
}

/// Raw card details submitted when storing a new card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardData {
    pub alias: String,
    pub holder_name: String,
    pub number: String,
    pub expire_month: String,
    pub expire_year: String,
}

impl CardData {
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.alias.trim().is_empty() {
            problems.push("alias is required");
        }
        if self.holder_name.trim().is_empty() {
            problems.push("holder is required");
        }
        if !is_digits(&self.number) || !(15..=16).contains(&self.number.len()) {
            problems.push("number must be 15 or 16 digits");
        }
        if !is_digits(&self.expire_month) || self.expire_month.len() != 2 {
            problems.push("month must be 2 digits");
        }
        if !is_digits(&self.expire_year) || self.expire_year.len() != 4 {
            problems.push("year must be 4 digits");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BillingError::ValidationError(problems.join(", ")))
        }
    }
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}
