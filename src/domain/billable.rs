use crate::error::{BillingError, Result};
use serde::{Deserialize, Serialize};

crate::id_type!(
    /// Identifier of the party that owns cards, transactions and subscriptions.
    BillableId
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub city: String,
    pub country: String,
    pub address: String,
}

/// Billing profile the gateway needs to build buyer and address records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillFields {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub identity_number: String,
    pub mobile_number: String,
    pub shipping_address: Address,
    pub billing_address: Address,
}

impl BillFields {
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("first name", &self.first_name),
            ("last name", &self.last_name),
            ("email", &self.email),
            ("identity number", &self.identity_number),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(BillingError::ValidationError(format!(
                    "Bill fields cannot be empty: {field}"
                )));
            }
        }
        Ok(())
    }

    pub fn contact_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Capability implemented by any entity that can pay.
///
/// The billing engine only ever talks to owners through this trait.
pub trait Billable: Send + Sync {
    fn billable_id(&self) -> BillableId;

    fn bill_fields(&self) -> Option<&BillFields>;

    /// An owner is billable once it carries a complete billing profile.
    fn is_billable(&self) -> bool {
        self.bill_fields().is_some_and(|fields| fields.validate().is_ok())
    }
}

/// The stock owner entity shipped with the crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: BillableId,
    #[serde(default)]
    pub bill_fields: Option<BillFields>,
    /// Key the gateway assigns to the owner when its first card is stored.
    #[serde(default)]
    pub card_user_key: Option<String>,
}

impl Customer {
    pub fn new(id: BillableId, bill_fields: Option<BillFields>) -> Self {
        Self {
            id,
            bill_fields,
            card_user_key: None,
        }
    }
}

impl Billable for Customer {
    fn billable_id(&self) -> BillableId {
        self.id
    }

    fn bill_fields(&self) -> Option<&BillFields> {
        self.bill_fields.as_ref()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_customer_without_profile_is_not_billable() {
        let customer = Customer::new(BillableId(1), None);
        assert!(!customer.is_billable());
    }

    #[test]
    fn test_customer_with_blank_email_is_not_billable() {
        let mut fields = fixtures::bill_fields();
        fields.email = "  ".to_string();
        let customer = Customer::new(BillableId(1), Some(fields));
        assert!(!customer.is_billable());
    }

    #[test]
    fn test_customer_with_profile_is_billable() {
        let customer = Customer::new(BillableId(7), Some(fixtures::bill_fields()));
        assert!(customer.is_billable());
        assert_eq!(customer.billable_id(), BillableId(7));
    }

    #[test]
    fn test_bill_fields_use_camel_case() {
        let json = serde_json::to_value(fixtures::bill_fields()).unwrap();
        assert!(json.get("firstName").is_some());
        assert!(json["billingAddress"].get("city").is_some());
    }
}
