//! Contract of the remote card processor.
//!
//! Adapters must map every transport problem into a [`GatewayError`]; nothing
//! raw crosses this boundary.

use super::billable::{Address, BillFields, BillableId};
use super::money::Currency;
use super::plan::{ItemType, LineItem};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayErrorKind {
    /// The processor answered with a failure status.
    Declined,
    /// The processor could not be reached.
    Connection,
    /// No answer within the configured timeout; remote state is unknown.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            kind: GatewayErrorKind::Declined,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: GatewayErrorKind::Connection,
            message: format!("Connection Error: {}", message.into()),
        }
    }

    pub fn timeout(operation: &str) -> Self {
        Self {
            kind: GatewayErrorKind::Timeout,
            message: format!("Gateway timed out during {operation}"),
        }
    }

    pub fn is_declined(&self) -> bool {
        self.kind == GatewayErrorKind::Declined
    }

    /// A timed-out call may still have been processed remotely.
    pub fn needs_reconciliation(&self) -> bool {
        self.kind == GatewayErrorKind::Timeout
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GatewayError {}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Tr,
    En,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentGroup {
    Product,
    Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buyer {
    pub id: BillableId,
    pub name: String,
    pub surname: String,
    pub email: String,
    pub gsm_number: String,
    pub identity_number: String,
    pub city: String,
    pub country: String,
    pub registration_address: String,
}

impl Buyer {
    pub fn from_bill_fields(id: BillableId, fields: &BillFields) -> Self {
        Self {
            id,
            name: fields.first_name.clone(),
            surname: fields.last_name.clone(),
            email: fields.email.clone(),
            gsm_number: fields.mobile_number.clone(),
            identity_number: fields.identity_number.clone(),
            city: fields.billing_address.city.clone(),
            country: fields.billing_address.country.clone(),
            registration_address: fields.billing_address.address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostalAddress {
    pub contact_name: String,
    pub city: String,
    pub country: String,
    pub address: String,
}

impl PostalAddress {
    pub fn new(contact_name: String, address: &Address) -> Self {
        Self {
            contact_name,
            city: address.city.clone(),
            country: address.country.clone(),
            address: address.address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasketItem {
    pub id: String,
    pub name: String,
    pub category: String,
    pub price: Decimal,
    pub item_type: ItemType,
}

impl From<&LineItem> for BasketItem {
    fn from(item: &LineItem) -> Self {
        Self {
            id: item.id().to_string(),
            name: item.name().to_string(),
            category: item.category().to_string(),
            price: item.price().value(),
            item_type: item.item_type(),
        }
    }
}

/// Reference to a stored card on the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardReference {
    pub card_user_key: Option<String>,
    pub card_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub locale: Locale,
    pub conversation_id: String,
    pub price: Decimal,
    pub paid_price: Decimal,
    pub currency: Currency,
    pub installment: u8,
    pub basket_id: String,
    pub payment_group: PaymentGroup,
    pub card: CardReference,
    pub buyer: Buyer,
    pub shipping_address: PostalAddress,
    pub billing_address: PostalAddress,
    pub basket_items: Vec<BasketItem>,
    /// Set for 3-D Secure and BKM initialization.
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentItem {
    pub item_id: String,
    pub payment_transaction_id: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    pub reference_key: String,
    pub paid_price: Decimal,
    pub payment_items: Vec<PaymentItem>,
}

impl PaymentResult {
    pub fn first_payment_transaction_id(&self) -> Option<String> {
        self.payment_items
            .first()
            .map(|item| item.payment_transaction_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreedsSession {
    pub reference_key: String,
    /// Bank page markup the payer must be redirected to.
    pub html_content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreedsConfirmRequest {
    pub locale: Locale,
    pub conversation_id: String,
    pub payment_id: String,
    pub conversation_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BkmSession {
    pub reference_key: String,
    pub token: String,
    pub html_content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoidRequest {
    pub locale: Locale,
    pub reference_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoidResult {
    pub reference_key: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub locale: Locale,
    pub payment_transaction_id: String,
    pub amount: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundResult {
    pub reference_key: String,
    pub payment_transaction_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCardRequest {
    pub locale: Locale,
    pub email: String,
    pub card_user_key: Option<String>,
    pub alias: String,
    pub holder_name: String,
    pub number: String,
    pub expire_month: String,
    pub expire_year: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCardResult {
    pub card_user_key: String,
    pub token: String,
    pub alias: String,
    pub bin: String,
    pub last_four: String,
    pub network: Option<String>,
    pub bank: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCardRequest {
    pub locale: Locale,
    pub card_user_key: Option<String>,
    pub card_token: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, request: PaymentRequest) -> GatewayResult<PaymentResult>;

    async fn initialize_threeds(&self, request: PaymentRequest) -> GatewayResult<ThreedsSession>;

    async fn confirm_threeds(&self, request: ThreedsConfirmRequest) -> GatewayResult<PaymentResult>;

    async fn initialize_bkm(&self, request: PaymentRequest) -> GatewayResult<BkmSession>;

    async fn retrieve_bkm(&self, token: &str) -> GatewayResult<PaymentResult>;

    async fn create_void(&self, request: VoidRequest) -> GatewayResult<VoidResult>;

    async fn create_refund(&self, request: RefundRequest) -> GatewayResult<RefundResult>;

    async fn create_stored_card(&self, request: StoreCardRequest) -> GatewayResult<StoredCardResult>;

    async fn delete_stored_card(&self, request: DeleteCardRequest) -> GatewayResult<()>;
}

pub type GatewayBox = Box<dyn PaymentGateway>;
