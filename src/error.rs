use crate::domain::billable::BillableId;
use crate::domain::card::CardId;
use crate::domain::gateway::GatewayError;
use crate::domain::transaction::{TransactionId, TransactionStatus};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum BillingError {
    #[error("Billable {0} has no complete billing profile")]
    #[diagnostic(code(billing::validation::bill_fields))]
    BillFieldsMissing(BillableId),

    #[error("Card {card} does not belong to billable {billable}")]
    #[diagnostic(code(billing::validation::card_owner))]
    CardNotOwned { card: CardId, billable: BillableId },

    #[error("Validation error: {0}")]
    #[diagnostic(code(billing::validation::fields))]
    ValidationError(String),

    #[error("Invalid argument: {0}")]
    #[diagnostic(code(billing::validation::argument))]
    InvalidArgument(String),

    #[error("Transaction cannot move from {from} to {to}")]
    #[diagnostic(code(billing::validation::transition))]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Transaction {0} cannot be voided")]
    #[diagnostic(
        code(billing::validation::void),
        help("voids are accepted on the day the transaction was created; refund it instead")
    )]
    VoidNotAllowed(TransactionId),

    #[error("Transaction {0} has no gateway transaction id and cannot be refunded")]
    #[diagnostic(code(billing::validation::gateway_transaction_id))]
    MissingGatewayTransactionId(TransactionId),

    #[error("Payment failed: {0}")]
    #[diagnostic(code(billing::gateway::payment))]
    PaymentDeclined(GatewayError),

    #[error("3-D Secure initialization failed: {0}")]
    #[diagnostic(code(billing::gateway::threeds_initialize))]
    ThreedsInitializeFailed(GatewayError),

    #[error("3-D Secure payment failed: {0}")]
    #[diagnostic(code(billing::gateway::threeds_confirm))]
    ThreedsConfirmFailed(GatewayError),

    #[error("BKM initialization failed: {0}")]
    #[diagnostic(code(billing::gateway::bkm_initialize))]
    BkmInitializeFailed(GatewayError),

    #[error("Void failed: {0}")]
    #[diagnostic(code(billing::gateway::void))]
    VoidFailed(GatewayError),

    #[error("Refund failed: {0}")]
    #[diagnostic(code(billing::gateway::refund))]
    RefundFailed(GatewayError),

    #[error("Card could not be saved: {0}")]
    #[diagnostic(code(billing::gateway::card_save))]
    CardSaveFailed(GatewayError),

    #[error("Card could not be removed: {0}")]
    #[diagnostic(code(billing::gateway::card_remove))]
    CardRemoveFailed(GatewayError),

    #[error("Transaction {transaction} was captured by the gateway but could not be recorded: {reason}")]
    #[diagnostic(
        code(billing::reconciliation),
        help("the payment went through; reconcile the transaction manually before retrying")
    )]
    CaptureNotRecorded {
        transaction: TransactionId,
        reason: String,
    },

    #[error("{entity} {id} not found")]
    #[diagnostic(code(billing::not_found))]
    NotFound { entity: &'static str, id: String },

    #[error("{0} is already running")]
    #[diagnostic(code(billing::job::already_running))]
    AlreadyRunning(&'static str),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl BillingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// The gateway failure behind this error, if it came from the gateway.
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            Self::PaymentDeclined(e)
            | Self::ThreedsInitializeFailed(e)
            | Self::ThreedsConfirmFailed(e)
            | Self::BkmInitializeFailed(e)
            | Self::VoidFailed(e)
            | Self::RefundFailed(e)
            | Self::CardSaveFailed(e)
            | Self::CardRemoveFailed(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for BillingError {
    fn from(e: rocksdb::Error) -> Self {
        Self::InternalError(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;
