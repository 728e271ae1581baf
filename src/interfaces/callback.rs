use crate::application::engine::{BillingEngine, ThreedsConfirmation};
use crate::domain::transaction::{Transaction, TransactionId};
use crate::error::{BillingError, Result};
use serde::Deserialize;
use tracing::debug;

/// Status the bank posts back when the payer completed authentication.
pub const THREEDS_SUCCESS: &str = "success";

/// Form body posted by the bank after the 3-D Secure page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreedsCallback {
    pub conversation_id: String,
    pub status: String,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub conversation_data: Option<String>,
}

impl ThreedsCallback {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case(THREEDS_SUCCESS)
    }
}

/// Callback from the BKM wallet page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BkmCallback {
    pub conversation_id: String,
    pub token: String,
}

fn transaction_id(raw: &str) -> Result<TransactionId> {
    raw.parse()
        .map_err(|_| BillingError::InvalidArgument(format!("Invalid conversation id: {raw}")))
}

/// Routes a 3-D Secure callback to confirmation or cancellation.
pub async fn handle_threeds_callback(
    engine: &BillingEngine,
    callback: ThreedsCallback,
) -> Result<Transaction> {
    let id = transaction_id(&callback.conversation_id)?;
    debug!(transaction_id = %id, status = %callback.status, "3-D Secure callback received");

    if !callback.is_success() {
        return engine.cancel_threeds(id).await;
    }
    let payment_id = callback
        .payment_id
        .filter(|payment_id| !payment_id.trim().is_empty())
        .ok_or_else(|| BillingError::ValidationError("Callback carries no payment id".to_string()))?;

    engine
        .confirm_threeds(ThreedsConfirmation {
            conversation_id: id,
            payment_id,
            conversation_data: callback.conversation_data,
        })
        .await
}

pub async fn handle_bkm_callback(engine: &BillingEngine, callback: BkmCallback) -> Result<Transaction> {
    let id = transaction_id(&callback.conversation_id)?;
    engine.confirm_bkm(id, &callback.token).await
}
