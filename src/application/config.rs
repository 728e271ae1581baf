use crate::domain::gateway::Locale;
use crate::domain::money::Amount;
use chrono::Duration;
use std::time::Duration as StdDuration;

/// Runtime settings of the billing engine and its jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingConfig {
    /// Where the bank page posts the 3-D Secure result back to.
    pub threeds_callback_url: String,
    pub bkm_callback_url: String,
    /// Nominal amount charged to verify a card at the start of a trial.
    pub verification_amount: Amount,
    /// Minimum age of a verification transaction before it gets reversed.
    pub verification_grace: Duration,
    pub gateway_timeout: StdDuration,
    pub locale: Locale,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            threeds_callback_url: "http://localhost/billing/threeds/callback".to_string(),
            bkm_callback_url: "http://localhost/billing/bkm/callback".to_string(),
            verification_amount: Amount::ONE,
            verification_grace: Duration::minutes(5),
            gateway_timeout: StdDuration::from_secs(30),
            locale: Locale::Tr,
        }
    }
}
