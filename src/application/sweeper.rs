use super::engine::BillingEngine;
use crate::domain::transaction::{Transaction, TransactionId, TransactionStatus};
use crate::error::{BillingError, Result};
use chrono::Duration;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversalOutcome {
    Voided,
    /// The void was refused because the payment had settled; refunded instead.
    Refunded,
    Failed,
}

impl ReversalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voided => "voided",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ReversalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reversal {
    pub transaction_id: TransactionId,
    pub outcome: ReversalOutcome,
    pub message: Option<String>,
}

/// Gives back the nominal amounts charged to verify cards.
///
/// Safe to run repeatedly: voided and refunded verifications drop out of the
/// selection on their own. Verifications that were never captured have nothing
/// to give back and are left out of the report.
pub struct VerificationSweeper {
    engine: Arc<BillingEngine>,
    grace: Duration,
    running: Mutex<()>,
}

impl VerificationSweeper {
    pub fn new(engine: Arc<BillingEngine>) -> Self {
        let grace = engine.config().verification_grace;
        Self {
            engine,
            grace,
            running: Mutex::new(()),
        }
    }

    /// Overrides the minimum age of a verification before it is reversed.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub async fn run(&self) -> Result<Vec<Reversal>> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| BillingError::AlreadyRunning("verification sweep"))?;

        let now = self.engine.now();
        let cutoff = now.checked_sub_signed(self.grace).ok_or_else(|| {
            BillingError::InvalidArgument(format!("Grace period {} is out of range", self.grace))
        })?;
        let (stale, uncaptured): (Vec<Transaction>, Vec<Transaction>) = self
            .engine
            .stores()
            .transactions
            .list_stale_verifications(cutoff)
            .await?
            .into_iter()
            .partition(captured);
        if !uncaptured.is_empty() {
            debug!(uncaptured = uncaptured.len(), "ignoring verifications that were never captured");
        }
        info!(candidates = stale.len(), %cutoff, "verification sweep started");

        let mut report = Vec::with_capacity(stale.len());
        for tx in stale {
            let transaction_id = tx.id;
            let reversal = match self.reverse(tx).await {
                Ok(outcome) => Reversal {
                    transaction_id,
                    outcome,
                    message: None,
                },
                Err(e) => {
                    error!(%transaction_id, error = %e, "verification could not be reversed");
                    Reversal {
                        transaction_id,
                        outcome: ReversalOutcome::Failed,
                        message: Some(e.to_string()),
                    }
                }
            };
            report.push(reversal);
        }

        info!(processed = report.len(), "verification sweep finished");
        Ok(report)
    }

    async fn reverse(&self, mut tx: Transaction) -> Result<ReversalOutcome> {
        if tx.status == TransactionStatus::PartialRefunded {
            self.engine.refund(&mut tx, None).await?;
            return Ok(ReversalOutcome::Refunded);
        }

        match self.engine.void(&mut tx).await {
            Ok(()) => Ok(ReversalOutcome::Voided),
            Err(e) if settled(&e) => {
                info!(transaction_id = %tx.id, reason = %e, "void refused, refunding instead");
                self.engine.refund(&mut tx, None).await?;
                Ok(ReversalOutcome::Refunded)
            }
            Err(e) => Err(e),
        }
    }
}

/// Whether the gateway holds money for this verification.
fn captured(tx: &Transaction) -> bool {
    matches!(
        tx.status,
        TransactionStatus::Success | TransactionStatus::PartialRefunded
    )
}

/// A void refused because the payment is already settled: either our own
/// same-day rule or a decline from the gateway.
fn settled(error: &BillingError) -> bool {
    match error {
        BillingError::VoidNotAllowed(_) => true,
        BillingError::VoidFailed(e) => e.is_declined(),
        _ => false,
    }
}
