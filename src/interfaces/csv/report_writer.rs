use crate::application::scheduler::DueCharge;
use crate::application::sweeper::Reversal;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct DueChargeRow<'a> {
    subscription: u64,
    outcome: &'static str,
    transaction: Option<u64>,
    message: &'a str,
}

#[derive(Serialize)]
struct ReversalRow<'a> {
    transaction: u64,
    outcome: &'static str,
    message: &'a str,
}

/// Writes batch job reports as CSV.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// One `subscription,outcome,transaction,message` row per due subscription.
    pub fn write_due_charges(&mut self, items: &[DueCharge]) -> Result<()> {
        if items.is_empty() {
            self.writer
                .write_record(["subscription", "outcome", "transaction", "message"])?;
        }
        for item in items {
            self.writer.serialize(DueChargeRow {
                subscription: item.subscription_id.0,
                outcome: item.outcome.as_str(),
                transaction: item.transaction_id.map(|id| id.0),
                message: item.message.as_deref().unwrap_or_default(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// One `transaction,outcome,message` row per stale verification.
    pub fn write_reversals(&mut self, items: &[Reversal]) -> Result<()> {
        if items.is_empty() {
            self.writer.write_record(["transaction", "outcome", "message"])?;
        }
        for item in items {
            self.writer.serialize(ReversalRow {
                transaction: item.transaction_id.0,
                outcome: item.outcome.as_str(),
                message: item.message.as_deref().unwrap_or_default(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
