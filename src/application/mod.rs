//! Application layer: the billing engine and the batch jobs built on it.
//!
//! `BillingEngine` runs single transaction flows against the gateway. The
//! `DueBillingScheduler` and `VerificationSweeper` drive it over whole sets of
//! subscriptions and transactions, isolating failures per item.

pub mod checkout;
pub mod config;
pub mod engine;
pub mod scheduler;
pub mod subscriptions;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testing;
