//! Recurring card billing: payment transactions, refunds and voids,
//! subscriptions, and the batch jobs that keep them moving.

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
