//! Adapters for the domain ports: stores, the sandbox gateway, clocks and event sinks.

pub mod clock;
pub mod events;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod sandbox;
