//! Outer surfaces: CSV job reports, gateway callback payloads and the seed loader.

pub mod callback;
pub mod csv;
pub mod seed;
