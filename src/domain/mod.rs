//! Domain layer: entities, value objects and the ports the application drives.

pub mod billable;
pub mod card;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod money;
pub mod plan;
pub mod ports;
pub mod subscription;
pub mod transaction;

/// Declares a numeric identifier newtype.
#[macro_export]
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }
    };
}
