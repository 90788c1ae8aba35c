//! Round and participant identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoordinatorError, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Returns the raw bytes, used when binding signatures to an id.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = CoordinatorError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|e| CoordinatorError::ValidationError(format!(
                        "invalid {}: {}", stringify!($name), e
                    )))
            }
        }
    };
}

uuid_id!(
    /// Identifies a round. Unique for the lifetime of the coordinator.
    RoundId
);

uuid_id!(
    /// Identifies a registered Alice within a round.
    AliceId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(RoundId::new(), RoundId::new());
        assert_ne!(AliceId::new(), AliceId::new());
    }

    #[test]
    fn test_display_parse() {
        let id = RoundId::new();
        let parsed: RoundId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<AliceId>().is_err());
    }

    #[test]
    fn test_serde_transparent() {
        let id = AliceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with('"'));
        let back: AliceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
