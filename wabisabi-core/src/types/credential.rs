//! Issued credentials.
//!
//! The anonymous-credential scheme itself lives behind
//! [`CredentialPool`](crate::traits::CredentialPool); here a credential is an
//! opaque serial plus the value it is worth.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of value a credential represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Satoshis.
    Amount,
    /// Weight units.
    Weight,
}

/// A credential issued by a round's pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential {
    /// Serial number, spent on presentation.
    pub serial: Uuid,
    /// Value in satoshis or weight units.
    pub value: u64,
}

impl Credential {
    /// Returns true for a zero-value credential.
    pub fn is_zero(&self) -> bool {
        self.value == 0
    }
}

/// Sums the value of a set of credentials.
pub fn total_value(credentials: &[Credential]) -> u64 {
    credentials.iter().map(|c| c.value).sum()
}
