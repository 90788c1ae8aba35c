//! Credential issuance.
//!
//! Stands in for the anonymous credential scheme: credentials are tracked by
//! serial number, so the pool can detect forged, altered and double-spent
//! presentations and keep the outstanding balance.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use uuid::Uuid;

use wabisabi_core::{Credential, CredentialPool, CoordinatorError, ProtocolErrorCode, Result};

#[derive(Debug, Clone, Copy)]
struct Issued {
    value: u64,
    redeemed: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    issued: HashMap<Uuid, Issued>,
    outstanding: u64,
}

/// Credential pool keyed by serial number.
#[derive(Debug, Default)]
pub struct SerialNumberPool {
    state: Mutex<PoolState>,
}

impl SerialNumberPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(state: &PoolState, presented: &[Credential]) -> Result<u64> {
        let mut seen = HashSet::with_capacity(presented.len());
        let mut total: u64 = 0;

        for credential in presented {
            if !seen.insert(credential.serial) {
                return Err(invalid("credential presented twice"));
            }
            match state.issued.get(&credential.serial) {
                None => return Err(invalid("unknown credential")),
                Some(issued) if issued.redeemed => return Err(invalid("credential already spent")),
                Some(issued) if issued.value != credential.value => return Err(invalid("credential value altered")),
                Some(issued) => {
                    total = total
                        .checked_add(issued.value)
                        .ok_or_else(|| invalid("credential total overflows"))?;
                }
            }
        }

        Ok(total)
    }
}

fn invalid(message: &str) -> CoordinatorError {
    CoordinatorError::protocol(ProtocolErrorCode::InvalidCredentials, message)
}

impl CredentialPool for SerialNumberPool {
    fn issue(&self, value: u64) -> Credential {
        let serial = Uuid::new_v4();
        let mut state = self.state.lock();
        state.issued.insert(serial, Issued { value, redeemed: false });
        state.outstanding = state.outstanding.saturating_add(value);
        Credential { serial, value }
    }

    fn verify(&self, presented: &[Credential]) -> Result<u64> {
        Self::check(&self.state.lock(), presented)
    }

    fn redeem(&self, presented: &[Credential]) -> Result<u64> {
        let mut state = self.state.lock();
        let total = Self::check(&state, presented)?;
        for credential in presented {
            if let Some(issued) = state.issued.get_mut(&credential.serial) {
                issued.redeemed = true;
            }
        }
        state.outstanding = state.outstanding.saturating_sub(total);
        Ok(total)
    }

    fn outstanding(&self) -> u64 {
        self.state.lock().outstanding
    }
}
