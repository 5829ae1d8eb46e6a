//! Fund movements behind the escrow ledger.

use ethers::types::{Address, U256};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// A payment the recipient (or the rail) refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transfer of {amount} wei to {to:?} rejected: {reason}")]
pub struct TransferError {
    pub to: Address,
    pub amount: U256,
    pub reason: String,
}

/// Moves value into and out of escrow. Each call is all-or-nothing.
pub trait PaymentRail: Send + Sync {
    /// Take `amount` from `from` into escrow
    fn escrow(&self, from: Address, amount: U256) -> Result<(), TransferError>;

    /// Pay `amount` out of escrow to `to`
    fn release(&self, to: Address, amount: U256) -> Result<(), TransferError>;

    /// Value currently held in escrow
    fn escrowed(&self) -> U256;
}

#[derive(Debug, Default)]
struct RailState {
    escrowed: U256,
    balances: HashMap<Address, U256>,
    rejecting: HashSet<Address>,
    payouts: Vec<(Address, U256)>,
}

/// In-process rail with per-account balances.
///
/// Accounts can be marked as rejecting incoming payments, which is how a
/// recipient contract with a reverting fallback behaves.
#[derive(Debug, Default)]
pub struct InMemoryRail {
    state: Mutex<RailState>,
}

impl InMemoryRail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_payments_to(&self, account: Address) {
        self.state.lock().rejecting.insert(account);
    }

    pub fn accept_payments_to(&self, account: Address) {
        self.state.lock().rejecting.remove(&account);
    }

    pub fn balance_of(&self, account: Address) -> U256 {
        self.state
            .lock()
            .balances
            .get(&account)
            .copied()
            .unwrap_or_default()
    }

    /// Every successful release, in order
    pub fn payouts(&self) -> Vec<(Address, U256)> {
        self.state.lock().payouts.clone()
    }
}

impl PaymentRail for InMemoryRail {
    fn escrow(&self, from: Address, amount: U256) -> Result<(), TransferError> {
        let mut state = self.state.lock();
        state.escrowed = state
            .escrowed
            .checked_add(amount)
            .ok_or_else(|| TransferError {
                to: from,
                amount,
                reason: "escrow balance overflow".to_string(),
            })?;
        Ok(())
    }

    fn release(&self, to: Address, amount: U256) -> Result<(), TransferError> {
        let mut state = self.state.lock();
        if state.rejecting.contains(&to) {
            return Err(TransferError {
                to,
                amount,
                reason: "recipient rejected the payment".to_string(),
            });
        }
        if state.escrowed < amount {
            return Err(TransferError {
                to,
                amount,
                reason: format!("escrow holds only {} wei", state.escrowed),
            });
        }

        state.escrowed -= amount;
        *state.balances.entry(to).or_default() += amount;
        state.payouts.push((to, amount));
        Ok(())
    }

    fn escrowed(&self) -> U256 {
        self.state.lock().escrowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_moves_escrow_to_recipient() {
        let rail = InMemoryRail::new();
        let alice = Address::repeat_byte(1);
        rail.escrow(alice, U256::from(100)).unwrap();
        rail.release(alice, U256::from(100)).unwrap();

        assert_eq!(rail.escrowed(), U256::zero());
        assert_eq!(rail.balance_of(alice), U256::from(100));
        assert_eq!(rail.payouts(), vec![(alice, U256::from(100))]);
    }

    #[test]
    fn test_rejecting_recipient_leaves_escrow_untouched() {
        let rail = InMemoryRail::new();
        let bob = Address::repeat_byte(2);
        rail.escrow(bob, U256::from(50)).unwrap();
        rail.reject_payments_to(bob);

        assert!(rail.release(bob, U256::from(50)).is_err());
        assert_eq!(rail.escrowed(), U256::from(50));
        assert!(rail.payouts().is_empty());

        rail.accept_payments_to(bob);
        assert!(rail.release(bob, U256::from(50)).is_ok());
    }

    #[test]
    fn test_release_beyond_escrow_fails() {
        let rail = InMemoryRail::new();
        assert!(rail.release(Address::repeat_byte(3), U256::from(1)).is_err());
    }
}
