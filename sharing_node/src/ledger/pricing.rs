use ethers::types::U256;

use super::{LedgerError, Result};

/// `required = rate_per_minute × duration_minutes × num_users`, in wei
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingRule {
    rate_per_minute: U256,
}

impl PricingRule {
    pub fn new(rate_per_minute: U256) -> Self {
        Self { rate_per_minute }
    }

    pub fn rate_per_minute(&self) -> U256 {
        self.rate_per_minute
    }

    pub fn required_payment(&self, num_users: u32, duration_minutes: u32) -> Result<U256> {
        if num_users == 0 {
            return Err(LedgerError::InvalidCapacity("numUsers must be positive".to_string()));
        }
        if duration_minutes == 0 {
            return Err(LedgerError::InvalidCapacity(
                "durationMinutes must be positive".to_string(),
            ));
        }

        self.rate_per_minute
            .checked_mul(U256::from(duration_minutes))
            .and_then(|v| v.checked_mul(U256::from(num_users)))
            .ok_or_else(|| LedgerError::InvalidCapacity("price overflows 256 bits".to_string()))
    }
}
