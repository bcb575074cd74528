use chrono::TimeDelta;

use crate::error::CoreError;
use crate::types::{Amount, SHANNONS_PER_CKB};

/// Per-minute debit rate derived from an hourly price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pricing {
    rate_per_tick: Amount,
}

impl Pricing {
    /// Derive the per-minute rate: `⌊price_per_hour × SHANNONS_PER_CKB / 60⌋`.
    pub fn from_hourly_ckb(price_per_hour: u64) -> Result<Self, CoreError> {
        let rate = (price_per_hour as u128)
            .checked_mul(SHANNONS_PER_CKB)
            .ok_or(CoreError::AmountOverflow)?
            / 60;
        Self::from_rate(Amount(rate))
    }

    /// Use an explicit per-tick rate in base units.
    pub fn from_rate(rate_per_tick: Amount) -> Result<Self, CoreError> {
        if rate_per_tick.is_zero() {
            return Err(CoreError::InvalidAmount("rate per tick must be positive".into()));
        }
        Ok(Self { rate_per_tick })
    }

    pub fn rate_per_tick(&self) -> Amount {
        self.rate_per_tick
    }

    /// Whole minutes of access that `amount` buys, truncated toward zero.
    pub fn minutes_for(&self, amount: Amount) -> u64 {
        let minutes = amount.shannons() / self.rate_per_tick.shannons();
        u64::try_from(minutes).unwrap_or(u64::MAX)
    }

    /// Access time that `amount` buys.
    pub fn duration_for(&self, amount: Amount) -> TimeDelta {
        let minutes = i64::try_from(self.minutes_for(amount)).unwrap_or(i64::MAX);
        TimeDelta::try_minutes(minutes).unwrap_or(TimeDelta::MAX)
    }

    /// Payment owed for time already elapsed: at least one tick.
    pub fn catch_up(&self, elapsed: TimeDelta) -> Result<Amount, CoreError> {
        let minutes = elapsed.num_minutes().max(1) as u128;
        self.rate_per_tick.checked_mul(minutes)
    }
}
