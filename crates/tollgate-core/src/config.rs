use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CoreError;
use crate::pricing::Pricing;
use crate::types::Amount;

/// Hourly price of network access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Price per hour, in whole CKB.
    #[serde(default = "default_rate_per_hour")]
    pub rate_per_hour_ckb: u64,
}

impl PricingConfig {
    pub fn pricing(&self) -> Result<Pricing, CoreError> {
        Pricing::from_hourly_ckb(self.rate_per_hour_ckb)
    }
}

/// Channel funding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Wallet balance (whole CKB) at which a wallet counts as funded.
    #[serde(default = "default_funding_threshold")]
    pub funding_threshold_ckb: u64,
    /// Capacity held back from channel funding for the channel token cell and fees.
    #[serde(default = "default_setup_reserve")]
    pub setup_reserve_ckb: u64,
    /// Smallest guest funding the channel accepts.
    #[serde(default = "default_min_channel_funding")]
    pub min_channel_funding_ckb: u64,
    /// Host-side channel contribution.
    #[serde(default = "default_host_funding")]
    pub host_funding_ckb: u64,
    /// Bare cells the guest wallet must hold before the channel is opened.
    #[serde(default = "default_min_guest_cells")]
    pub min_guest_cells: usize,
    /// Upper bound on the channel open handshake.
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
}

impl ChannelConfig {
    pub fn funding_threshold(&self) -> Result<Amount, CoreError> {
        Amount::from_ckb(self.funding_threshold_ckb as u128)
    }

    pub fn setup_reserve(&self) -> Result<Amount, CoreError> {
        Amount::from_ckb(self.setup_reserve_ckb as u128)
    }

    pub fn min_channel_funding(&self) -> Result<Amount, CoreError> {
        Amount::from_ckb(self.min_channel_funding_ckb as u128)
    }

    pub fn host_funding(&self) -> Result<Amount, CoreError> {
        Amount::from_ckb(self.host_funding_ckb as u128)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

/// Micropayment scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between debit ticks. The rate is per tick.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Settlement and withdrawal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Timeout for the cooperative settle call.
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_secs: u64,
    /// Timeout for the whole withdrawal task, retries included.
    #[serde(default = "default_withdraw_timeout")]
    pub withdraw_timeout_secs: u64,
    /// Wait before each withdrawal attempt.
    #[serde(default = "default_withdraw_waits")]
    pub withdraw_retry_waits_secs: Vec<u64>,
    /// Maximum number of settlement/withdrawal tasks running at once.
    #[serde(default = "default_max_background_tasks")]
    pub max_background_tasks: usize,
    /// How long shutdown waits for in-flight background tasks.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl SettlementConfig {
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn withdraw_timeout(&self) -> Duration {
        Duration::from_secs(self.withdraw_timeout_secs)
    }

    pub fn withdraw_retry_waits(&self) -> Vec<Duration> {
        self.withdraw_retry_waits_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Cell preparation and transaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellConfig {
    /// Fee for split and withdrawal transactions, in shannons.
    #[serde(default = "default_fee")]
    pub fee_shannons: u64,
    /// Minimum capacity of a bare cell, in shannons.
    #[serde(default = "default_min_cell_capacity")]
    pub min_cell_capacity_shannons: u64,
    /// Poll interval while waiting for a transaction to commit.
    #[serde(default = "default_confirmation_interval")]
    pub confirmation_interval_secs: u64,
    /// Give up waiting for a commit after this long.
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
}

impl CellConfig {
    pub fn confirmation_interval(&self) -> Duration {
        Duration::from_secs(self.confirmation_interval_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

// Default value functions
fn default_rate_per_hour() -> u64 {
    500
}
fn default_funding_threshold() -> u64 {
    150
}
fn default_setup_reserve() -> u64 {
    62
}
fn default_min_channel_funding() -> u64 {
    61
}
fn default_host_funding() -> u64 {
    100
}
fn default_min_guest_cells() -> usize {
    4
}
fn default_open_timeout() -> u64 {
    300
}
fn default_tick_interval() -> u64 {
    60
}
fn default_settle_timeout() -> u64 {
    300
}
fn default_withdraw_timeout() -> u64 {
    600
}
fn default_withdraw_waits() -> Vec<u64> {
    vec![30, 60, 120]
}
fn default_max_background_tasks() -> usize {
    32
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_fee() -> u64 {
    100_000
}
fn default_min_cell_capacity() -> u64 {
    6_100_000_000
}
fn default_confirmation_interval() -> u64 {
    2
}
fn default_confirmation_timeout() -> u64 {
    120
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            rate_per_hour_ckb: default_rate_per_hour(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            funding_threshold_ckb: default_funding_threshold(),
            setup_reserve_ckb: default_setup_reserve(),
            min_channel_funding_ckb: default_min_channel_funding(),
            host_funding_ckb: default_host_funding(),
            min_guest_cells: default_min_guest_cells(),
            open_timeout_secs: default_open_timeout(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            settle_timeout_secs: default_settle_timeout(),
            withdraw_timeout_secs: default_withdraw_timeout(),
            withdraw_retry_waits_secs: default_withdraw_waits(),
            max_background_tasks: default_max_background_tasks(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            fee_shannons: default_fee(),
            min_cell_capacity_shannons: default_min_cell_capacity(),
            confirmation_interval_secs: default_confirmation_interval(),
            confirmation_timeout_secs: default_confirmation_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cells = CellConfig::default();
        assert_eq!(cells.fee_shannons, 100_000);
        assert_eq!(cells.min_cell_capacity_shannons, 6_100_000_000);

        let settlement = SettlementConfig::default();
        assert_eq!(
            settlement.withdraw_retry_waits(),
            vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120)
            ]
        );

        let pricing = PricingConfig::default().pricing().unwrap();
        assert_eq!(pricing.rate_per_tick(), Amount(833_333_333));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: ChannelConfig = toml::from_str("host_funding_ckb = 200").unwrap();
        assert_eq!(cfg.host_funding_ckb, 200);
        assert_eq!(cfg.setup_reserve_ckb, 62);
        assert_eq!(cfg.min_guest_cells, 4);
    }
}
