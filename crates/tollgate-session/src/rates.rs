use std::sync::Arc;
use tokio::sync::watch;

use tollgate_core::{CoreError, Pricing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateSetting {
    pricing: Pricing,
    per_hour_ckb: Option<u64>,
}

/// Shared, runtime-adjustable price.
///
/// Every component holding a clone sees an update on its next read. A
/// session keeps the duration it was sold; only later debits and
/// extensions use the new rate.
#[derive(Debug, Clone)]
pub struct PricingHandle {
    tx: Arc<watch::Sender<RateSetting>>,
}

impl PricingHandle {
    pub fn new(pricing: Pricing) -> Self {
        Self::with_setting(RateSetting {
            pricing,
            per_hour_ckb: None,
        })
    }

    pub fn from_hourly_ckb(per_hour: u64) -> Result<Self, CoreError> {
        Ok(Self::with_setting(RateSetting {
            pricing: Pricing::from_hourly_ckb(per_hour)?,
            per_hour_ckb: Some(per_hour),
        }))
    }

    fn with_setting(setting: RateSetting) -> Self {
        let (tx, _rx) = watch::channel(setting);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Pricing {
        self.tx.borrow().pricing
    }

    /// The hourly price the current rate was derived from, if it was set
    /// that way.
    pub fn per_hour_ckb(&self) -> Option<u64> {
        self.tx.borrow().per_hour_ckb
    }

    pub fn set_hourly_ckb(&self, per_hour: u64) -> Result<Pricing, CoreError> {
        let pricing = Pricing::from_hourly_ckb(per_hour)?;
        self.tx.send_replace(RateSetting {
            pricing,
            per_hour_ckb: Some(per_hour),
        });
        tracing::info!(
            rate_per_hour = per_hour,
            rate_per_tick = %pricing.rate_per_tick(),
            "Price updated"
        );
        Ok(pricing)
    }
}

impl From<Pricing> for PricingHandle {
    fn from(pricing: Pricing) -> Self {
        Self::new(pricing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::Amount;

    #[test]
    fn test_update_is_shared() {
        let handle = PricingHandle::from_hourly_ckb(500).unwrap();
        let other = handle.clone();
        assert_eq!(other.per_hour_ckb(), Some(500));

        handle.set_hourly_ckb(60).unwrap();
        assert_eq!(other.current().rate_per_tick(), Amount(100_000_000));
        assert_eq!(other.per_hour_ckb(), Some(60));
    }

    #[test]
    fn test_zero_rate_keeps_previous() {
        let handle = PricingHandle::from_hourly_ckb(500).unwrap();
        assert!(handle.set_hourly_ckb(0).is_err());
        assert_eq!(handle.per_hour_ckb(), Some(500));
        assert_eq!(handle.current().rate_per_tick(), Amount(833_333_333));
    }

    #[test]
    fn test_from_rate_has_no_hourly_price() {
        let handle = PricingHandle::from(Pricing::from_rate(Amount(7)).unwrap());
        assert_eq!(handle.per_hour_ckb(), None);
        assert_eq!(handle.current().rate_per_tick(), Amount(7));
    }
}
