//! Platform fee schedule.
//!
//! `fee = floor(amount * rate_bps / 10_000)`. Flooring means very small tips
//! (for example a 1-unit tip at 250 bps) carry no fee at all.

use std::sync::Arc;

use crate::error::{LedgerError, Result};
use crate::models::{Account, Amount};

pub const BPS_DENOMINATOR: u16 = 10_000;

/// Default platform rate: 2.5%
pub const DEFAULT_FEE_BPS: u16 = 250;

/// Decides the rate a sender pays given the base platform rate
pub trait FeePolicy: Send + Sync {
    fn rate_bps(&self, base_bps: u16, sender: &Account) -> u16;
}

/// Everybody pays the base rate
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatRate;

impl FeePolicy for FlatRate {
    fn rate_bps(&self, base_bps: u16, _sender: &Account) -> u16 {
        base_bps
    }
}

/// Reduced rate for senders with at least `min_tips_sent` completed tips
#[derive(Debug, Clone, Copy)]
pub struct VolumeDiscount {
    pub min_tips_sent: u64,
    pub discounted_bps: u16,
}

impl FeePolicy for VolumeDiscount {
    fn rate_bps(&self, base_bps: u16, sender: &Account) -> u16 {
        if sender.tips_sent >= self.min_tips_sent {
            self.discounted_bps.min(base_bps)
        } else {
            base_bps
        }
    }
}

#[derive(Clone)]
pub struct FeeSchedule {
    base_bps: u16,
    policy: Arc<dyn FeePolicy>,
}

impl FeeSchedule {
    pub fn new(base_bps: u16, policy: Arc<dyn FeePolicy>) -> Result<Self> {
        if base_bps > BPS_DENOMINATOR {
            return Err(LedgerError::InvalidFeeRate(base_bps));
        }
        Ok(Self { base_bps, policy })
    }

    pub fn flat(base_bps: u16) -> Result<Self> {
        Self::new(base_bps, Arc::new(FlatRate))
    }

    pub fn base_bps(&self) -> u16 {
        self.base_bps
    }

    /// Rate for `sender`, never above 100%
    pub fn fee_rate(&self, sender: &Account) -> u16 {
        self.policy
            .rate_bps(self.base_bps, sender)
            .min(BPS_DENOMINATOR)
    }

    pub fn compute_fee(&self, amount: Amount, sender: &Account) -> Amount {
        let fee = amount as u128 * self.fee_rate(sender) as u128 / BPS_DENOMINATOR as u128;
        // rate <= 10_000 so fee <= amount and fits back into u64
        fee as Amount
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            base_bps: DEFAULT_FEE_BPS,
            policy: Arc::new(FlatRate),
        }
    }
}
