// Shared unit conventions between the fund and stable-pool programs.
//
// All pool-internal bookkeeping runs in 18-decimal fixed point regardless of
// the underlying mint decimals; these helpers convert between mint-native
// `u64` amounts and normalized `u128` amounts.

use anchor_lang::prelude::*;

/// Internal fixed-point scale: every stored balance carries 18 decimals.
pub const PRECISION_DECIMALS: u8 = 18;

/// LP share mints are created with 9 decimals.
pub const LP_DECIMALS: u8 = 9;

/// Normalization multiplier for an LP share amount (10^(18-9)).
pub const LP_PRECISION: u128 = 1_000_000_000;

/// Multiplier taking a mint-native amount to 18-decimal fixed point.
/// Mints with more than 18 decimals are rejected at pool initialization.
pub fn precision_multiplier(decimals: u8) -> u128 {
    10u128.pow((PRECISION_DECIMALS - decimals) as u32)
}

/// Mint-native `u64` -> normalized 18-decimal fixed point.
pub fn to_fixed(amount: u64, multiplier: u128) -> u128 {
    amount as u128 * multiplier
}

/// Normalized 18-decimal fixed point -> mint-native `u64`, rounding down.
/// The sub-native remainder always stays inside the pool.
pub fn from_fixed(amount: u128, multiplier: u128) -> u64 {
    (amount / multiplier) as u64
}

/// Snapshot of one rebalance catch-up, forwarded to the share-distribution
/// ledger alongside the routed residual.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochSnapshot {
    /// Pool's rebalance version before the catch-up.
    pub old_version: u64,
    /// Fund's rebalance version adopted by the catch-up.
    pub new_version: u64,
    /// Residual base amount routed out, in mint-native units.
    pub amount: u64,
}
