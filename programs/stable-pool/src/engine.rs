//! Settlement engine: every balance mutation of the pool happens here, on
//! stored 18-dec balances, with no token CPIs. The instruction handlers in
//! `lib.rs` move tokens and feed the measured amounts in.

use anchor_lang::prelude::*;
use math::amp::{self, AmpRamp};
use math::{fixed, stable, U256};

use crate::{Pool, SwapError};

/// Shares minted to the pool-owned reserve account by the first deposit,
/// 18-dec. One native LP unit: keeps the pool from ever being fully
/// drained at a cost the first depositor never notices.
pub const MIN_INITIAL_SHARES: u128 = common::LP_PRECISION;

#[derive(Debug)]
pub struct Trade {
    /// Quote-denominated trading fee, 18-dec.
    pub fee: u128,
    /// Portion of `fee` reserved for the admin, 18-dec.
    pub admin_fee: u128,
}

#[derive(Debug)]
pub struct DepositOutcome {
    /// Shares credited to the depositor, 18-dec, LP-native granularity.
    pub shares: u128,
    /// Shares locked in the reserve account (first deposit only).
    pub reserved: u128,
    /// Quote-denominated fee on the imbalanced portion.
    pub fee: u128,
}

#[derive(Debug)]
pub struct Withdrawal {
    /// Mint-native amount paid out.
    pub amount_out: u64,
    pub fee: u128,
    pub admin_fee: u128,
}

pub struct RebaseOutcome {
    pub old_version: u64,
    pub new_version: u64,
    /// Stored base balance converted into the new epoch, 18-dec.
    pub expected_base: u128,
}

fn map_math(e: math::Error) -> Error {
    match e {
        math::Error::Overflow => error!(SwapError::MathOverflow),
        math::Error::DidNotConverge => error!(SwapError::DidNotConverge),
        math::Error::ZeroBalance => error!(SwapError::EmptyPool),
    }
}

fn mul_div_down(a: u128, b: u128, c: u128) -> Result<u128> {
    require!(c > 0, SwapError::MathOverflow);
    let v = U256::from(a) * U256::from(b) / U256::from(c);
    require!(v.bits() <= 128, SwapError::MathOverflow);
    Ok(v.as_u128())
}

pub fn ramp(pool: &Pool) -> AmpRamp {
    AmpRamp {
        ampl_start: pool.ampl_start,
        ampl_end: pool.ampl_end,
        ramp_start: pool.ramp_start,
        ramp_end: pool.ramp_end,
    }
}

pub fn current_ampl(pool: &Pool, now: u64) -> u64 {
    ramp(pool).current(now)
}

// ------------------------------------------------------------------
// Checkpointing
// ------------------------------------------------------------------

/// Accrue the price-over-oracle integral for the elapsed window, then
/// convert the stored base balance into the fund's current rebalance
/// epoch if it moved ahead. The integral uses the pre-conversion state:
/// that is the state the pool actually traded at during the window.
pub fn checkpoint(
    pool: &mut Pool,
    now: u64,
    fund_version: u64,
    fund_ratio: u128,
    oracle_price: u128,
) -> Result<Option<RebaseOutcome>> {
    accrue_integral(pool, now, oracle_price)?;
    if fund_version <= pool.rebalance_version {
        return Ok(None);
    }
    let expected = stable::rebased_balance(pool.base_balance, pool.synced_ratio, fund_ratio)
        .map_err(map_math)?;
    let old_version = pool.rebalance_version;
    pool.base_balance = expected;
    pool.synced_ratio = fund_ratio;
    pool.rebalance_version = fund_version;
    Ok(Some(RebaseOutcome {
        old_version,
        new_version: fund_version,
        expected_base: expected,
    }))
}

fn accrue_integral(pool: &mut Pool, now: u64, oracle_price: u128) -> Result<()> {
    if now <= pool.last_timestamp {
        return Ok(());
    }
    let dt = (now - pool.last_timestamp) as u128;
    if pool.total_shares > 0 && oracle_price > 0 {
        let ampl = current_ampl(pool, now);
        let p = stable::price_over_oracle(pool.base_balance, pool.quote_balance, ampl, oracle_price)
            .map_err(map_math)?;
        let add = p.checked_mul(dt).ok_or(SwapError::MathOverflow)?;
        pool.price_over_oracle_integral = pool
            .price_over_oracle_integral
            .checked_add(add)
            .ok_or(SwapError::MathOverflow)?;
    }
    pool.last_timestamp = now;
    Ok(())
}

fn view_balances(pool: &Pool, fund_version: u64, fund_ratio: u128) -> Result<(u128, u128)> {
    let base = if fund_version > pool.rebalance_version {
        stable::rebased_balance(pool.base_balance, pool.synced_ratio, fund_ratio)
            .map_err(map_math)?
    } else {
        pool.base_balance
    };
    Ok((base, pool.quote_balance))
}

// ------------------------------------------------------------------
// Swaps
// ------------------------------------------------------------------

/// Preconditions checked before the optimistic output transfer.
pub fn check_buy(pool: &Pool, version: u64, base_out: u128) -> Result<()> {
    require!(pool.total_shares > 0, SwapError::EmptyPool);
    require!(version == pool.rebalance_version, SwapError::WrongVersion);
    require!(base_out > 0, SwapError::ZeroOutput);
    require!(base_out < pool.base_balance, SwapError::InsufficientLiquidity);
    Ok(())
}

pub fn check_sell(pool: &Pool, version: u64, quote_out: u128) -> Result<()> {
    require!(pool.total_shares > 0, SwapError::EmptyPool);
    require!(version == pool.rebalance_version, SwapError::WrongVersion);
    require!(quote_out > 0, SwapError::ZeroOutput);
    require!(quote_out < pool.quote_balance, SwapError::InsufficientLiquidity);
    Ok(())
}

/// Settle a buy after the payment was measured. The payment net of the
/// full fee must keep the invariant from shrinking; the fee minus the
/// admin cut stays with the liquidity providers.
pub fn settle_buy(
    pool: &mut Pool,
    version: u64,
    base_out: u128,
    quote_in: u128,
    now: u64,
) -> Result<Trade> {
    check_buy(pool, version, base_out)?;
    require!(quote_in > 0, SwapError::ZeroInput);

    let ampl = current_ampl(pool, now);
    let d_before = stable::compute_d(pool.base_balance, pool.quote_balance, ampl).map_err(map_math)?;
    let fee = fixed::mul_down(quote_in, pool.fee_rate).map_err(map_math)?;
    let admin_fee = fixed::mul_down(fee, pool.admin_fee_rate).map_err(map_math)?;

    let new_base = pool
        .base_balance
        .checked_sub(base_out)
        .ok_or(SwapError::InsufficientLiquidity)?;
    let net_quote = pool
        .quote_balance
        .checked_add(quote_in)
        .and_then(|q| q.checked_sub(fee))
        .ok_or(SwapError::MathOverflow)?;
    let d_after = stable::compute_d(new_base, net_quote, ampl).map_err(map_math)?;
    require!(d_after >= d_before, SwapError::InvariantMismatch);

    pool.base_balance = new_base;
    pool.quote_balance = pool
        .quote_balance
        .checked_add(quote_in)
        .and_then(|q| q.checked_sub(admin_fee))
        .ok_or(SwapError::MathOverflow)?;
    pool.total_admin_fee = pool
        .total_admin_fee
        .checked_add(admin_fee)
        .ok_or(SwapError::MathOverflow)?;
    Ok(Trade { fee, admin_fee })
}

/// Settle a sell after the base payment was measured. The requested quote
/// output is net; the fee is the gross-up over it.
pub fn settle_sell(
    pool: &mut Pool,
    version: u64,
    quote_out: u128,
    base_in: u128,
    now: u64,
) -> Result<Trade> {
    check_sell(pool, version, quote_out)?;
    require!(base_in > 0, SwapError::ZeroInput);

    let ampl = current_ampl(pool, now);
    let d_before = stable::compute_d(pool.base_balance, pool.quote_balance, ampl).map_err(map_math)?;
    let gross = fixed::div_up(quote_out, fixed::complement(pool.fee_rate)).map_err(map_math)?;
    let fee = gross.checked_sub(quote_out).ok_or(SwapError::MathOverflow)?;
    let admin_fee = fixed::mul_down(fee, pool.admin_fee_rate).map_err(map_math)?;

    let new_quote_for_check = pool
        .quote_balance
        .checked_sub(gross)
        .ok_or(SwapError::InsufficientLiquidity)?;
    let new_base = pool
        .base_balance
        .checked_add(base_in)
        .ok_or(SwapError::MathOverflow)?;
    let d_after = stable::compute_d(new_base, new_quote_for_check, ampl).map_err(map_math)?;
    require!(d_after >= d_before, SwapError::InvariantMismatch);

    pool.base_balance = new_base;
    pool.quote_balance = pool
        .quote_balance
        .checked_sub(quote_out)
        .and_then(|q| q.checked_sub(admin_fee))
        .ok_or(SwapError::MathOverflow)?;
    pool.total_admin_fee = pool
        .total_admin_fee
        .checked_add(admin_fee)
        .ok_or(SwapError::MathOverflow)?;
    Ok(Trade { fee, admin_fee })
}

// ------------------------------------------------------------------
// Liquidity
// ------------------------------------------------------------------

pub fn deposit(
    pool: &mut Pool,
    version: u64,
    add_base: u128,
    add_quote: u128,
    now: u64,
) -> Result<DepositOutcome> {
    require!(version == pool.rebalance_version, SwapError::WrongVersion);
    let ampl = current_ampl(pool, now);

    if pool.total_shares == 0 {
        require!(add_base > 0 && add_quote > 0, SwapError::NoLiquidityAdded);
        let d = stable::compute_d(add_base, add_quote, ampl).map_err(map_math)?;
        require!(d > MIN_INITIAL_SHARES, SwapError::ZeroOutput);
        let shares = (d - MIN_INITIAL_SHARES) / common::LP_PRECISION * common::LP_PRECISION;
        require!(shares > 0, SwapError::ZeroOutput);
        pool.base_balance = add_base;
        pool.quote_balance = add_quote;
        pool.total_shares = shares + MIN_INITIAL_SHARES;
        return Ok(DepositOutcome {
            shares,
            reserved: MIN_INITIAL_SHARES,
            fee: 0,
        });
    }

    require!(add_base > 0 || add_quote > 0, SwapError::NoLiquidityAdded);
    let r = stable::deposit_shares(
        pool.base_balance,
        pool.quote_balance,
        add_base,
        add_quote,
        pool.total_shares,
        ampl,
        pool.fee_rate,
        pool.admin_fee_rate,
    )
    .map_err(map_math)?;
    let shares = r.shares / common::LP_PRECISION * common::LP_PRECISION;
    require!(shares > 0, SwapError::ZeroOutput);

    pool.base_balance = pool
        .base_balance
        .checked_add(add_base)
        .ok_or(SwapError::MathOverflow)?;
    pool.quote_balance = pool
        .quote_balance
        .checked_add(add_quote)
        .and_then(|q| q.checked_sub(r.admin_fee))
        .ok_or(SwapError::MathOverflow)?;
    pool.total_admin_fee = pool
        .total_admin_fee
        .checked_add(r.admin_fee)
        .ok_or(SwapError::MathOverflow)?;
    pool.total_shares = pool
        .total_shares
        .checked_add(shares)
        .ok_or(SwapError::MathOverflow)?;
    Ok(DepositOutcome {
        shares,
        reserved: 0,
        fee: r.fee,
    })
}

/// Burn `shares` and release both assets pro rata, flooring each side to
/// mint-native units so the stored balances keep matching the vaults.
pub fn withdraw_proportional(
    pool: &mut Pool,
    version: u64,
    shares: u128,
    _now: u64,
) -> Result<(u64, u64)> {
    require!(version == pool.rebalance_version, SwapError::WrongVersion);
    require!(shares > 0, SwapError::ZeroInput);
    require!(shares <= pool.total_shares, SwapError::InsufficientLiquidity);

    let base_out = mul_div_down(pool.base_balance, shares, pool.total_shares)?;
    let quote_out = mul_div_down(pool.quote_balance, shares, pool.total_shares)?;
    let base_native = common::from_fixed(base_out, pool.base_prec);
    let quote_native = common::from_fixed(quote_out, pool.quote_prec);

    pool.base_balance -= common::to_fixed(base_native, pool.base_prec);
    pool.quote_balance -= common::to_fixed(quote_native, pool.quote_prec);
    pool.total_shares -= shares;
    Ok((base_native, quote_native))
}

pub fn withdraw_base(pool: &mut Pool, version: u64, shares: u128, now: u64) -> Result<Withdrawal> {
    require!(version == pool.rebalance_version, SwapError::WrongVersion);
    require!(shares > 0, SwapError::ZeroInput);
    require!(shares < pool.total_shares, SwapError::InsufficientLiquidity);

    let ampl = current_ampl(pool, now);
    let w = stable::withdraw_base(
        pool.base_balance,
        pool.quote_balance,
        shares,
        pool.total_shares,
        ampl,
        pool.fee_rate,
        pool.admin_fee_rate,
    )
    .map_err(map_math)?;
    let amount_out = common::from_fixed(w.amount_out, pool.base_prec);
    require!(amount_out > 0, SwapError::ZeroOutput);

    pool.base_balance = pool
        .base_balance
        .checked_sub(common::to_fixed(amount_out, pool.base_prec))
        .ok_or(SwapError::MathOverflow)?;
    pool.quote_balance = pool
        .quote_balance
        .checked_sub(w.admin_fee)
        .ok_or(SwapError::MathOverflow)?;
    pool.total_admin_fee = pool
        .total_admin_fee
        .checked_add(w.admin_fee)
        .ok_or(SwapError::MathOverflow)?;
    pool.total_shares -= shares;
    Ok(Withdrawal {
        amount_out,
        fee: w.fee,
        admin_fee: w.admin_fee,
    })
}

pub fn withdraw_quote(pool: &mut Pool, version: u64, shares: u128, now: u64) -> Result<Withdrawal> {
    require!(version == pool.rebalance_version, SwapError::WrongVersion);
    require!(shares > 0, SwapError::ZeroInput);
    require!(shares < pool.total_shares, SwapError::InsufficientLiquidity);

    let ampl = current_ampl(pool, now);
    let w = stable::withdraw_quote(
        pool.base_balance,
        pool.quote_balance,
        shares,
        pool.total_shares,
        ampl,
        pool.fee_rate,
        pool.admin_fee_rate,
    )
    .map_err(map_math)?;
    let amount_out = common::from_fixed(w.amount_out, pool.quote_prec);
    require!(amount_out > 0, SwapError::ZeroOutput);

    pool.quote_balance = pool
        .quote_balance
        .checked_sub(common::to_fixed(amount_out, pool.quote_prec))
        .and_then(|q| q.checked_sub(w.admin_fee))
        .ok_or(SwapError::MathOverflow)?;
    pool.total_admin_fee = pool
        .total_admin_fee
        .checked_add(w.admin_fee)
        .ok_or(SwapError::MathOverflow)?;
    pool.total_shares -= shares;
    Ok(Withdrawal {
        amount_out,
        fee: w.fee,
        admin_fee: w.admin_fee,
    })
}

// ------------------------------------------------------------------
// Administration
// ------------------------------------------------------------------

pub fn update_ramp(pool: &mut Pool, now: u64, ampl_end: u64, ramp_end: u64) -> Result<()> {
    require!(
        (amp::MIN_AMPL..=amp::MAX_AMPL).contains(&ampl_end),
        SwapError::InvalidAmplification
    );
    require!(
        ramp_end >= now + amp::MIN_RAMP_DURATION,
        SwapError::RampTooShort
    );
    let r = ramp(pool);
    require!(r.change_allowed(ampl_end, now), SwapError::RampChangeTooLarge);

    pool.ampl_start = r.current(now);
    pool.ramp_start = now;
    pool.ampl_end = ampl_end;
    pool.ramp_end = ramp_end;
    Ok(())
}

/// Flush the accrued admin fee down to mint-native granularity; the
/// sub-native remainder keeps accruing.
pub fn collect_admin_fee(pool: &mut Pool) -> Result<u64> {
    let amount = common::from_fixed(pool.total_admin_fee, pool.quote_prec);
    pool.total_admin_fee -= common::to_fixed(amount, pool.quote_prec);
    Ok(amount)
}

// ------------------------------------------------------------------
// Read-only quoting
// ------------------------------------------------------------------

pub fn quote_base_out(pool: &Pool, fund: &fund::FundState, quote_in: u128, now: u64) -> Result<u128> {
    require!(quote_in > 0, SwapError::ZeroInput);
    let (base, quote) = view_balances(pool, fund.version, fund.total_ratio)?;
    stable::base_out_for_quote_in(base, quote, quote_in, current_ampl(pool, now), pool.fee_rate)
        .map_err(map_math)
}

pub fn quote_quote_out(pool: &Pool, fund: &fund::FundState, base_in: u128, now: u64) -> Result<u128> {
    require!(base_in > 0, SwapError::ZeroInput);
    let (base, quote) = view_balances(pool, fund.version, fund.total_ratio)?;
    stable::quote_out_for_base_in(base, quote, base_in, current_ampl(pool, now), pool.fee_rate)
        .map_err(map_math)
}

pub fn quote_quote_in(pool: &Pool, fund: &fund::FundState, base_out: u128, now: u64) -> Result<u128> {
    require!(base_out > 0, SwapError::ZeroOutput);
    let (base, quote) = view_balances(pool, fund.version, fund.total_ratio)?;
    require!(base_out < base, SwapError::InsufficientLiquidity);
    stable::quote_in_for_base_out(base, quote, base_out, current_ampl(pool, now), pool.fee_rate)
        .map_err(map_math)
}

pub fn quote_base_in(pool: &Pool, fund: &fund::FundState, quote_out: u128, now: u64) -> Result<u128> {
    require!(quote_out > 0, SwapError::ZeroOutput);
    let (base, quote) = view_balances(pool, fund.version, fund.total_ratio)?;
    require!(quote_out < quote, SwapError::InsufficientLiquidity);
    stable::base_in_for_quote_out(base, quote, quote_out, current_ampl(pool, now), pool.fee_rate)
        .map_err(map_math)
}

pub fn current_price(pool: &Pool, fund: &fund::FundState, now: u64) -> Result<u128> {
    let (base, quote) = view_balances(pool, fund.version, fund.total_ratio)?;
    stable::spot_price(base, quote, current_ampl(pool, now)).map_err(map_math)
}

pub fn current_price_over_oracle(
    pool: &Pool,
    fund: &fund::FundState,
    oracle_price: u128,
    now: u64,
) -> Result<u128> {
    let (base, quote) = view_balances(pool, fund.version, fund.total_ratio)?;
    stable::price_over_oracle(base, quote, current_ampl(pool, now), oracle_price).map_err(map_math)
}

/// The stored integral plus the still-unaccrued tail up to `now`.
pub fn projected_integral(
    pool: &Pool,
    fund: &fund::FundState,
    oracle_price: u128,
    now: u64,
) -> Result<u128> {
    let mut integral = pool.price_over_oracle_integral;
    if now > pool.last_timestamp && pool.total_shares > 0 && oracle_price > 0 {
        let dt = (now - pool.last_timestamp) as u128;
        let p = current_price_over_oracle(pool, fund, oracle_price, now)?;
        integral = integral
            .checked_add(p.checked_mul(dt).ok_or(SwapError::MathOverflow)?)
            .ok_or(SwapError::MathOverflow)?;
    }
    Ok(integral)
}

pub fn virtual_price(pool: &Pool, fund: &fund::FundState, now: u64) -> Result<u128> {
    let (base, quote) = view_balances(pool, fund.version, fund.total_ratio)?;
    let d = stable::compute_d(base, quote, current_ampl(pool, now)).map_err(map_math)?;
    stable::virtual_price(d, pool.total_shares).map_err(map_math)
}

// ------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use math::fixed::ONE;

    // 6-decimal mints on both sides.
    const PREC: u128 = 1_000_000_000_000;
    const FEE: u128 = 3 * ONE / 100;
    const ADMIN: u128 = 2 * ONE / 5;

    fn units(n: u128) -> u128 {
        n * ONE
    }

    fn fund_at(version: u64, total_ratio: u128) -> fund::FundState {
        fund::FundState {
            owner: Pubkey::default(),
            version,
            total_ratio,
        }
    }

    fn empty_pool() -> Pool {
        let mut p = Pool::default();
        p.base_prec = PREC;
        p.quote_prec = PREC;
        p.fee_rate = FEE;
        p.admin_fee_rate = ADMIN;
        p.synced_ratio = ONE;
        p.ampl_start = 80;
        p.ampl_end = 80;
        p
    }

    fn seeded_pool() -> Pool {
        let mut p = empty_pool();
        deposit(&mut p, 0, units(100_000), units(100_000), 0).unwrap();
        p
    }

    fn d_of(pool: &Pool) -> u128 {
        stable::compute_d(pool.base_balance, pool.quote_balance, 80).unwrap()
    }

    #[test]
    fn first_deposit_reserves_minimum_shares() {
        let mut p = empty_pool();
        let o = deposit(&mut p, 0, units(100_000), units(100_000), 0).unwrap();
        assert_eq!(o.reserved, MIN_INITIAL_SHARES);
        assert_eq!(o.fee, 0);
        assert_eq!(p.total_shares, o.shares + MIN_INITIAL_SHARES);
        // Invariant of a balanced pool is the sum of balances.
        assert!(p.total_shares.abs_diff(units(200_000)) <= common::LP_PRECISION);
    }

    #[test]
    fn first_deposit_below_reserve_is_rejected() {
        // Two wei of combined value cannot even cover the reserve.
        let mut p = empty_pool();
        let r = deposit(&mut p, 0, 1, 1, 0);
        assert_eq!(r.unwrap_err(), SwapError::ZeroOutput.into());
    }

    #[test]
    fn reserve_cost_is_one_native_lp_unit() {
        let mut p = empty_pool();
        let o = deposit(&mut p, 0, units(10), units(10), 0).unwrap();
        // A small pool still opens; the depositor forfeits exactly one
        // native LP unit of value.
        assert_eq!(o.reserved, common::LP_PRECISION);
        assert!(p.total_shares.abs_diff(units(20)) <= common::LP_PRECISION);
    }

    #[test]
    fn empty_deposit_is_rejected() {
        let mut p = seeded_pool();
        let r = deposit(&mut p, 0, 0, 0, 0);
        assert_eq!(r.unwrap_err(), SwapError::NoLiquidityAdded.into());

        let mut fresh = empty_pool();
        let r = deposit(&mut fresh, 0, units(100), 0, 0);
        assert_eq!(r.unwrap_err(), SwapError::NoLiquidityAdded.into());
    }

    #[test]
    fn buy_settles_at_quoted_payment() {
        let mut p = seeded_pool();
        let fund = fund_at(0, ONE);
        let base_out = units(500);
        let quote_in = quote_quote_in(&p, &fund, base_out, 0).unwrap();

        let quote_before = p.quote_balance;
        let d_before = d_of(&p);
        let trade = settle_buy(&mut p, 0, base_out, quote_in, 0).unwrap();

        assert_eq!(trade.fee, fixed::mul_down(quote_in, FEE).unwrap());
        assert_eq!(trade.admin_fee, fixed::mul_down(trade.fee, ADMIN).unwrap());
        assert_eq!(p.total_admin_fee, trade.admin_fee);
        assert_eq!(p.base_balance, units(100_000) - base_out);
        assert_eq!(p.quote_balance, quote_before + quote_in - trade.admin_fee);
        // LP-kept fees push the invariant up.
        assert!(d_of(&p) >= d_before);
    }

    #[test]
    fn underpaid_buy_breaks_the_invariant() {
        let mut p = seeded_pool();
        let fund = fund_at(0, ONE);
        let base_out = units(500);
        let quote_in = quote_quote_in(&p, &fund, base_out, 0).unwrap();
        let r = settle_buy(&mut p, 0, base_out, quote_in - quote_in / 1_000, 0);
        assert_eq!(r.unwrap_err(), SwapError::InvariantMismatch.into());
    }

    #[test]
    fn buy_precondition_failures() {
        let p = seeded_pool();
        assert_eq!(
            check_buy(&p, 1, units(1)).unwrap_err(),
            SwapError::WrongVersion.into()
        );
        assert_eq!(
            check_buy(&p, 0, 0).unwrap_err(),
            SwapError::ZeroOutput.into()
        );
        assert_eq!(
            check_buy(&p, 0, units(100_000)).unwrap_err(),
            SwapError::InsufficientLiquidity.into()
        );
        let empty = empty_pool();
        assert_eq!(
            check_buy(&empty, 0, units(1)).unwrap_err(),
            SwapError::EmptyPool.into()
        );
    }

    #[test]
    fn sell_settles_at_quoted_payment() {
        let mut p = seeded_pool();
        let fund = fund_at(0, ONE);
        let quote_out = units(500);
        let base_in = quote_base_in(&p, &fund, quote_out, 0).unwrap();

        let d_before = d_of(&p);
        let quote_before = p.quote_balance;
        let trade = settle_sell(&mut p, 0, quote_out, base_in, 0).unwrap();

        assert!(trade.fee > 0);
        assert_eq!(trade.admin_fee, fixed::mul_down(trade.fee, ADMIN).unwrap());
        assert_eq!(p.base_balance, units(100_000) + base_in);
        assert_eq!(p.quote_balance, quote_before - quote_out - trade.admin_fee);
        assert_eq!(p.total_admin_fee, trade.admin_fee);
        assert!(d_of(&p) >= d_before);

        let r = settle_sell(&mut p, 0, units(400), units(1), 0);
        assert_eq!(r.unwrap_err(), SwapError::InvariantMismatch.into());
    }

    #[test]
    fn imbalanced_deposit_routes_admin_fee() {
        let mut p = seeded_pool();
        let shares_before = p.total_shares;
        let quote_before = p.quote_balance;

        let o = deposit(&mut p, 0, 0, units(1_000), 0).unwrap();
        assert!(o.fee > 0);
        assert!(o.shares > 0);
        assert_eq!(o.shares % common::LP_PRECISION, 0);
        let admin = p.total_admin_fee;
        assert_eq!(admin, fixed::mul_down(o.fee, ADMIN).unwrap());
        assert_eq!(p.quote_balance, quote_before + units(1_000) - admin);
        assert_eq!(p.total_shares, shares_before + o.shares);
    }

    #[test]
    fn proportional_withdrawal_is_pro_rata() {
        let mut p = seeded_pool();
        let shares = p.total_shares / 100; // 1%
        let (base_native, quote_native) = withdraw_proportional(&mut p, 0, shares, 0).unwrap();

        // 1% of 100k units, in 6-decimal native amounts.
        let expected = 1_000u64 * 1_000_000;
        assert!(base_native.abs_diff(expected) <= 1);
        assert!(quote_native.abs_diff(expected) <= 1);
        // Stored balances floor to what the vaults pay out.
        assert_eq!(p.base_balance, units(100_000) - common::to_fixed(base_native, PREC));
        assert_eq!(p.quote_balance, units(100_000) - common::to_fixed(quote_native, PREC));
    }

    #[test]
    fn single_sided_withdrawals_charge_the_curve_fee() {
        let mut p = seeded_pool();
        let shares = p.total_shares / 100;

        let wb = withdraw_base(&mut p, 0, shares, 0).unwrap();
        assert!(wb.admin_fee > 0);
        assert_eq!(p.total_admin_fee, wb.admin_fee);
        // Below the two-sided value of the burned shares.
        assert!((wb.amount_out as u128) * PREC < units(2_000));

        let mut p2 = seeded_pool();
        let wq = withdraw_quote(&mut p2, 0, shares, 0).unwrap();
        assert!(wq.admin_fee > 0);
        assert!((wq.amount_out as u128) * PREC < units(2_000));
        assert_eq!(
            p2.quote_balance,
            units(100_000) - common::to_fixed(wq.amount_out, PREC) - wq.admin_fee
        );

        let all_shares = p.total_shares;
        let r = withdraw_base(&mut p, 0, all_shares, 0);
        assert_eq!(r.unwrap_err(), SwapError::InsufficientLiquidity.into());
    }

    #[test]
    fn checkpoint_converts_base_into_new_epoch() {
        let mut p = seeded_pool();
        let rb = checkpoint(&mut p, 10, 1, ONE * 5 / 4, ONE).unwrap().unwrap();
        assert_eq!(rb.old_version, 0);
        assert_eq!(rb.new_version, 1);
        assert_eq!(rb.expected_base, units(125_000));
        assert_eq!(p.base_balance, units(125_000));
        assert_eq!(p.synced_ratio, ONE * 5 / 4);
        assert_eq!(p.rebalance_version, 1);

        // Same fund state again: nothing to do.
        assert!(checkpoint(&mut p, 20, 1, ONE * 5 / 4, ONE).unwrap().is_none());

        // Trades quoting against the old version are rejected.
        let r = settle_buy(&mut p, 0, units(1), units(2), 20);
        assert_eq!(r.unwrap_err(), SwapError::WrongVersion.into());
        assert!(settle_buy(&mut p, 1, units(100), units(110), 20).is_ok());
    }

    #[test]
    fn integral_accrues_price_over_oracle_time() {
        let mut p = seeded_pool();
        // Balanced pool, oracle at parity: the ratio is 1, so 100 seconds
        // accrue ~100 * ONE.
        checkpoint(&mut p, 100, 0, ONE, ONE).unwrap();
        assert!(p.price_over_oracle_integral.abs_diff(100 * ONE) < ONE / 1_000);
        assert_eq!(p.last_timestamp, 100);

        // A second checkpoint at the same time accrues nothing.
        let before = p.price_over_oracle_integral;
        checkpoint(&mut p, 100, 0, ONE, ONE).unwrap();
        assert_eq!(p.price_over_oracle_integral, before);

        // The projection adds the unaccrued tail without mutating.
        let fund = fund_at(0, ONE);
        let projected = projected_integral(&p, &fund, ONE, 160).unwrap();
        assert!(projected.abs_diff(before + 60 * ONE) < ONE / 1_000);
        assert_eq!(p.price_over_oracle_integral, before);
    }

    #[test]
    fn integral_windows_follow_the_active_ramp() {
        // Heavily skewed pool: the price depends strongly on the
        // amplification coefficient, so each accrual window must use the
        // ramp that was live during it.
        let mut p = empty_pool();
        deposit(&mut p, 0, units(1_000), units(560_000), 0).unwrap();

        checkpoint(&mut p, 100, 0, ONE, ONE).unwrap();
        let first_window =
            stable::price_over_oracle(p.base_balance, p.quote_balance, 80, ONE).unwrap() * 100;
        assert_eq!(p.price_over_oracle_integral, first_window);

        // New ramp starts only after the first window was integrated at
        // the old coefficient.
        update_ramp(&mut p, 100, 800, 100 + amp::MIN_RAMP_DURATION).unwrap();
        let mid = 100 + amp::MIN_RAMP_DURATION / 2;
        checkpoint(&mut p, mid, 0, ONE, ONE).unwrap();

        let ampl_mid = current_ampl(&p, mid);
        assert_eq!(ampl_mid, 440);
        let second_window =
            stable::price_over_oracle(p.base_balance, p.quote_balance, ampl_mid, ONE).unwrap()
                * (amp::MIN_RAMP_DURATION / 2) as u128;
        assert_eq!(p.price_over_oracle_integral, first_window + second_window);
        // Sanity: the two coefficients price the skew very differently.
        assert_ne!(
            stable::price_over_oracle(p.base_balance, p.quote_balance, 80, ONE).unwrap(),
            stable::price_over_oracle(p.base_balance, p.quote_balance, 440, ONE).unwrap(),
        );
    }

    #[test]
    fn trades_move_the_oracle_relative_price() {
        let mut p = seeded_pool();
        let fund = fund_at(0, ONE);
        let before = current_price_over_oracle(&p, &fund, ONE, 0).unwrap();
        assert!(before.abs_diff(ONE) < ONE / 1_000_000);

        let quote_in = quote_quote_in(&p, &fund, units(5_000), 0).unwrap();
        settle_buy(&mut p, 0, units(5_000), quote_in, 0).unwrap();
        let after = current_price_over_oracle(&p, &fund, ONE, 0).unwrap();
        // Base left the pool, so base got more expensive relative to the
        // unchanged oracle.
        assert!(after > before);
    }

    #[test]
    fn ramp_update_snapshots_interpolated_value() {
        let mut p = seeded_pool();
        update_ramp(&mut p, 1_000, 160, 1_000 + amp::MIN_RAMP_DURATION).unwrap();
        assert_eq!(p.ampl_start, 80);
        assert_eq!(p.ampl_end, 160);

        // Halfway through, the coefficient reads 120; a new ramp starts
        // from there.
        let mid = 1_000 + amp::MIN_RAMP_DURATION / 2;
        update_ramp(&mut p, mid, 240, mid + amp::MIN_RAMP_DURATION).unwrap();
        assert_eq!(p.ampl_start, 120);
        assert_eq!(p.ramp_start, mid);

        let r = update_ramp(&mut p, mid, 100, mid + amp::MIN_RAMP_DURATION - 1);
        assert_eq!(r.unwrap_err(), SwapError::RampTooShort.into());
        // More than 10x away from the interpolated 120: distinct error
        // from a plainly out-of-range coefficient.
        let r = update_ramp(&mut p, mid, 120 * 11, mid + amp::MIN_RAMP_DURATION);
        assert_eq!(r.unwrap_err(), SwapError::RampChangeTooLarge.into());
        let r = update_ramp(&mut p, mid, 120 / 11, mid + amp::MIN_RAMP_DURATION);
        assert_eq!(r.unwrap_err(), SwapError::RampChangeTooLarge.into());
        let r = update_ramp(&mut p, mid, 0, mid + amp::MIN_RAMP_DURATION);
        assert_eq!(r.unwrap_err(), SwapError::InvalidAmplification.into());
        let r = update_ramp(&mut p, mid, amp::MAX_AMPL + 1, mid + amp::MIN_RAMP_DURATION);
        assert_eq!(r.unwrap_err(), SwapError::InvalidAmplification.into());
    }

    #[test]
    #[allow(arithmetic_overflow)]
    fn fee_collection_floors_to_native() {
        let mut p = seeded_pool();
        p.total_admin_fee = 1_234_567_890_123_456; // 1.234... units of 6-dec quote
        let native = collect_admin_fee(&mut p).unwrap();
        assert_eq!(native, 1_234_567);
        // Sub-native dust keeps accruing.
        assert_eq!(p.total_admin_fee, 1_234_567_890_123_456 - 1_234_567 * PREC);
        assert_eq!(collect_admin_fee(&mut p).unwrap(), 0);
    }

    #[test]
    fn quotes_use_virtually_rebased_balances() {
        let p = seeded_pool();
        // Fund moved one epoch ahead with a 2x ratio; quoting sees the
        // doubled base without the pool having caught up.
        let fund = fund_at(1, 2 * ONE);
        let price_stale = current_price(&p, &fund_at(0, ONE), 0).unwrap();
        let price_rebased = current_price(&p, &fund, 0).unwrap();
        assert!(price_rebased < price_stale);

        let vp = virtual_price(&p, &fund_at(0, ONE), 0).unwrap();
        assert!(vp.abs_diff(ONE) < ONE / 1_000_000);
    }

    #[test]
    fn quote_and_execution_agree() {
        let p = seeded_pool();
        let fund = fund_at(0, ONE);
        let quote_in = units(700);
        let base_out = quote_base_out(&p, &fund, quote_in, 0).unwrap();

        let mut exec = seeded_pool();
        // Paying the quoted amount for the quoted output settles.
        assert!(settle_buy(&mut exec, 0, base_out, quote_in, 0).is_ok());
    }
}
