use anchor_lang::prelude::*;
use anchor_lang::solana_program::instruction::{AccountMeta, Instruction};
use anchor_lang::solana_program::program::invoke;
use anchor_spl::token::{self, Burn, Mint, MintTo, Token, TokenAccount, Transfer};
use math::amp;

pub mod engine;

declare_id!("8NeEkxgPMV5AnZ8o5ksjPhqsHwkWXdvGCGyHmEt6tJTn");

/// Pool PDA seed prefix.
pub const POOL_SEED: &[u8] = b"stable-pool";

#[program]
pub mod stable_pool {
    use super::*;

    // ------------------------------------------------------------------
    // Initialise a pool
    // ------------------------------------------------------------------
    pub fn initialize(
        ctx: Context<InitializePool>,
        ampl: u64,
        fee_rate: u128,
        admin_fee_rate: u128,
    ) -> Result<()> {
        require!(fee_rate < math::fixed::ONE, SwapError::InvalidFeeRate);
        require!(admin_fee_rate <= math::fixed::ONE, SwapError::InvalidFeeRate);
        require!(
            (amp::MIN_AMPL..=amp::MAX_AMPL).contains(&ampl),
            SwapError::InvalidAmplification
        );
        require!(
            ctx.accounts.base_mint.decimals <= common::PRECISION_DECIMALS
                && ctx.accounts.quote_mint.decimals <= common::PRECISION_DECIMALS,
            SwapError::MathOverflow
        );

        let now = Clock::get()?.unix_timestamp as u64;
        let pool = &mut ctx.accounts.pool;
        pool.admin = ctx.accounts.admin.key();
        pool.fund_state = ctx.accounts.fund_state.key();
        pool.oracle_state = ctx.accounts.oracle_state.key();
        pool.fee_collector = ctx.accounts.fee_collector.key();
        pool.distribution_vault = ctx.accounts.distribution_vault.key();
        pool.base_mint = ctx.accounts.base_mint.key();
        pool.quote_mint = ctx.accounts.quote_mint.key();
        pool.base_vault = ctx.accounts.base_vault.key();
        pool.quote_vault = ctx.accounts.quote_vault.key();
        pool.lp_mint = ctx.accounts.lp_mint.key();
        pool.reserve_lp = ctx.accounts.reserve_lp.key();
        pool.bump = ctx.bumps.pool;
        pool.base_prec = common::precision_multiplier(ctx.accounts.base_mint.decimals);
        pool.quote_prec = common::precision_multiplier(ctx.accounts.quote_mint.decimals);
        pool.fee_rate = fee_rate;
        pool.admin_fee_rate = admin_fee_rate;
        pool.base_balance = 0;
        pool.quote_balance = 0;
        pool.total_admin_fee = 0;
        pool.total_shares = 0;
        pool.rebalance_version = ctx.accounts.fund_state.version;
        pool.synced_ratio = ctx.accounts.fund_state.total_ratio;
        pool.price_over_oracle_integral = 0;
        pool.last_timestamp = now;
        pool.ampl_start = ampl;
        pool.ampl_end = ampl;
        pool.ramp_start = now;
        pool.ramp_end = now;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buy base with quote. The base goes out first; the payment is taken
    // as the quote-vault balance delta after the optional callback, so a
    // caller without upfront capital can source the quote inside the same
    // transaction.
    // ------------------------------------------------------------------
    pub fn buy<'info>(
        ctx: Context<'_, '_, '_, 'info, Swap<'info>>,
        version: u64,
        base_out: u64,
        calldata: Vec<u8>,
    ) -> Result<()> {
        let now = Clock::get()?.unix_timestamp as u64;
        settle_rebalance(
            &mut ctx.accounts.pool,
            &ctx.accounts.fund_state,
            &ctx.accounts.oracle_state,
            &mut ctx.accounts.base_vault,
            &ctx.accounts.distribution_vault,
            &ctx.accounts.token_program,
            now,
        )?;

        let out_fixed = common::to_fixed(base_out, ctx.accounts.pool.base_prec);
        engine::check_buy(&ctx.accounts.pool, version, out_fixed)?;

        // --------------------
        // 1. Optimistic transfer of the output.
        // --------------------
        let quote_before = ctx.accounts.quote_vault.amount;
        pool_transfer(
            &ctx.accounts.pool,
            &ctx.accounts.base_vault.to_account_info(),
            &ctx.accounts.trader_base.to_account_info(),
            &ctx.accounts.token_program,
            base_out,
        )?;

        // --------------------
        // 2. Optional settlement callback with the caller's accounts.
        // --------------------
        if !calldata.is_empty() {
            let callback = ctx
                .accounts
                .callback_program
                .as_ref()
                .ok_or(SwapError::MissingCallback)?;
            invoke_callback(callback, ctx.remaining_accounts, calldata)?;
        }

        // --------------------
        // 3. Measure the payment and settle against the curve.
        // --------------------
        ctx.accounts.quote_vault.reload()?;
        let quote_paid = ctx
            .accounts
            .quote_vault
            .amount
            .checked_sub(quote_before)
            .ok_or(SwapError::MathOverflow)?;
        let in_fixed = common::to_fixed(quote_paid, ctx.accounts.pool.quote_prec);
        let trade = engine::settle_buy(&mut ctx.accounts.pool, version, out_fixed, in_fixed, now)?;

        emit!(SwapExecuted {
            trader: ctx.accounts.trader.key(),
            is_buy: true,
            base_amount: base_out,
            quote_amount: quote_paid,
            fee: trade.fee,
            admin_fee: trade.admin_fee,
            price_over_oracle: engine::current_price_over_oracle(
                &ctx.accounts.pool,
                &ctx.accounts.fund_state,
                ctx.accounts.oracle_state.price,
                now,
            )?,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sell base for quote. Mirror of `buy`: quote out first, base payment
    // measured from the base-vault delta after the callback.
    // ------------------------------------------------------------------
    pub fn sell<'info>(
        ctx: Context<'_, '_, '_, 'info, Swap<'info>>,
        version: u64,
        quote_out: u64,
        calldata: Vec<u8>,
    ) -> Result<()> {
        let now = Clock::get()?.unix_timestamp as u64;
        settle_rebalance(
            &mut ctx.accounts.pool,
            &ctx.accounts.fund_state,
            &ctx.accounts.oracle_state,
            &mut ctx.accounts.base_vault,
            &ctx.accounts.distribution_vault,
            &ctx.accounts.token_program,
            now,
        )?;

        let out_fixed = common::to_fixed(quote_out, ctx.accounts.pool.quote_prec);
        engine::check_sell(&ctx.accounts.pool, version, out_fixed)?;

        let base_before = ctx.accounts.base_vault.amount;
        pool_transfer(
            &ctx.accounts.pool,
            &ctx.accounts.quote_vault.to_account_info(),
            &ctx.accounts.trader_quote.to_account_info(),
            &ctx.accounts.token_program,
            quote_out,
        )?;

        if !calldata.is_empty() {
            let callback = ctx
                .accounts
                .callback_program
                .as_ref()
                .ok_or(SwapError::MissingCallback)?;
            invoke_callback(callback, ctx.remaining_accounts, calldata)?;
        }

        ctx.accounts.base_vault.reload()?;
        let base_paid = ctx
            .accounts
            .base_vault
            .amount
            .checked_sub(base_before)
            .ok_or(SwapError::MathOverflow)?;
        let in_fixed = common::to_fixed(base_paid, ctx.accounts.pool.base_prec);
        let trade = engine::settle_sell(&mut ctx.accounts.pool, version, out_fixed, in_fixed, now)?;

        emit!(SwapExecuted {
            trader: ctx.accounts.trader.key(),
            is_buy: false,
            base_amount: base_paid,
            quote_amount: quote_out,
            fee: trade.fee,
            admin_fee: trade.admin_fee,
            price_over_oracle: engine::current_price_over_oracle(
                &ctx.accounts.pool,
                &ctx.accounts.fund_state,
                ctx.accounts.oracle_state.price,
                now,
            )?,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Add liquidity. The depositor transfers both assets to the vaults
    // beforehand; the deposit is the delta between live vault balances
    // and the stored bookkeeping.
    // ------------------------------------------------------------------
    pub fn add_liquidity(ctx: Context<ModifyLiquidity>, version: u64, min_shares: u64) -> Result<u64> {
        let now = Clock::get()?.unix_timestamp as u64;
        settle_rebalance(
            &mut ctx.accounts.pool,
            &ctx.accounts.fund_state,
            &ctx.accounts.oracle_state,
            &mut ctx.accounts.base_vault,
            &ctx.accounts.distribution_vault,
            &ctx.accounts.token_program,
            now,
        )?;
        ctx.accounts.base_vault.reload()?;
        ctx.accounts.quote_vault.reload()?;

        let (add_base, add_quote) = {
            let pool = &ctx.accounts.pool;
            let live_base = common::to_fixed(ctx.accounts.base_vault.amount, pool.base_prec);
            let live_quote = common::to_fixed(ctx.accounts.quote_vault.amount, pool.quote_prec);
            let add_base = live_base
                .checked_sub(pool.base_balance)
                .ok_or(SwapError::NoLiquidityAdded)?;
            let add_quote = live_quote
                .checked_sub(pool.total_admin_fee)
                .and_then(|q| q.checked_sub(pool.quote_balance))
                .ok_or(SwapError::NoLiquidityAdded)?;
            (add_base, add_quote)
        };
        let outcome = engine::deposit(&mut ctx.accounts.pool, version, add_base, add_quote, now)?;

        let shares_out = common::from_fixed(outcome.shares, common::LP_PRECISION);
        require!(shares_out >= min_shares, SwapError::InsufficientOutput);

        mint_shares(
            &ctx.accounts.pool,
            &ctx.accounts.lp_mint.to_account_info(),
            &ctx.accounts.user_lp.to_account_info(),
            &ctx.accounts.token_program,
            shares_out,
        )?;
        if outcome.reserved > 0 {
            mint_shares(
                &ctx.accounts.pool,
                &ctx.accounts.lp_mint.to_account_info(),
                &ctx.accounts.reserve_lp.to_account_info(),
                &ctx.accounts.token_program,
                common::from_fixed(outcome.reserved, common::LP_PRECISION),
            )?;
        }

        emit!(LiquidityAdded {
            depositor: ctx.accounts.user.key(),
            base_in: common::from_fixed(add_base, ctx.accounts.pool.base_prec),
            quote_in: common::from_fixed(add_quote, ctx.accounts.pool.quote_prec),
            shares_out,
            fee: outcome.fee,
        });
        Ok(shares_out)
    }

    // ------------------------------------------------------------------
    // Proportional removal: burn shares, send both assets pro rata.
    // ------------------------------------------------------------------
    pub fn remove_liquidity(
        ctx: Context<ModifyLiquidity>,
        version: u64,
        shares: u64,
        min_base: u64,
        min_quote: u64,
    ) -> Result<()> {
        let now = Clock::get()?.unix_timestamp as u64;
        settle_rebalance(
            &mut ctx.accounts.pool,
            &ctx.accounts.fund_state,
            &ctx.accounts.oracle_state,
            &mut ctx.accounts.base_vault,
            &ctx.accounts.distribution_vault,
            &ctx.accounts.token_program,
            now,
        )?;

        let shares_fixed = shares as u128 * common::LP_PRECISION;
        let (base_out, quote_out) =
            engine::withdraw_proportional(&mut ctx.accounts.pool, version, shares_fixed, now)?;
        require!(base_out >= min_base, SwapError::InsufficientOutput);
        require!(quote_out >= min_quote, SwapError::InsufficientOutput);

        burn_shares(&ctx.accounts, shares)?;
        pool_transfer(
            &ctx.accounts.pool,
            &ctx.accounts.base_vault.to_account_info(),
            &ctx.accounts.user_base.to_account_info(),
            &ctx.accounts.token_program,
            base_out,
        )?;
        pool_transfer(
            &ctx.accounts.pool,
            &ctx.accounts.quote_vault.to_account_info(),
            &ctx.accounts.user_quote.to_account_info(),
            &ctx.accounts.token_program,
            quote_out,
        )?;

        emit!(LiquidityRemoved {
            withdrawer: ctx.accounts.user.key(),
            shares_in: shares,
            base_out,
            quote_out,
            fee: 0,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Single-sided removal into base.
    // ------------------------------------------------------------------
    pub fn remove_base_liquidity(
        ctx: Context<ModifyLiquidity>,
        version: u64,
        shares: u64,
        min_base: u64,
    ) -> Result<u64> {
        let now = Clock::get()?.unix_timestamp as u64;
        settle_rebalance(
            &mut ctx.accounts.pool,
            &ctx.accounts.fund_state,
            &ctx.accounts.oracle_state,
            &mut ctx.accounts.base_vault,
            &ctx.accounts.distribution_vault,
            &ctx.accounts.token_program,
            now,
        )?;

        let shares_fixed = shares as u128 * common::LP_PRECISION;
        let w = engine::withdraw_base(&mut ctx.accounts.pool, version, shares_fixed, now)?;
        require!(w.amount_out >= min_base, SwapError::InsufficientOutput);

        burn_shares(&ctx.accounts, shares)?;
        pool_transfer(
            &ctx.accounts.pool,
            &ctx.accounts.base_vault.to_account_info(),
            &ctx.accounts.user_base.to_account_info(),
            &ctx.accounts.token_program,
            w.amount_out,
        )?;

        emit!(LiquidityRemoved {
            withdrawer: ctx.accounts.user.key(),
            shares_in: shares,
            base_out: w.amount_out,
            quote_out: 0,
            fee: w.fee,
        });
        Ok(w.amount_out)
    }

    // ------------------------------------------------------------------
    // Single-sided removal into quote.
    // ------------------------------------------------------------------
    pub fn remove_quote_liquidity(
        ctx: Context<ModifyLiquidity>,
        version: u64,
        shares: u64,
        min_quote: u64,
    ) -> Result<u64> {
        let now = Clock::get()?.unix_timestamp as u64;
        settle_rebalance(
            &mut ctx.accounts.pool,
            &ctx.accounts.fund_state,
            &ctx.accounts.oracle_state,
            &mut ctx.accounts.base_vault,
            &ctx.accounts.distribution_vault,
            &ctx.accounts.token_program,
            now,
        )?;

        let shares_fixed = shares as u128 * common::LP_PRECISION;
        let w = engine::withdraw_quote(&mut ctx.accounts.pool, version, shares_fixed, now)?;
        require!(w.amount_out >= min_quote, SwapError::InsufficientOutput);

        burn_shares(&ctx.accounts, shares)?;
        pool_transfer(
            &ctx.accounts.pool,
            &ctx.accounts.quote_vault.to_account_info(),
            &ctx.accounts.user_quote.to_account_info(),
            &ctx.accounts.token_program,
            w.amount_out,
        )?;

        emit!(LiquidityRemoved {
            withdrawer: ctx.accounts.user.key(),
            shares_in: shares,
            base_out: 0,
            quote_out: w.amount_out,
            fee: w.fee,
        });
        Ok(w.amount_out)
    }

    // ------------------------------------------------------------------
    // Reconcile stored bookkeeping with live vault balances. This is the
    // only entry point that adopts donations; every other operation works
    // off the stored balances.
    // ------------------------------------------------------------------
    pub fn sync(ctx: Context<SyncBalances>) -> Result<()> {
        let now = Clock::get()?.unix_timestamp as u64;
        settle_rebalance(
            &mut ctx.accounts.pool,
            &ctx.accounts.fund_state,
            &ctx.accounts.oracle_state,
            &mut ctx.accounts.base_vault,
            &ctx.accounts.distribution_vault,
            &ctx.accounts.token_program,
            now,
        )?;
        ctx.accounts.base_vault.reload()?;
        ctx.accounts.quote_vault.reload()?;

        let pool = &mut ctx.accounts.pool;
        pool.base_balance = common::to_fixed(ctx.accounts.base_vault.amount, pool.base_prec);
        pool.quote_balance = common::to_fixed(ctx.accounts.quote_vault.amount, pool.quote_prec)
            .checked_sub(pool.total_admin_fee)
            .ok_or(SwapError::MathOverflow)?;

        emit!(Synced {
            base_balance: pool.base_balance,
            quote_balance: pool.quote_balance,
            price_over_oracle: engine::current_price_over_oracle(
                pool,
                &ctx.accounts.fund_state,
                ctx.accounts.oracle_state.price,
                now,
            )?,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Start a new amplification ramp.
    // ------------------------------------------------------------------
    pub fn update_ampl_ramp(ctx: Context<AdminOnly>, ampl_end: u64, ramp_end: u64) -> Result<()> {
        let now = Clock::get()?.unix_timestamp as u64;
        // The elapsed window integrates at the outgoing ramp's coefficient
        // before the new ramp takes over.
        settle_rebalance(
            &mut ctx.accounts.pool,
            &ctx.accounts.fund_state,
            &ctx.accounts.oracle_state,
            &mut ctx.accounts.base_vault,
            &ctx.accounts.distribution_vault,
            &ctx.accounts.token_program,
            now,
        )?;
        engine::update_ramp(&mut ctx.accounts.pool, now, ampl_end, ramp_end)?;

        let pool = &ctx.accounts.pool;
        emit!(AmplRampUpdated {
            ampl_start: pool.ampl_start,
            ampl_end: pool.ampl_end,
            ramp_start: pool.ramp_start,
            ramp_end: pool.ramp_end,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pay the accrued admin fee out to the configured collector.
    // ------------------------------------------------------------------
    pub fn collect_fee(ctx: Context<CollectFee>) -> Result<()> {
        let now = Clock::get()?.unix_timestamp as u64;
        settle_rebalance(
            &mut ctx.accounts.pool,
            &ctx.accounts.fund_state,
            &ctx.accounts.oracle_state,
            &mut ctx.accounts.base_vault,
            &ctx.accounts.distribution_vault,
            &ctx.accounts.token_program,
            now,
        )?;
        let amount = engine::collect_admin_fee(&mut ctx.accounts.pool)?;
        if amount > 0 {
            pool_transfer(
                &ctx.accounts.pool,
                &ctx.accounts.quote_vault.to_account_info(),
                &ctx.accounts.fee_collector.to_account_info(),
                &ctx.accounts.token_program,
                amount,
            )?;
        }
        emit!(FeeCollected { amount });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-only quoting. Stored balances are rebased virtually when the
    // fund version is ahead, so quotes match what execution would see.
    // ------------------------------------------------------------------
    pub fn get_base_out(ctx: Context<QuoteQuery>, quote_in: u64) -> Result<u64> {
        let now = Clock::get()?.unix_timestamp as u64;
        let pool = &ctx.accounts.pool;
        let out = engine::quote_base_out(
            pool,
            &ctx.accounts.fund_state,
            common::to_fixed(quote_in, pool.quote_prec),
            now,
        )?;
        Ok(common::from_fixed(out, pool.base_prec))
    }

    pub fn get_quote_out(ctx: Context<QuoteQuery>, base_in: u64) -> Result<u64> {
        let now = Clock::get()?.unix_timestamp as u64;
        let pool = &ctx.accounts.pool;
        let out = engine::quote_quote_out(
            pool,
            &ctx.accounts.fund_state,
            common::to_fixed(base_in, pool.base_prec),
            now,
        )?;
        Ok(common::from_fixed(out, pool.quote_prec))
    }

    pub fn get_quote_in(ctx: Context<QuoteQuery>, base_out: u64) -> Result<u64> {
        let now = Clock::get()?.unix_timestamp as u64;
        let pool = &ctx.accounts.pool;
        let needed = engine::quote_quote_in(
            pool,
            &ctx.accounts.fund_state,
            common::to_fixed(base_out, pool.base_prec),
            now,
        )?;
        // Round the native amount up so paying it always settles.
        Ok(needed
            .div_ceil(pool.quote_prec)
            .try_into()
            .map_err(|_| SwapError::MathOverflow)?)
    }

    pub fn get_base_in(ctx: Context<QuoteQuery>, quote_out: u64) -> Result<u64> {
        let now = Clock::get()?.unix_timestamp as u64;
        let pool = &ctx.accounts.pool;
        let needed = engine::quote_base_in(
            pool,
            &ctx.accounts.fund_state,
            common::to_fixed(quote_out, pool.quote_prec),
            now,
        )?;
        Ok(needed
            .div_ceil(pool.base_prec)
            .try_into()
            .map_err(|_| SwapError::MathOverflow)?)
    }

    pub fn get_current_price(ctx: Context<QuoteQuery>) -> Result<u128> {
        let now = Clock::get()?.unix_timestamp as u64;
        engine::current_price(&ctx.accounts.pool, &ctx.accounts.fund_state, now)
    }

    pub fn get_current_price_over_oracle(ctx: Context<QuoteQuery>) -> Result<u128> {
        let now = Clock::get()?.unix_timestamp as u64;
        engine::current_price_over_oracle(
            &ctx.accounts.pool,
            &ctx.accounts.fund_state,
            ctx.accounts.oracle_state.price,
            now,
        )
    }

    pub fn get_price_over_oracle_integral(ctx: Context<QuoteQuery>) -> Result<u128> {
        let now = Clock::get()?.unix_timestamp as u64;
        engine::projected_integral(
            &ctx.accounts.pool,
            &ctx.accounts.fund_state,
            ctx.accounts.oracle_state.price,
            now,
        )
    }

    pub fn get_virtual_price(ctx: Context<QuoteQuery>) -> Result<u128> {
        let now = Clock::get()?.unix_timestamp as u64;
        engine::virtual_price(&ctx.accounts.pool, &ctx.accounts.fund_state, now)
    }
}

/* ------------------------------------------------------------------
   Helpers
------------------------------------------------------------------ */

/// Transfer out of a pool-owned token account, signing with the pool PDA.
fn pool_transfer<'info>(
    pool: &Account<'info, Pool>,
    from: &AccountInfo<'info>,
    to: &AccountInfo<'info>,
    token_program: &Program<'info, Token>,
    amount: u64,
) -> Result<()> {
    let base_mint = pool.base_mint;
    let quote_mint = pool.quote_mint;
    let seeds: &[&[u8]] = &[
        POOL_SEED,
        base_mint.as_ref(),
        quote_mint.as_ref(),
        &[pool.bump],
    ];
    token::transfer(
        CpiContext::new_with_signer(
            token_program.to_account_info(),
            Transfer {
                from: from.clone(),
                to: to.clone(),
                authority: pool.to_account_info(),
            },
            &[seeds],
        ),
        amount,
    )
}

/// Mint LP shares, signing with the pool PDA.
fn mint_shares<'info>(
    pool: &Account<'info, Pool>,
    lp_mint: &AccountInfo<'info>,
    to: &AccountInfo<'info>,
    token_program: &Program<'info, Token>,
    amount: u64,
) -> Result<()> {
    let base_mint = pool.base_mint;
    let quote_mint = pool.quote_mint;
    let seeds: &[&[u8]] = &[
        POOL_SEED,
        base_mint.as_ref(),
        quote_mint.as_ref(),
        &[pool.bump],
    ];
    token::mint_to(
        CpiContext::new_with_signer(
            token_program.to_account_info(),
            MintTo {
                mint: lp_mint.clone(),
                to: to.clone(),
                authority: pool.to_account_info(),
            },
            &[seeds],
        ),
        amount,
    )
}

/// Burn LP shares from the caller's account.
fn burn_shares(accounts: &ModifyLiquidity, amount: u64) -> Result<()> {
    token::burn(
        CpiContext::new(
            accounts.token_program.to_account_info(),
            Burn {
                mint: accounts.lp_mint.to_account_info(),
                from: accounts.user_lp.to_account_info(),
                authority: accounts.user.to_account_info(),
            },
        ),
        amount,
    )
}

/// Forward raw instruction data to the caller-supplied settlement program
/// together with every remaining account.
fn invoke_callback<'info>(
    callback_program: &UncheckedAccount<'info>,
    remaining: &[AccountInfo<'info>],
    calldata: Vec<u8>,
) -> Result<()> {
    let metas: Vec<AccountMeta> = remaining
        .iter()
        .map(|a| AccountMeta {
            pubkey: a.key(),
            is_signer: a.is_signer,
            is_writable: a.is_writable,
        })
        .collect();
    let ix = Instruction {
        program_id: callback_program.key(),
        accounts: metas,
        data: calldata,
    };
    invoke(&ix, remaining)?;
    Ok(())
}

/// Catch the pool up with the fund: accrue the price-over-oracle integral
/// for the elapsed window, convert the stored base balance into the new
/// rebalance epoch, and route the residual between the live vault and the
/// converted balance to the distribution vault.
fn settle_rebalance<'info>(
    pool: &mut Account<'info, Pool>,
    fund_state: &Account<'info, fund::FundState>,
    oracle_state: &Account<'info, fund::OracleState>,
    base_vault: &mut Account<'info, TokenAccount>,
    distribution_vault: &Account<'info, TokenAccount>,
    token_program: &Program<'info, Token>,
    now: u64,
) -> Result<()> {
    let outcome = engine::checkpoint(
        pool,
        now,
        fund_state.version,
        fund_state.total_ratio,
        oracle_state.price,
    )?;
    let Some(rb) = outcome else {
        return Ok(());
    };

    base_vault.reload()?;
    let expected_native = common::from_fixed(rb.expected_base, pool.base_prec);
    let residual = base_vault.amount.saturating_sub(expected_native);
    if residual > 0 {
        pool_transfer(
            pool,
            &base_vault.to_account_info(),
            &distribution_vault.to_account_info(),
            token_program,
            residual,
        )?;
    }
    // Stored base floors to what the vault actually holds after routing.
    let held = expected_native.min(base_vault.amount);
    pool.base_balance = common::to_fixed(held, pool.base_prec);

    emit!(RebalanceDistributed {
        snapshot: common::EpochSnapshot {
            old_version: rb.old_version,
            new_version: rb.new_version,
            amount: residual,
        },
    });
    Ok(())
}

/* ------------------------------------------------------------------
   Accounts
------------------------------------------------------------------ */
#[derive(Accounts)]
pub struct InitializePool<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,
    pub base_mint: Account<'info, Mint>,
    pub quote_mint: Account<'info, Mint>,
    #[account(
        init,
        payer = admin,
        space = 8 + Pool::LEN,
        seeds = [POOL_SEED, base_mint.key().as_ref(), quote_mint.key().as_ref()],
        bump
    )]
    pub pool: Account<'info, Pool>,
    #[account(init, payer = admin, token::mint = base_mint, token::authority = pool)]
    pub base_vault: Account<'info, TokenAccount>,
    #[account(init, payer = admin, token::mint = quote_mint, token::authority = pool)]
    pub quote_vault: Account<'info, TokenAccount>,
    #[account(init, payer = admin, mint::decimals = common::LP_DECIMALS, mint::authority = pool)]
    pub lp_mint: Account<'info, Mint>,
    /// Holds the shares reserved by the first deposit so the pool can
    /// never be fully drained.
    #[account(init, payer = admin, token::mint = lp_mint, token::authority = pool)]
    pub reserve_lp: Account<'info, TokenAccount>,
    pub fund_state: Account<'info, fund::FundState>,
    pub oracle_state: Account<'info, fund::OracleState>,
    #[account(token::mint = quote_mint)]
    pub fee_collector: Account<'info, TokenAccount>,
    #[account(token::mint = base_mint)]
    pub distribution_vault: Account<'info, TokenAccount>,
    pub token_program: Program<'info, Token>,
    pub system_program: Program<'info, System>,
    pub rent: Sysvar<'info, Rent>,
}

#[derive(Accounts)]
pub struct Swap<'info> {
    #[account(
        mut,
        has_one = base_vault,
        has_one = quote_vault,
        has_one = fund_state,
        has_one = oracle_state,
        has_one = distribution_vault,
    )]
    pub pool: Account<'info, Pool>,
    pub trader: Signer<'info>,
    #[account(mut)]
    pub base_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub quote_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub trader_base: Account<'info, TokenAccount>,
    #[account(mut)]
    pub trader_quote: Account<'info, TokenAccount>,
    #[account(mut)]
    pub distribution_vault: Account<'info, TokenAccount>,
    pub fund_state: Account<'info, fund::FundState>,
    pub oracle_state: Account<'info, fund::OracleState>,
    /// CHECK: settlement program chosen by the trader, invoked verbatim
    pub callback_program: Option<UncheckedAccount<'info>>,
    pub token_program: Program<'info, Token>,
    // remaining_accounts: forwarded to the callback program
}

#[derive(Accounts)]
pub struct ModifyLiquidity<'info> {
    #[account(
        mut,
        has_one = base_vault,
        has_one = quote_vault,
        has_one = lp_mint,
        has_one = reserve_lp,
        has_one = fund_state,
        has_one = oracle_state,
        has_one = distribution_vault,
    )]
    pub pool: Account<'info, Pool>,
    pub user: Signer<'info>,
    #[account(mut)]
    pub base_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub quote_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub distribution_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub lp_mint: Account<'info, Mint>,
    #[account(mut)]
    pub reserve_lp: Account<'info, TokenAccount>,
    #[account(mut)]
    pub user_lp: Account<'info, TokenAccount>,
    #[account(mut)]
    pub user_base: Account<'info, TokenAccount>,
    #[account(mut)]
    pub user_quote: Account<'info, TokenAccount>,
    pub fund_state: Account<'info, fund::FundState>,
    pub oracle_state: Account<'info, fund::OracleState>,
    pub token_program: Program<'info, Token>,
}

#[derive(Accounts)]
pub struct SyncBalances<'info> {
    #[account(
        mut,
        has_one = base_vault,
        has_one = quote_vault,
        has_one = fund_state,
        has_one = oracle_state,
        has_one = distribution_vault,
    )]
    pub pool: Account<'info, Pool>,
    #[account(mut)]
    pub base_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub quote_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub distribution_vault: Account<'info, TokenAccount>,
    pub fund_state: Account<'info, fund::FundState>,
    pub oracle_state: Account<'info, fund::OracleState>,
    pub token_program: Program<'info, Token>,
}

#[derive(Accounts)]
pub struct AdminOnly<'info> {
    #[account(
        mut,
        has_one = admin @ SwapError::Unauthorized,
        has_one = base_vault,
        has_one = fund_state,
        has_one = oracle_state,
        has_one = distribution_vault,
    )]
    pub pool: Account<'info, Pool>,
    pub admin: Signer<'info>,
    #[account(mut)]
    pub base_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub distribution_vault: Account<'info, TokenAccount>,
    pub fund_state: Account<'info, fund::FundState>,
    pub oracle_state: Account<'info, fund::OracleState>,
    pub token_program: Program<'info, Token>,
}

#[derive(Accounts)]
pub struct CollectFee<'info> {
    #[account(
        mut,
        has_one = base_vault,
        has_one = quote_vault,
        has_one = fee_collector,
        has_one = fund_state,
        has_one = oracle_state,
        has_one = distribution_vault,
    )]
    pub pool: Account<'info, Pool>,
    #[account(mut)]
    pub base_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub quote_vault: Account<'info, TokenAccount>,
    #[account(mut)]
    pub fee_collector: Account<'info, TokenAccount>,
    #[account(mut)]
    pub distribution_vault: Account<'info, TokenAccount>,
    pub fund_state: Account<'info, fund::FundState>,
    pub oracle_state: Account<'info, fund::OracleState>,
    pub token_program: Program<'info, Token>,
}

#[derive(Accounts)]
pub struct QuoteQuery<'info> {
    #[account(has_one = fund_state, has_one = oracle_state)]
    pub pool: Account<'info, Pool>,
    pub fund_state: Account<'info, fund::FundState>,
    pub oracle_state: Account<'info, fund::OracleState>,
}

/* ------------------------------------------------------------------
   State
------------------------------------------------------------------ */
#[account]
#[derive(Default)]
pub struct Pool {
    pub admin: Pubkey,
    pub fund_state: Pubkey,
    pub oracle_state: Pubkey,
    pub fee_collector: Pubkey,
    pub distribution_vault: Pubkey,
    pub base_mint: Pubkey,
    pub quote_mint: Pubkey,
    pub base_vault: Pubkey,
    pub quote_vault: Pubkey,
    pub lp_mint: Pubkey,
    pub reserve_lp: Pubkey,
    pub bump: u8,
    /// 10^(18 - base mint decimals).
    pub base_prec: u128,
    /// 10^(18 - quote mint decimals).
    pub quote_prec: u128,
    /// Trading fee, 18-dec fraction of the quote leg.
    pub fee_rate: u128,
    /// Fraction of the trading fee routed to the admin, 18-dec.
    pub admin_fee_rate: u128,
    /// Stored base balance, 18-dec.
    pub base_balance: u128,
    /// Stored quote balance owned by LPs, 18-dec. The quote vault holds
    /// this plus `total_admin_fee`.
    pub quote_balance: u128,
    /// Accrued admin fee awaiting collection, 18-dec quote.
    pub total_admin_fee: u128,
    /// Outstanding LP shares, 18-dec.
    pub total_shares: u128,
    /// Fund rebalance version the stored base balance is expressed in.
    pub rebalance_version: u64,
    /// Fund cumulative ratio at the last catch-up, 18-dec.
    pub synced_ratio: u128,
    /// Time integral of pool price over oracle price, 18-dec times seconds.
    pub price_over_oracle_integral: u128,
    pub last_timestamp: u64,
    pub ampl_start: u64,
    pub ampl_end: u64,
    pub ramp_start: u64,
    pub ramp_end: u64,
}

impl Pool {
    pub const LEN: usize = 11 * 32 + 1 + 10 * 16 + 6 * 8;
}

/* ------------------------------------------------------------------
   Events
------------------------------------------------------------------ */
#[event]
pub struct SwapExecuted {
    pub trader: Pubkey,
    pub is_buy: bool,
    pub base_amount: u64,
    pub quote_amount: u64,
    pub fee: u128,
    pub admin_fee: u128,
    /// Post-trade pool price over the oracle price, 18-dec.
    pub price_over_oracle: u128,
}

#[event]
pub struct LiquidityAdded {
    pub depositor: Pubkey,
    pub base_in: u64,
    pub quote_in: u64,
    pub shares_out: u64,
    pub fee: u128,
}

#[event]
pub struct LiquidityRemoved {
    pub withdrawer: Pubkey,
    pub shares_in: u64,
    pub base_out: u64,
    pub quote_out: u64,
    pub fee: u128,
}

#[event]
pub struct Synced {
    pub base_balance: u128,
    pub quote_balance: u128,
    /// Post-sync pool price over the oracle price, 18-dec.
    pub price_over_oracle: u128,
}

#[event]
pub struct AmplRampUpdated {
    pub ampl_start: u64,
    pub ampl_end: u64,
    pub ramp_start: u64,
    pub ramp_end: u64,
}

#[event]
pub struct RebalanceDistributed {
    pub snapshot: common::EpochSnapshot,
}

#[event]
pub struct FeeCollected {
    pub amount: u64,
}

/* ------------------------------------------------------------------
   Errors
------------------------------------------------------------------ */
#[error_code]
pub enum SwapError {
    #[msg("Stale rebalance version")]
    WrongVersion,
    #[msg("Input amount is zero")]
    ZeroInput,
    #[msg("Output amount is zero")]
    ZeroOutput,
    #[msg("Output exceeds pool liquidity")]
    InsufficientLiquidity,
    #[msg("Output below the requested minimum")]
    InsufficientOutput,
    #[msg("Payment does not preserve the invariant")]
    InvariantMismatch,
    #[msg("Arithmetic overflow")]
    MathOverflow,
    #[msg("Invariant solver did not converge")]
    DidNotConverge,
    #[msg("Pool has no liquidity")]
    EmptyPool,
    #[msg("Fee rate out of range")]
    InvalidFeeRate,
    #[msg("Amplification coefficient out of range")]
    InvalidAmplification,
    #[msg("Ramp shorter than the minimum duration")]
    RampTooShort,
    #[msg("Ramp target more than 10x away from the current coefficient")]
    RampChangeTooLarge,
    #[msg("No liquidity was added")]
    NoLiquidityAdded,
    #[msg("Signer is not the pool admin")]
    Unauthorized,
    #[msg("Calldata supplied without a callback program")]
    MissingCallback,
}
