use anchor_lang::prelude::*;

declare_id!("FeLNaVGuQZWizZMd2hfy4MaXoko3kLC5q675q5EE5KaC");

/// Fund and oracle state the stable pool reconciles against.
///
/// The fund publishes a monotonic rebalance version together with a
/// cumulative 18‑dec rebase factor; pools convert their stored base
/// balance between versions by the ratio of those factors. The oracle
/// publishes the external 18‑dec price of base in quote.
#[program]
pub mod fund {
    use super::*;

    /// Initialize the fund state at version 0 with a unit cumulative ratio.
    pub fn initialize(ctx: Context<Initialize>, owner: Pubkey) -> Result<()> {
        let fund_state = &mut ctx.accounts.fund_state;
        fund_state.owner = owner;
        fund_state.version = 0;
        fund_state.total_ratio = math::fixed::ONE;
        Ok(())
    }

    /// Apply one rebalance epoch: bump the version and fold `ratio` into
    /// the cumulative factor.
    pub fn apply_rebalance(ctx: Context<ApplyRebalance>, ratio: u128) -> Result<()> {
        require!(ratio > 0, FundError::ZeroRatio);
        let fund_state = &mut ctx.accounts.fund_state;
        fund_state.total_ratio = math::fixed::mul_down(fund_state.total_ratio, ratio)
            .map_err(|_| FundError::RatioOverflow)?;
        fund_state.version = fund_state
            .version
            .checked_add(1)
            .ok_or(FundError::RatioOverflow)?;
        emit!(Rebalanced {
            version: fund_state.version,
            ratio,
            total_ratio: fund_state.total_ratio,
        });
        Ok(())
    }

    /// Initialize the oracle state with a starting 18‑dec price.
    pub fn initialize_oracle(ctx: Context<InitializeOracle>, owner: Pubkey, price: u128) -> Result<()> {
        require!(price > 0, FundError::ZeroPrice);
        let oracle_state = &mut ctx.accounts.oracle_state;
        oracle_state.owner = owner;
        oracle_state.price = price;
        oracle_state.updated_at = Clock::get()?.unix_timestamp as u64;
        Ok(())
    }

    /// Publish a new 18‑dec oracle price.
    pub fn post_price(ctx: Context<PostPrice>, price: u128) -> Result<()> {
        require!(price > 0, FundError::ZeroPrice);
        let oracle_state = &mut ctx.accounts.oracle_state;
        oracle_state.price = price;
        oracle_state.updated_at = Clock::get()?.unix_timestamp as u64;
        Ok(())
    }
}

#[derive(Accounts)]
pub struct Initialize<'info> {
    /// Fund state account PDA
    #[account(
        init,
        payer = payer,
        space = 8 + FundState::LEN,
        seeds = [b"fund-state", payer.key().as_ref()],
        bump
    )]
    pub fund_state: Account<'info, FundState>,

    /// The signer paying for account creation
    #[account(mut)]
    pub payer: Signer<'info>,

    /// System program for account creation
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct ApplyRebalance<'info> {
    #[account(mut, has_one = owner @ FundError::Unauthorized)]
    pub fund_state: Account<'info, FundState>,

    pub owner: Signer<'info>,
}

#[derive(Accounts)]
pub struct InitializeOracle<'info> {
    /// Oracle state account PDA
    #[account(
        init,
        payer = payer,
        space = 8 + OracleState::LEN,
        seeds = [b"oracle-state", payer.key().as_ref()],
        bump
    )]
    pub oracle_state: Account<'info, OracleState>,

    /// The signer paying for account creation
    #[account(mut)]
    pub payer: Signer<'info>,

    /// System program for account creation
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct PostPrice<'info> {
    #[account(mut, has_one = owner @ FundError::Unauthorized)]
    pub oracle_state: Account<'info, OracleState>,

    pub owner: Signer<'info>,
}

/// On-chain fund state: owner, rebalance version and cumulative factor
#[account]
pub struct FundState {
    pub owner: Pubkey,
    /// Monotonic rebalance epoch counter.
    pub version: u64,
    /// Product of all epoch ratios, 18‑dec fixed point.
    pub total_ratio: u128,
}

impl FundState {
    pub const LEN: usize = 32 + 8 + 16;
}

/// On-chain oracle state: owner and latest published price
#[account]
pub struct OracleState {
    pub owner: Pubkey,
    /// Price of base in quote, 18‑dec fixed point.
    pub price: u128,
    pub updated_at: u64,
}

impl OracleState {
    pub const LEN: usize = 32 + 16 + 8;
}

#[event]
pub struct Rebalanced {
    pub version: u64,
    pub ratio: u128,
    pub total_ratio: u128,
}

#[error_code]
pub enum FundError {
    #[msg("Rebalance ratio must be non-zero")]
    ZeroRatio,
    #[msg("Oracle price must be non-zero")]
    ZeroPrice,
    #[msg("Cumulative ratio arithmetic overflowed")]
    RatioOverflow,
    #[msg("Signer is not the state owner")]
    Unauthorized,
}
