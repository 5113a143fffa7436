//! Ledger adapter seam
//!
//! Spendable balances are moved through the same store transaction that flips
//! the participation status, so a payout can never be observed without its
//! settlement (or the reverse).

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::types::UserId;

#[async_trait]
pub trait Ledger: Send {
    /// Add `amount` to the user's spendable balance
    async fn credit(&mut self, user: UserId, amount: u64) -> EngineResult<()>;

    /// Remove `amount`; fails with `InsufficientFunds` without touching the balance
    async fn debit(&mut self, user: UserId, amount: u64) -> EngineResult<()>;

    async fn balance(&mut self, user: UserId) -> EngineResult<u64>;
}
