//! Persistence for bets and everything a bet owns
//!
//! Every lifecycle operation runs inside one [`StoreTransaction`] and ends it
//! with [`complete`] (commit on success, roll back on error) or [`release`]
//! (always roll back, for reads). Dropping a transaction that was never ended
//! still rolls it back, but stores may pay for it: Postgres closes the
//! connection instead of returning it to the pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::EngineResult;
use crate::ledger::Ledger;
use crate::types::{
    Bet, BetId, BetOutcome, BetParticipation, BetResolver, BetStatus, LoserFulfillmentClaim,
    ParticipationId, ParticipationStatus, ResolutionVote, VoteId,
};

pub mod memory;
pub mod migrations;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::{DatabaseConfig, PostgresStore};

/// A guarded status change: applied only if the current status is in `from`
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub from: &'static [BetStatus],
    pub to: BetStatus,
    pub at: DateTime<Utc>,
    pub outcome: Option<BetOutcome>,
    pub cancellation_reason: Option<String>,
}

impl StatusTransition {
    pub fn close(at: DateTime<Utc>) -> Self {
        Self {
            from: &[BetStatus::Open],
            to: BetStatus::Closed,
            at,
            outcome: None,
            cancellation_reason: None,
        }
    }

    pub fn resolve(outcome: BetOutcome, at: DateTime<Utc>) -> Self {
        Self {
            from: &[BetStatus::Closed],
            to: BetStatus::Resolved,
            at,
            outcome: Some(outcome),
            cancellation_reason: None,
        }
    }

    pub fn cancel(reason: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            from: &[BetStatus::Open, BetStatus::Closed],
            to: BetStatus::Cancelled,
            at,
            outcome: None,
            cancellation_reason: reason,
        }
    }

    /// Apply to an in-memory bet, returning false if the guard fails
    pub fn apply(&self, bet: &mut Bet) -> bool {
        if !self.from.contains(&bet.status) {
            return false;
        }
        bet.status = self.to;
        bet.updated_at = self.at;
        match self.to {
            BetStatus::Resolved => {
                bet.outcome = self.outcome.clone();
                bet.resolved_at = Some(self.at);
            }
            BetStatus::Cancelled => {
                bet.cancelled_at = Some(self.at);
                bet.cancellation_reason = self.cancellation_reason.clone();
            }
            BetStatus::Open | BetStatus::Closed => {}
        }
        true
    }
}

/// Unit of work over the relational store
#[async_trait]
pub trait StoreTransaction: Ledger {
    async fn insert_bet(&mut self, bet: &Bet) -> EngineResult<()>;

    async fn load_bet(&mut self, bet_id: BetId) -> EngineResult<Option<Bet>>;

    /// Load and row-lock the bet for the rest of the transaction
    async fn lock_bet(&mut self, bet_id: BetId) -> EngineResult<Option<Bet>>;

    /// Atomically add a stake to the pool aggregates, only while the bet is
    /// OPEN. Returns false when the guard fails.
    async fn add_stake(&mut self, bet_id: BetId, option: Option<u8>, amount: u64) -> EngineResult<bool>;

    /// Remove a refunded stake from the pool aggregates
    async fn release_stake(&mut self, bet_id: BetId, option: Option<u8>, amount: u64) -> EngineResult<()>;

    /// Returns false if the user already participates in the bet
    async fn insert_participation(&mut self, participation: &BetParticipation) -> EngineResult<bool>;

    async fn participations(&mut self, bet_id: BetId) -> EngineResult<Vec<BetParticipation>>;

    /// ACTIVE → `status`; returns false if the participation was already settled
    async fn settle_participation(
        &mut self,
        participation_id: ParticipationId,
        status: ParticipationStatus,
        payout: u64,
        at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Conditional status update; returns false when the guard fails
    async fn transition_status(&mut self, bet_id: BetId, transition: &StatusTransition) -> EngineResult<bool>;

    async fn insert_resolvers(&mut self, resolvers: &[BetResolver]) -> EngineResult<()>;

    async fn resolvers(&mut self, bet_id: BetId) -> EngineResult<Vec<BetResolver>>;

    /// Deactivate the voter's previous vote and insert this one; returns the
    /// superseded vote id, if any
    async fn record_vote(&mut self, vote: &ResolutionVote) -> EngineResult<Option<VoteId>>;

    /// Every vote on the bet, active or superseded
    async fn votes(&mut self, bet_id: BetId) -> EngineResult<Vec<ResolutionVote>>;

    /// Insert or update the proof of a claim; returns true on first claim
    async fn upsert_claim(&mut self, claim: &LoserFulfillmentClaim) -> EngineResult<bool>;

    async fn claims(&mut self, bet_id: BetId) -> EngineResult<Vec<LoserFulfillmentClaim>>;

    /// Stamp a winner's confirmation; returns false if already confirmed
    async fn confirm_fulfillment(
        &mut self,
        participation_id: ParticipationId,
        at: DateTime<Utc>,
        notes: Option<String>,
    ) -> EngineResult<bool>;

    /// Stamp the first loser claim time, keeping an existing stamp
    async fn mark_loser_claimed(&mut self, bet_id: BetId, at: DateTime<Utc>) -> EngineResult<()>;

    /// Stamp completion once; returns false if it was already stamped
    async fn mark_all_winners_confirmed(&mut self, bet_id: BetId, at: DateTime<Utc>) -> EngineResult<bool>;

    /// OPEN bets whose betting deadline is at or before `now`
    async fn bets_past_deadline(&mut self, now: DateTime<Utc>) -> EngineResult<Vec<BetId>>;

    /// CLOSED bets whose resolve date falls in `[from, until)`
    async fn bets_resolving_between(
        &mut self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> EngineResult<Vec<Bet>>;

    async fn commit(self: Box<Self>) -> EngineResult<()>;

    /// Discard every change made in this transaction
    async fn rollback(self: Box<Self>) -> EngineResult<()>;
}

/// Commit if `result` is Ok, roll back otherwise, and pass the result through
pub async fn complete<T>(tx: Box<dyn StoreTransaction>, result: EngineResult<T>) -> EngineResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = tx.rollback().await {
                warn!(error_id = %rollback_error.context.error_id, "Rollback after error failed: {}", rollback_error);
            }
            Err(e)
        }
    }
}

/// Roll back a read-only transaction and pass `result` through
pub async fn release<T>(tx: Box<dyn StoreTransaction>, result: EngineResult<T>) -> EngineResult<T> {
    if let Err(rollback_error) = tx.rollback().await {
        warn!(error_id = %rollback_error.context.error_id, "Rollback of read failed: {}", rollback_error);
    }
    result
}

/// Factory for transactions
#[async_trait]
pub trait BetStore: Send + Sync {
    async fn begin(&self) -> EngineResult<Box<dyn StoreTransaction>>;
}
