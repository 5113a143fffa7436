//! In-memory store for tests and single-process embedding
//!
//! Transactions are serialised behind one async mutex. Each transaction works
//! on the live state and keeps a snapshot; rolling back, or dropping it
//! uncommitted, restores the snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{EngineError, EngineResult, ErrorContext};
use crate::ledger::Ledger;
use crate::store::{BetStore, StatusTransition, StoreTransaction};
use crate::types::{
    Bet, BetId, BetParticipation, BetResolver, BetStatus, LoserFulfillmentClaim, ParticipationId,
    ParticipationStatus, ResolutionVote, UserId, VoteId,
};
use crate::validation::MAX_STAKE;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    bets: HashMap<BetId, Bet>,
    participations: BTreeMap<ParticipationId, BetParticipation>,
    resolvers: BTreeMap<(BetId, UserId), BetResolver>,
    votes: Vec<ResolutionVote>,
    claims: BTreeMap<(BetId, UserId), LoserFulfillmentClaim>,
    balances: HashMap<UserId, u64>,
    failing_credits: HashSet<UserId>,
}

/// Store backed by process memory
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user's spendable balance
    pub async fn set_balance(&self, user: UserId, amount: u64) {
        self.state.lock().await.balances.insert(user, amount);
    }

    pub async fn balance_of(&self, user: UserId) -> u64 {
        self.state.lock().await.balances.get(&user).copied().unwrap_or(0)
    }

    /// Make every later credit to `user` fail, simulating a ledger outage
    pub async fn fail_credits_to(&self, user: UserId) {
        self.state.lock().await.failing_credits.insert(user);
    }

    pub async fn restore_credits_to(&self, user: UserId) {
        self.state.lock().await.failing_credits.remove(&user);
    }

    /// Number of active votes a voter has on a bet
    pub async fn active_vote_count(&self, bet_id: BetId, voter: UserId) -> usize {
        self.state
            .lock()
            .await
            .votes
            .iter()
            .filter(|v| v.bet_id == bet_id && v.voter_id == voter && v.active)
            .count()
    }
}

#[async_trait]
impl BetStore for InMemoryStore {
    async fn begin(&self) -> EngineResult<Box<dyn StoreTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

/// Pools share the ledger's signed 64-bit ceiling
fn pool_add(pool: u64, amount: u64) -> Option<u64> {
    pool.checked_add(amount).filter(|total| *total <= MAX_STAKE)
}

impl MemoryTransaction {
    fn bet_mut(&mut self, bet_id: BetId) -> EngineResult<&mut Bet> {
        self.guard.bets.get_mut(&bet_id).ok_or_else(|| {
            EngineError::not_found("bet", bet_id, ErrorContext::new("memory_store", "bet_mut"))
        })
    }
}

#[async_trait]
impl Ledger for MemoryTransaction {
    async fn credit(&mut self, user: UserId, amount: u64) -> EngineResult<()> {
        if self.guard.failing_credits.contains(&user) {
            return Err(EngineError::infrastructure(
                format!("ledger rejected credit to {}", user),
                ErrorContext::new("memory_store", "credit").with_user(user),
            ));
        }
        let balance = self.guard.balances.entry(user).or_insert(0);
        *balance = balance.checked_add(amount).ok_or_else(|| {
            EngineError::infrastructure("balance overflow", ErrorContext::new("memory_store", "credit"))
        })?;
        Ok(())
    }

    async fn debit(&mut self, user: UserId, amount: u64) -> EngineResult<()> {
        let available = self.guard.balances.get(&user).copied().unwrap_or(0);
        if available < amount {
            return Err(EngineError::insufficient_funds(
                amount,
                available,
                ErrorContext::new("memory_store", "debit").with_user(user),
            ));
        }
        self.guard.balances.insert(user, available - amount);
        Ok(())
    }

    async fn balance(&mut self, user: UserId) -> EngineResult<u64> {
        Ok(self.guard.balances.get(&user).copied().unwrap_or(0))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert_bet(&mut self, bet: &Bet) -> EngineResult<()> {
        if self.guard.bets.contains_key(&bet.id) {
            return Err(EngineError::duplicate(
                format!("bet {} already exists", bet.id),
                ErrorContext::new("memory_store", "insert_bet"),
            ));
        }
        self.guard.bets.insert(bet.id, bet.clone());
        Ok(())
    }

    async fn load_bet(&mut self, bet_id: BetId) -> EngineResult<Option<Bet>> {
        Ok(self.guard.bets.get(&bet_id).cloned())
    }

    async fn lock_bet(&mut self, bet_id: BetId) -> EngineResult<Option<Bet>> {
        // the whole state is already held exclusively
        self.load_bet(bet_id).await
    }

    async fn add_stake(&mut self, bet_id: BetId, option: Option<u8>, amount: u64) -> EngineResult<bool> {
        let bet = self.bet_mut(bet_id)?;
        if bet.status != BetStatus::Open {
            return Ok(false);
        }
        let overflow = || {
            EngineError::validation(
                "amount",
                "stake would overflow the bet pool",
                ErrorContext::new("memory_store", "add_stake").with_bet(bet_id),
            )
        };
        bet.total_pool = pool_add(bet.total_pool, amount).ok_or_else(overflow)?;
        bet.total_participants += 1;
        if let Some(index) = option {
            if let Some(entry) = bet.options.iter_mut().find(|o| o.index == index) {
                entry.pool = pool_add(entry.pool, amount).ok_or_else(overflow)?;
                entry.participant_count += 1;
            }
        }
        Ok(true)
    }

    async fn release_stake(&mut self, bet_id: BetId, option: Option<u8>, amount: u64) -> EngineResult<()> {
        let bet = self.bet_mut(bet_id)?;
        bet.total_pool = bet.total_pool.saturating_sub(amount);
        if let Some(index) = option {
            if let Some(entry) = bet.options.iter_mut().find(|o| o.index == index) {
                entry.pool = entry.pool.saturating_sub(amount);
            }
        }
        Ok(())
    }

    async fn insert_participation(&mut self, participation: &BetParticipation) -> EngineResult<bool> {
        let exists = self
            .guard
            .participations
            .values()
            .any(|p| p.bet_id == participation.bet_id && p.user_id == participation.user_id);
        if exists {
            return Ok(false);
        }
        self.guard
            .participations
            .insert(participation.id, participation.clone());
        Ok(true)
    }

    async fn participations(&mut self, bet_id: BetId) -> EngineResult<Vec<BetParticipation>> {
        let mut rows: Vec<BetParticipation> = self
            .guard
            .participations
            .values()
            .filter(|p| p.bet_id == bet_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn settle_participation(
        &mut self,
        participation_id: ParticipationId,
        status: ParticipationStatus,
        payout: u64,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        match self.guard.participations.get_mut(&participation_id) {
            Some(p) if p.status == ParticipationStatus::Active => {
                p.status = status;
                p.payout = payout;
                p.settled_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::not_found(
                "participation",
                participation_id,
                ErrorContext::new("memory_store", "settle_participation"),
            )),
        }
    }

    async fn transition_status(&mut self, bet_id: BetId, transition: &StatusTransition) -> EngineResult<bool> {
        let bet = self.bet_mut(bet_id)?;
        Ok(transition.apply(bet))
    }

    async fn insert_resolvers(&mut self, resolvers: &[BetResolver]) -> EngineResult<()> {
        for resolver in resolvers {
            self.guard
                .resolvers
                .entry((resolver.bet_id, resolver.user_id))
                .or_insert_with(|| resolver.clone());
        }
        Ok(())
    }

    async fn resolvers(&mut self, bet_id: BetId) -> EngineResult<Vec<BetResolver>> {
        Ok(self
            .guard
            .resolvers
            .values()
            .filter(|r| r.bet_id == bet_id)
            .cloned()
            .collect())
    }

    async fn record_vote(&mut self, vote: &ResolutionVote) -> EngineResult<Option<VoteId>> {
        let mut superseded = None;
        for existing in self
            .guard
            .votes
            .iter_mut()
            .filter(|v| v.bet_id == vote.bet_id && v.voter_id == vote.voter_id && v.active)
        {
            existing.active = false;
            superseded = Some(existing.id);
        }
        self.guard.votes.push(vote.clone());
        Ok(superseded)
    }

    async fn votes(&mut self, bet_id: BetId) -> EngineResult<Vec<ResolutionVote>> {
        Ok(self
            .guard
            .votes
            .iter()
            .filter(|v| v.bet_id == bet_id)
            .cloned()
            .collect())
    }

    async fn upsert_claim(&mut self, claim: &LoserFulfillmentClaim) -> EngineResult<bool> {
        let key = (claim.bet_id, claim.user_id);
        match self.guard.claims.get_mut(&key) {
            Some(existing) => {
                existing.proof_url = claim.proof_url.clone();
                existing.proof_description = claim.proof_description.clone();
                existing.updated_at = claim.updated_at;
                Ok(false)
            }
            None => {
                self.guard.claims.insert(key, claim.clone());
                Ok(true)
            }
        }
    }

    async fn claims(&mut self, bet_id: BetId) -> EngineResult<Vec<LoserFulfillmentClaim>> {
        Ok(self
            .guard
            .claims
            .values()
            .filter(|c| c.bet_id == bet_id)
            .cloned()
            .collect())
    }

    async fn confirm_fulfillment(
        &mut self,
        participation_id: ParticipationId,
        at: DateTime<Utc>,
        notes: Option<String>,
    ) -> EngineResult<bool> {
        match self.guard.participations.get_mut(&participation_id) {
            Some(p) if p.fulfillment_confirmed_at.is_none() => {
                p.fulfillment_confirmed_at = Some(at);
                p.confirmation_notes = notes;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::not_found(
                "participation",
                participation_id,
                ErrorContext::new("memory_store", "confirm_fulfillment"),
            )),
        }
    }

    async fn mark_loser_claimed(&mut self, bet_id: BetId, at: DateTime<Utc>) -> EngineResult<()> {
        let bet = self.bet_mut(bet_id)?;
        if bet.loser_claimed_at.is_none() {
            bet.loser_claimed_at = Some(at);
            bet.updated_at = at;
        }
        Ok(())
    }

    async fn mark_all_winners_confirmed(&mut self, bet_id: BetId, at: DateTime<Utc>) -> EngineResult<bool> {
        let bet = self.bet_mut(bet_id)?;
        if bet.all_winners_confirmed_at.is_some() {
            return Ok(false);
        }
        bet.all_winners_confirmed_at = Some(at);
        bet.updated_at = at;
        Ok(true)
    }

    async fn bets_past_deadline(&mut self, now: DateTime<Utc>) -> EngineResult<Vec<BetId>> {
        let mut due: Vec<&Bet> = self
            .guard
            .bets
            .values()
            .filter(|b| b.status == BetStatus::Open && b.betting_deadline <= now)
            .collect();
        due.sort_by_key(|b| b.betting_deadline);
        Ok(due.into_iter().map(|b| b.id).collect())
    }

    async fn bets_resolving_between(
        &mut self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> EngineResult<Vec<Bet>> {
        let mut due: Vec<Bet> = self
            .guard
            .bets
            .values()
            .filter(|b| b.status == BetStatus::Closed && b.resolve_date >= from && b.resolve_date < until)
            .cloned()
            .collect();
        due.sort_by_key(|b| b.resolve_date);
        Ok(due)
    }

    async fn commit(mut self: Box<Self>) -> EngineResult<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> EngineResult<()> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
        Ok(())
    }
}
