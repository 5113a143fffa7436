//! Bet lifecycle controller
//!
//! Owns every status transition. Each operation runs in one store
//! transaction: the bet row is locked, the transition is applied with a
//! status guard, settlement and ledger movements follow, and events are
//! emitted only after the commit succeeds. The transactional part of each
//! operation lives in a `*_tx` method whose result decides between commit
//! and rollback; reads always roll back.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use crate::collaborators::{BlobStore, Clock, IdentityProvider, MembershipDirectory};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorContext};
use crate::events::{BetEvent, EventSink, TracingEventSink};
use crate::fulfillment::{self, FulfillmentReport, ProofInput};
use crate::participation::{self, SettlementPlan};
use crate::projection::{self, BetView};
use crate::resolvers::{
    assigned_resolvers, authorize_cancel, authorize_close, authorize_vote, eligible_voters,
    participant_resolvers,
};
use crate::store::{complete, release, BetStore, StatusTransition, StoreTransaction};
use crate::tally::{tally, VoteProgress};
use crate::tracing_logger::{CorrelationId, OperationTimer};
use crate::types::{
    Bet, BetId, BetOption, BetOutcome, BetParticipation, BetResolver, BetStatus, GroupId,
    ParticipationStatus, ResolutionMethod, ResolutionVote, Selection, StakeType, UserId, VoteId,
};
use crate::validation::{
    validate_create, validate_vote_choice, CancelBetRequest, CastVoteRequest, CreateBetRequest,
    JoinBetRequest, LoserClaimRequest, WinnerConfirmRequest,
};

/// External systems the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub membership: Arc<dyn MembershipDirectory>,
    pub blobs: Arc<dyn BlobStore>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Events are logged until a delivery sink is set with [`Collaborators::with_events`]
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        membership: Arc<dyn MembershipDirectory>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            membership,
            blobs,
            events: Arc::new(TracingEventSink),
            clock,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }
}

/// Result of casting a vote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub vote_id: VoteId,
    pub superseded: Option<VoteId>,
    pub progress: VoteProgress,
    /// The bet after the vote; RESOLVED if this vote decided it
    pub bet: Bet,
}

/// What a vote transaction did, for logging and events after commit
struct VoteApplied {
    receipt: VoteReceipt,
    auto_closed: bool,
    settlement: Option<SettlementPlan>,
}

/// What a fulfillment transaction did; `changed` is a first claim or a new confirmation
struct FulfillmentUpdate {
    group_id: GroupId,
    changed: bool,
    report: FulfillmentReport,
    completed: bool,
}

fn ctx(operation: &str) -> ErrorContext {
    ErrorContext::new("wager_engine", operation)
}

/// Users holding a live prediction, the candidates of a winner-set vote
fn predictors(participations: &[BetParticipation]) -> BTreeSet<UserId> {
    participations
        .iter()
        .filter(|p| p.status != ParticipationStatus::Refunded)
        .filter(|p| matches!(p.selection, Selection::Prediction { .. }))
        .map(|p| p.user_id)
        .collect()
}

fn won_users(plan: &SettlementPlan) -> Vec<UserId> {
    plan.lines
        .iter()
        .filter(|l| l.status == ParticipationStatus::Won)
        .map(|l| l.user_id)
        .collect()
}

fn new_bet(creator: UserId, request: &CreateBetRequest, now: chrono::DateTime<chrono::Utc>) -> Bet {
    let options = if request.bet_type.uses_options() {
        request
            .options
            .iter()
            .enumerate()
            .map(|(i, label)| BetOption {
                index: (i + 1) as u8,
                label: label.trim().to_string(),
                pool: 0,
                participant_count: 0,
            })
            .collect()
    } else {
        Vec::new()
    };
    let credit = request.stake_type == StakeType::Credit;

    Bet {
        id: BetId::new(),
        group_id: request.group_id,
        creator_id: creator,
        title: request.title.trim().to_string(),
        description: request.description.clone(),
        bet_type: request.bet_type,
        stake_type: request.stake_type,
        resolution_method: request.resolution_method,
        options,
        fixed_stake_amount: request.fixed_stake_amount.filter(|_| credit),
        social_stake_description: request.social_stake_description.clone().filter(|_| !credit),
        minimum_bet: request.minimum_bet.filter(|_| credit),
        maximum_bet: request.maximum_bet.filter(|_| credit),
        betting_deadline: request.betting_deadline,
        resolve_date: request.resolve_date,
        minimum_votes_required: request.minimum_votes_required,
        allow_creator_vote: request.allow_creator_vote,
        total_pool: 0,
        total_participants: 0,
        status: BetStatus::Open,
        outcome: None,
        resolved_at: None,
        cancelled_at: None,
        cancellation_reason: None,
        loser_claimed_at: None,
        all_winners_confirmed_at: None,
        created_at: now,
        updated_at: now,
    }
}

async fn fetch_bet(
    tx: &mut dyn StoreTransaction,
    bet_id: BetId,
    lock: bool,
    operation: &str,
) -> EngineResult<Bet> {
    let bet = if lock {
        tx.lock_bet(bet_id).await?
    } else {
        tx.load_bet(bet_id).await?
    };
    bet.ok_or_else(|| EngineError::not_found("bet", bet_id, ctx(operation)))
}

async fn insert_new_bet(tx: &mut dyn StoreTransaction, bet: &Bet, resolvers: &[BetResolver]) -> EngineResult<()> {
    tx.insert_bet(bet).await?;
    tx.insert_resolvers(resolvers).await
}

/// Only a LOST participant of a resolved SOCIAL bet may claim
async fn require_loser(tx: &mut dyn StoreTransaction, bet_id: BetId, user: UserId) -> EngineResult<()> {
    let bet = fetch_bet(tx, bet_id, false, "loser_claim").await?;
    fulfillment::require_fulfillable(&bet, "loser_claim")?;
    let participations = tx.participations(bet_id).await?;
    fulfillment::require_participant(&bet, &participations, user, ParticipationStatus::Lost, "loser_claim")?;
    Ok(())
}

/// Reminders for CLOSED bets resolving in `[now, until)` with voters still pending
async fn pending_reminders(
    tx: &mut dyn StoreTransaction,
    now: chrono::DateTime<chrono::Utc>,
    until: chrono::DateTime<chrono::Utc>,
) -> EngineResult<Vec<BetEvent>> {
    let mut reminders = Vec::new();
    for bet in tx.bets_resolving_between(now, until).await? {
        let resolvers = tx.resolvers(bet.id).await?;
        let participations = tx.participations(bet.id).await?;
        let votes = tx.votes(bet.id).await?;

        let voted: BTreeSet<UserId> = votes.iter().filter(|v| v.active).map(|v| v.voter_id).collect();
        let pending: Vec<UserId> = eligible_voters(&bet, &resolvers, &participations)
            .difference(&voted)
            .copied()
            .collect();

        if !pending.is_empty() {
            reminders.push(BetEvent::ResolutionDeadlineApproaching {
                bet_id: bet.id,
                group_id: bet.group_id,
                resolve_date: bet.resolve_date,
                pending_voters: pending,
            });
        }
    }
    Ok(reminders)
}

/// OPEN → CLOSED plus PARTICIPANT_VOTE resolver rows. False if the guard lost.
async fn close_locked(
    tx: &mut dyn StoreTransaction,
    bet: &Bet,
    participations: &[BetParticipation],
    now: chrono::DateTime<chrono::Utc>,
) -> EngineResult<bool> {
    if !tx.transition_status(bet.id, &StatusTransition::close(now)).await? {
        return Ok(false);
    }
    let rows = participant_resolvers(bet, participations, now);
    tx.insert_resolvers(&rows).await?;
    Ok(true)
}

/// The bet lifecycle and resolution engine
pub struct WagerEngine {
    store: Arc<dyn BetStore>,
    deps: Collaborators,
    config: EngineConfig,
}

impl WagerEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn BetStore>, deps: Collaborators) -> Self {
        Self { store, deps, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn caller(&self, session: &str) -> EngineResult<UserId> {
        self.deps.identity.resolve_current_user(session).await
    }

    async fn require_member(&self, user: UserId, group: GroupId, operation: &str) -> EngineResult<()> {
        if self.deps.membership.is_member(user, group).await? {
            return Ok(());
        }
        Err(EngineError::unauthorized(
            "caller is not a member of this group",
            ctx(operation).with_user(user),
        ))
    }

    async fn emit(&self, event: BetEvent) {
        self.deps.events.emit(event).await;
    }

    /// CLOSED → RESOLVED with settlement; None if another caller got there first
    async fn resolve_locked(
        &self,
        tx: &mut dyn StoreTransaction,
        bet: &Bet,
        outcome: BetOutcome,
        participations: &[BetParticipation],
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<Option<SettlementPlan>> {
        if !tx
            .transition_status(bet.id, &StatusTransition::resolve(outcome.clone(), now))
            .await?
        {
            return Ok(None);
        }
        let plan = participation::plan_settlement(bet, &outcome, participations, self.config.house_fee_bps);
        participation::settle(tx, bet, &plan, now).await?;
        Ok(Some(plan))
    }

    async fn resolved_event(&self, bet: &Bet, plan: &SettlementPlan) {
        if let Some(outcome) = bet.outcome.clone() {
            self.emit(BetEvent::BetResolved {
                bet_id: bet.id,
                group_id: bet.group_id,
                outcome,
                winners: won_users(plan),
            })
            .await;
        }
    }

    /// Create an OPEN bet in a group the caller belongs to
    pub async fn create_bet(&self, session: &str, request: CreateBetRequest) -> EngineResult<Bet> {
        let timer = OperationTimer::start("create_bet");
        let result = self.create_bet_inner(session, request, timer.correlation_id()).await;
        timer.finish(result)
    }

    async fn create_bet_inner(
        &self,
        session: &str,
        request: CreateBetRequest,
        correlation_id: &CorrelationId,
    ) -> EngineResult<Bet> {
        let user = self.caller(session).await?;
        self.require_member(user, request.group_id, "create_bet").await?;

        let now = self.deps.clock.now();
        validate_create(&request, now)?;

        if request.resolution_method == ResolutionMethod::AssignedResolvers {
            for resolver in &request.resolver_ids {
                if !self.deps.membership.is_member(*resolver, request.group_id).await? {
                    return Err(EngineError::validation(
                        "resolver_ids",
                        format!("resolver {} is not a member of the group", resolver),
                        ctx("create_bet").with_user(user),
                    ));
                }
            }
        }

        let bet = new_bet(user, &request, now);
        let resolvers = assigned_resolvers(&bet, &request.resolver_ids, now);

        let mut tx = self.store.begin().await?;
        let written = insert_new_bet(tx.as_mut(), &bet, &resolvers).await;
        complete(tx, written).await?;

        info!(
            correlation_id = %correlation_id,
            bet_id = %bet.id,
            user_id = %user,
            bet_type = %bet.bet_type,
            stake_type = %bet.stake_type,
            resolution_method = %bet.resolution_method,
            "Bet created"
        );

        self.emit(BetEvent::BetCreated {
            bet_id: bet.id,
            group_id: bet.group_id,
            creator_id: user,
            title: bet.title.clone(),
        })
        .await;

        Ok(bet)
    }

    /// Stake on an OPEN bet
    pub async fn join_bet(
        &self,
        session: &str,
        bet_id: BetId,
        request: JoinBetRequest,
    ) -> EngineResult<BetParticipation> {
        let timer = OperationTimer::start("join_bet");
        let result = self.join_bet_inner(session, bet_id, request, timer.correlation_id()).await;
        timer.finish(result)
    }

    async fn join_bet_inner(
        &self,
        session: &str,
        bet_id: BetId,
        request: JoinBetRequest,
        correlation_id: &CorrelationId,
    ) -> EngineResult<BetParticipation> {
        let user = self.caller(session).await?;
        let now = self.deps.clock.now();

        let mut tx = self.store.begin().await?;
        let joined = self.join_tx(tx.as_mut(), user, bet_id, &request, now).await;
        let joined = complete(tx, joined).await?;

        info!(
            correlation_id = %correlation_id,
            bet_id = %bet_id,
            user_id = %user,
            amount = joined.amount,
            "Bet joined"
        );
        Ok(joined)
    }

    async fn join_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user: UserId,
        bet_id: BetId,
        request: &JoinBetRequest,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<BetParticipation> {
        let bet = fetch_bet(tx, bet_id, false, "join_bet").await?;
        self.require_member(user, bet.group_id, "join_bet").await?;
        participation::record_stake(tx, &bet, user, request, now).await
    }

    /// Close an OPEN bet early. Closing a CLOSED or RESOLVED bet returns it unchanged.
    pub async fn close_bet(&self, session: &str, bet_id: BetId) -> EngineResult<Bet> {
        let timer = OperationTimer::start("close_bet");
        let result = self.close_bet_inner(session, bet_id, timer.correlation_id()).await;
        timer.finish(result)
    }

    async fn close_bet_inner(
        &self,
        session: &str,
        bet_id: BetId,
        correlation_id: &CorrelationId,
    ) -> EngineResult<Bet> {
        let user = self.caller(session).await?;
        let now = self.deps.clock.now();

        let mut tx = self.store.begin().await?;
        let closing = self.close_tx(tx.as_mut(), user, bet_id, now).await;
        let (bet, closed) = complete(tx, closing).await?;

        if closed {
            info!(correlation_id = %correlation_id, bet_id = %bet_id, user_id = %user, "Bet closed");
            self.emit(BetEvent::BetClosed {
                bet_id,
                group_id: bet.group_id,
                closed_by: Some(user),
            })
            .await;
        }
        Ok(bet)
    }

    /// The bet after the call and whether this call closed it
    async fn close_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user: UserId,
        bet_id: BetId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<(Bet, bool)> {
        let bet = fetch_bet(tx, bet_id, true, "close_bet").await?;
        match bet.status {
            BetStatus::Closed | BetStatus::Resolved => return Ok((bet, false)),
            BetStatus::Cancelled => {
                return Err(EngineError::state_conflict(
                    "bet was cancelled",
                    ctx("close_bet").with_bet(bet_id).with_user(user),
                ))
            }
            BetStatus::Open => {}
        }

        let resolvers = tx.resolvers(bet_id).await?;
        let participations = tx.participations(bet_id).await?;
        let eligible = eligible_voters(&bet, &resolvers, &participations);
        authorize_close(&bet, &eligible, user)?;

        let closed = close_locked(tx, &bet, &participations, now).await?;
        let bet = fetch_bet(tx, bet_id, false, "close_bet").await?;
        Ok((bet, closed))
    }

    /// Record a resolution vote. An OPEN bet past its betting deadline is
    /// closed first; a vote that reaches a decision resolves the bet.
    pub async fn cast_vote(
        &self,
        session: &str,
        bet_id: BetId,
        request: CastVoteRequest,
    ) -> EngineResult<VoteReceipt> {
        let timer = OperationTimer::start("cast_vote");
        let result = self.cast_vote_inner(session, bet_id, request, timer.correlation_id()).await;
        timer.finish(result)
    }

    async fn cast_vote_inner(
        &self,
        session: &str,
        bet_id: BetId,
        request: CastVoteRequest,
        correlation_id: &CorrelationId,
    ) -> EngineResult<VoteReceipt> {
        request.validate()?;
        let user = self.caller(session).await?;
        let now = self.deps.clock.now();

        let mut tx = self.store.begin().await?;
        let applied = self.vote_tx(tx.as_mut(), user, bet_id, request, now).await;
        let applied = complete(tx, applied).await?;
        let receipt = applied.receipt;

        info!(
            correlation_id = %correlation_id,
            bet_id = %bet_id,
            user_id = %user,
            votes_cast = receipt.progress.votes_cast,
            quorum = receipt.progress.quorum,
            decided = receipt.progress.is_decided(),
            "Vote recorded"
        );

        if applied.auto_closed {
            self.emit(BetEvent::BetClosed {
                bet_id,
                group_id: receipt.bet.group_id,
                closed_by: None,
            })
            .await;
        }
        if let Some(plan) = &applied.settlement {
            self.resolved_event(&receipt.bet, plan).await;
        }

        Ok(receipt)
    }

    async fn vote_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user: UserId,
        bet_id: BetId,
        request: CastVoteRequest,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<VoteApplied> {
        let context = || ctx("cast_vote").with_bet(bet_id).with_user(user);
        let mut bet = fetch_bet(tx, bet_id, true, "cast_vote").await?;

        let mut auto_closed = false;
        let status = bet.status;
        match status {
            BetStatus::Open if now >= bet.betting_deadline => {
                let participations = tx.participations(bet_id).await?;
                auto_closed = close_locked(tx, &bet, &participations, now).await?;
                bet = fetch_bet(tx, bet_id, false, "cast_vote").await?;
            }
            BetStatus::Open => {
                return Err(EngineError::state_conflict(
                    "voting opens once betting has closed",
                    context(),
                ))
            }
            BetStatus::Closed => {}
            BetStatus::Resolved | BetStatus::Cancelled => {
                return Err(EngineError::state_conflict(
                    format!("bet is already {}", bet.status),
                    context(),
                ))
            }
        }

        let resolvers = tx.resolvers(bet_id).await?;
        let participations = tx.participations(bet_id).await?;
        let eligible = eligible_voters(&bet, &resolvers, &participations);
        authorize_vote(&bet, &eligible, user)?;

        let candidates = predictors(&participations);
        validate_vote_choice(&bet, &request.choice, &candidates)?;

        let vote = ResolutionVote {
            id: VoteId::new(),
            bet_id,
            voter_id: user,
            choice: request.choice,
            reasoning: request.reasoning,
            active: true,
            created_at: now,
        };
        let superseded = tx.record_vote(&vote).await?;

        let votes = tx.votes(bet_id).await?;
        let progress = tally(&bet, &eligible, &votes, &candidates);

        let mut settlement = None;
        if let Some(outcome) = progress.decision.clone() {
            settlement = self.resolve_locked(tx, &bet, outcome, &participations, now).await?;
        }

        let bet = fetch_bet(tx, bet_id, false, "cast_vote").await?;
        Ok(VoteApplied {
            receipt: VoteReceipt {
                vote_id: vote.id,
                superseded,
                progress,
                bet,
            },
            auto_closed,
            settlement,
        })
    }

    /// Resolve a CLOSED bet whose tally is decided. Resolving a RESOLVED bet
    /// returns it unchanged.
    pub async fn resolve_bet(&self, session: &str, bet_id: BetId) -> EngineResult<Bet> {
        let timer = OperationTimer::start("resolve_bet");
        let result = self.resolve_bet_inner(session, bet_id, timer.correlation_id()).await;
        timer.finish(result)
    }

    async fn resolve_bet_inner(
        &self,
        session: &str,
        bet_id: BetId,
        correlation_id: &CorrelationId,
    ) -> EngineResult<Bet> {
        let user = self.caller(session).await?;
        let now = self.deps.clock.now();

        let mut tx = self.store.begin().await?;
        let resolving = self.resolve_tx(tx.as_mut(), user, bet_id, now).await;
        let (bet, settlement) = complete(tx, resolving).await?;

        if let Some(plan) = &settlement {
            info!(
                correlation_id = %correlation_id,
                bet_id = %bet_id,
                user_id = %user,
                paid_out = plan.total_payout(),
                "Bet resolved"
            );
            self.resolved_event(&bet, plan).await;
        }
        Ok(bet)
    }

    async fn resolve_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user: UserId,
        bet_id: BetId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<(Bet, Option<SettlementPlan>)> {
        let context = || ctx("resolve_bet").with_bet(bet_id).with_user(user);
        let bet = fetch_bet(tx, bet_id, true, "resolve_bet").await?;
        match bet.status {
            BetStatus::Resolved => return Ok((bet, None)),
            BetStatus::Open | BetStatus::Cancelled => {
                return Err(EngineError::state_conflict(
                    format!("bet is {}, resolving requires CLOSED", bet.status),
                    context(),
                ))
            }
            BetStatus::Closed => {}
        }

        let resolvers = tx.resolvers(bet_id).await?;
        let participations = tx.participations(bet_id).await?;
        let eligible = eligible_voters(&bet, &resolvers, &participations);
        authorize_close(&bet, &eligible, user)?;

        let votes = tx.votes(bet_id).await?;
        let progress = tally(&bet, &eligible, &votes, &predictors(&participations));
        let outcome = progress.decision.clone().ok_or_else(|| {
            EngineError::state_conflict(
                format!("{} of {} required votes cast", progress.votes_cast, progress.quorum),
                context(),
            )
        })?;

        let settlement = self.resolve_locked(tx, &bet, outcome, &participations, now).await?;
        let bet = fetch_bet(tx, bet_id, false, "resolve_bet").await?;
        Ok((bet, settlement))
    }

    /// Cancel an OPEN or CLOSED bet and refund every stake
    pub async fn cancel_bet(&self, session: &str, bet_id: BetId, request: CancelBetRequest) -> EngineResult<Bet> {
        let timer = OperationTimer::start("cancel_bet");
        let result = self.cancel_bet_inner(session, bet_id, request, timer.correlation_id()).await;
        timer.finish(result)
    }

    async fn cancel_bet_inner(
        &self,
        session: &str,
        bet_id: BetId,
        request: CancelBetRequest,
        correlation_id: &CorrelationId,
    ) -> EngineResult<Bet> {
        request.validate()?;
        let user = self.caller(session).await?;
        let now = self.deps.clock.now();

        let mut tx = self.store.begin().await?;
        let cancelling = self.cancel_tx(tx.as_mut(), user, bet_id, &request, now).await;
        let (bet, refunds) = complete(tx, cancelling).await?;

        if let Some(plan) = refunds {
            info!(
                correlation_id = %correlation_id,
                bet_id = %bet_id,
                user_id = %user,
                refunded = plan.total_payout(),
                "Bet cancelled"
            );
            self.emit(BetEvent::BetCancelled {
                bet_id,
                group_id: bet.group_id,
                reason: request.reason,
            })
            .await;
        }
        Ok(bet)
    }

    /// The bet after the call and the refunds, if this call cancelled it
    async fn cancel_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user: UserId,
        bet_id: BetId,
        request: &CancelBetRequest,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<(Bet, Option<SettlementPlan>)> {
        let bet = fetch_bet(tx, bet_id, true, "cancel_bet").await?;
        authorize_cancel(&bet, user)?;
        match bet.status {
            BetStatus::Cancelled => return Ok((bet, None)),
            BetStatus::Resolved => {
                return Err(EngineError::state_conflict(
                    "resolved bets cannot be cancelled",
                    ctx("cancel_bet").with_bet(bet_id).with_user(user),
                ))
            }
            BetStatus::Open | BetStatus::Closed => {}
        }

        let transition = StatusTransition::cancel(request.reason.clone(), now);
        if !tx.transition_status(bet_id, &transition).await? {
            let current = fetch_bet(tx, bet_id, false, "cancel_bet").await?;
            return Ok((current, None));
        }

        let participations = tx.participations(bet_id).await?;
        let plan = participation::plan_refund(&bet, &participations);
        participation::settle(tx, &bet, &plan, now).await?;
        participation::release_refunded(tx, &bet, &plan, &participations).await?;

        let bet = fetch_bet(tx, bet_id, false, "cancel_bet").await?;
        Ok((bet, Some(plan)))
    }

    /// A loser of a resolved SOCIAL bet claims to have delivered the stake
    pub async fn loser_claim(
        &self,
        session: &str,
        bet_id: BetId,
        request: LoserClaimRequest,
    ) -> EngineResult<FulfillmentReport> {
        let timer = OperationTimer::start("loser_claim");
        let result = self.loser_claim_inner(session, bet_id, request, timer.correlation_id()).await;
        timer.finish(result)
    }

    async fn loser_claim_inner(
        &self,
        session: &str,
        bet_id: BetId,
        request: LoserClaimRequest,
        correlation_id: &CorrelationId,
    ) -> EngineResult<FulfillmentReport> {
        request.validate()?;
        let user = self.caller(session).await?;

        // check eligibility before storing any upload
        let mut tx = self.store.begin().await?;
        let eligible = require_loser(tx.as_mut(), bet_id, user).await;
        release(tx, eligible).await?;

        let proof_url = match request.proof {
            Some(ProofInput::Url { url }) if url.trim().is_empty() => {
                return Err(EngineError::validation(
                    "proof",
                    "proof url is empty",
                    ctx("loser_claim").with_bet(bet_id),
                ))
            }
            Some(ProofInput::Url { url }) => Some(url.trim().to_string()),
            Some(ProofInput::Upload { bytes, content_type }) => {
                Some(self.deps.blobs.store(bytes, &content_type).await?)
            }
            None => None,
        };

        let now = self.deps.clock.now();
        let mut tx = self.store.begin().await?;
        let claiming = self
            .claim_tx(tx.as_mut(), user, bet_id, proof_url, request.description, now)
            .await;
        let update = complete(tx, claiming).await?;

        info!(
            correlation_id = %correlation_id,
            bet_id = %bet_id,
            user_id = %user,
            first_claim = update.changed,
            status = %update.report.status,
            "Loser claim recorded"
        );

        if update.changed {
            self.emit(BetEvent::LoserClaimed {
                bet_id,
                group_id: update.group_id,
                loser_id: user,
                winners: update.report.winners.clone(),
            })
            .await;
        }
        self.fulfillment_event(bet_id, &update).await;
        Ok(update.report)
    }

    async fn claim_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user: UserId,
        bet_id: BetId,
        proof_url: Option<String>,
        description: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<FulfillmentUpdate> {
        let bet = fetch_bet(tx, bet_id, true, "loser_claim").await?;
        let first = fulfillment::record_claim(tx, &bet, user, proof_url, description, now).await?;
        let (report, completed) = fulfillment::refresh(tx, &bet, now).await?;
        Ok(FulfillmentUpdate {
            group_id: bet.group_id,
            changed: first,
            report,
            completed,
        })
    }

    async fn fulfillment_event(&self, bet_id: BetId, update: &FulfillmentUpdate) {
        if update.completed {
            self.emit(BetEvent::FulfillmentCompleted {
                bet_id,
                group_id: update.group_id,
            })
            .await;
        }
    }

    /// A winner confirms the social stake was delivered; confirmation is final
    pub async fn winner_confirm(
        &self,
        session: &str,
        bet_id: BetId,
        request: WinnerConfirmRequest,
    ) -> EngineResult<FulfillmentReport> {
        let timer = OperationTimer::start("winner_confirm");
        let result = self.winner_confirm_inner(session, bet_id, request, timer.correlation_id()).await;
        timer.finish(result)
    }

    async fn winner_confirm_inner(
        &self,
        session: &str,
        bet_id: BetId,
        request: WinnerConfirmRequest,
        correlation_id: &CorrelationId,
    ) -> EngineResult<FulfillmentReport> {
        request.validate()?;
        let user = self.caller(session).await?;
        let now = self.deps.clock.now();

        let mut tx = self.store.begin().await?;
        let confirming = self.confirm_tx(tx.as_mut(), user, bet_id, request.notes, now).await;
        let update = complete(tx, confirming).await?;

        info!(
            correlation_id = %correlation_id,
            bet_id = %bet_id,
            user_id = %user,
            newly_confirmed = update.changed,
            status = %update.report.status,
            "Winner confirmation recorded"
        );

        self.fulfillment_event(bet_id, &update).await;
        Ok(update.report)
    }

    async fn confirm_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user: UserId,
        bet_id: BetId,
        notes: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<FulfillmentUpdate> {
        let bet = fetch_bet(tx, bet_id, true, "winner_confirm").await?;
        fulfillment::require_fulfillable(&bet, "winner_confirm")?;
        let participations = tx.participations(bet_id).await?;
        let winner = fulfillment::require_participant(
            &bet,
            &participations,
            user,
            ParticipationStatus::Won,
            "winner_confirm",
        )?;

        let confirmed = tx.confirm_fulfillment(winner.id, now, notes).await?;
        let (report, completed) = fulfillment::refresh(tx, &bet, now).await?;
        Ok(FulfillmentUpdate {
            group_id: bet.group_id,
            changed: confirmed,
            report,
            completed,
        })
    }

    /// Current fulfillment state; stamps completion the first time it is seen
    pub async fn fulfillment_status(&self, session: &str, bet_id: BetId) -> EngineResult<FulfillmentReport> {
        let timer = OperationTimer::start("fulfillment_status");
        let result = self.fulfillment_status_inner(session, bet_id).await;
        timer.finish(result)
    }

    async fn fulfillment_status_inner(&self, session: &str, bet_id: BetId) -> EngineResult<FulfillmentReport> {
        let user = self.caller(session).await?;
        let now = self.deps.clock.now();

        let mut tx = self.store.begin().await?;
        let refreshed = self.status_tx(tx.as_mut(), user, bet_id, now).await;
        let update = complete(tx, refreshed).await?;

        self.fulfillment_event(bet_id, &update).await;
        Ok(update.report)
    }

    async fn status_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user: UserId,
        bet_id: BetId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<FulfillmentUpdate> {
        let bet = fetch_bet(tx, bet_id, true, "fulfillment_status").await?;
        self.require_member(user, bet.group_id, "fulfillment_status").await?;
        fulfillment::require_fulfillable(&bet, "fulfillment_status")?;

        let (report, completed) = fulfillment::refresh(tx, &bet, now).await?;
        Ok(FulfillmentUpdate {
            group_id: bet.group_id,
            changed: false,
            report,
            completed,
        })
    }

    /// Live tally preview for group members
    pub async fn get_vote_progress(&self, session: &str, bet_id: BetId) -> EngineResult<VoteProgress> {
        let timer = OperationTimer::start("get_vote_progress");
        let result = self.get_vote_progress_inner(session, bet_id).await;
        timer.finish(result)
    }

    async fn get_vote_progress_inner(&self, session: &str, bet_id: BetId) -> EngineResult<VoteProgress> {
        let user = self.caller(session).await?;

        let mut tx = self.store.begin().await?;
        let progress = self.progress_tx(tx.as_mut(), user, bet_id).await;
        release(tx, progress).await
    }

    async fn progress_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        user: UserId,
        bet_id: BetId,
    ) -> EngineResult<VoteProgress> {
        let bet = fetch_bet(tx, bet_id, false, "get_vote_progress").await?;
        self.require_member(user, bet.group_id, "get_vote_progress").await?;

        let resolvers = tx.resolvers(bet_id).await?;
        let participations = tx.participations(bet_id).await?;
        let votes = tx.votes(bet_id).await?;
        let eligible = eligible_voters(&bet, &resolvers, &participations);

        Ok(tally(&bet, &eligible, &votes, &predictors(&participations)))
    }

    pub async fn get_bet(&self, session: &str, bet_id: BetId) -> EngineResult<BetView> {
        let timer = OperationTimer::start("get_bet");
        let result = self.get_bet_inner(session, bet_id).await;
        timer.finish(result)
    }

    async fn get_bet_inner(&self, session: &str, bet_id: BetId) -> EngineResult<BetView> {
        let user = self.caller(session).await?;

        let mut tx = self.store.begin().await?;
        let view = self.view_tx(tx.as_mut(), user, bet_id).await;
        release(tx, view).await
    }

    async fn view_tx(&self, tx: &mut dyn StoreTransaction, user: UserId, bet_id: BetId) -> EngineResult<BetView> {
        let bet = fetch_bet(tx, bet_id, false, "get_bet").await?;
        self.require_member(user, bet.group_id, "get_bet").await?;
        let participations = tx.participations(bet_id).await?;
        Ok(projection::bet_view(&bet, &participations, user))
    }

    /// Close every OPEN bet whose betting deadline has passed. Driven by an
    /// external scheduler; returns the bets this call closed.
    pub async fn close_expired_bets(&self) -> EngineResult<Vec<BetId>> {
        let timer = OperationTimer::start("close_expired_bets");
        let result = self.close_expired_bets_inner(timer.correlation_id()).await;
        timer.finish(result)
    }

    async fn close_expired_bets_inner(&self, correlation_id: &CorrelationId) -> EngineResult<Vec<BetId>> {
        let now = self.deps.clock.now();
        let mut tx = self.store.begin().await?;
        let due = tx.bets_past_deadline(now).await;
        let due = release(tx, due).await?;

        let mut closed = Vec::new();
        for bet_id in due {
            match self.close_expired(bet_id, now).await {
                Ok(true) => closed.push(bet_id),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        correlation_id = %correlation_id,
                        bet_id = %bet_id,
                        error_id = %e.context.error_id,
                        "Failed to close expired bet: {}", e
                    );
                }
            }
        }

        if !closed.is_empty() {
            info!(correlation_id = %correlation_id, closed = closed.len(), "Expired bets closed");
        }
        Ok(closed)
    }

    async fn close_expired(&self, bet_id: BetId, now: chrono::DateTime<chrono::Utc>) -> EngineResult<bool> {
        let mut tx = self.store.begin().await?;
        let closing = self.close_expired_tx(tx.as_mut(), bet_id, now).await;
        let closed = complete(tx, closing).await?;

        if let Some(group_id) = closed {
            self.emit(BetEvent::BetClosed {
                bet_id,
                group_id,
                closed_by: None,
            })
            .await;
        }
        Ok(closed.is_some())
    }

    /// The bet's group if this call closed it
    async fn close_expired_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        bet_id: BetId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<Option<GroupId>> {
        let bet = fetch_bet(tx, bet_id, true, "close_expired").await?;
        if bet.status != BetStatus::Open || now < bet.betting_deadline {
            return Ok(None);
        }
        let participations = tx.participations(bet_id).await?;
        let closed = close_locked(tx, &bet, &participations, now).await?;
        Ok(closed.then_some(bet.group_id))
    }

    /// Remind pending voters of CLOSED bets whose resolve date falls within
    /// the reminder window. Returns the number of reminders emitted.
    pub async fn notify_resolution_due(&self) -> EngineResult<usize> {
        let timer = OperationTimer::start("notify_resolution_due");
        let result = self.notify_resolution_due_inner().await;
        timer.finish(result)
    }

    async fn notify_resolution_due_inner(&self) -> EngineResult<usize> {
        let now = self.deps.clock.now();
        let until = now + self.config.reminder_window_chrono();

        let mut tx = self.store.begin().await?;
        let reminders = pending_reminders(tx.as_mut(), now, until).await;
        let reminders = release(tx, reminders).await?;

        let count = reminders.len();
        for reminder in reminders {
            self.emit(reminder).await;
        }
        Ok(count)
    }
}
