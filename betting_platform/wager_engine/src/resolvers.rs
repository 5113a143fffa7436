//! Resolver registry: who may vote on or decide a bet's outcome

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult, ErrorContext};
use crate::types::{
    Bet, BetParticipation, BetResolver, BetStatus, ParticipationStatus, ResolutionMethod, UserId,
};

/// Rows persisted at create time. Only ASSIGNED_RESOLVERS has an upfront list.
pub fn assigned_resolvers(bet: &Bet, resolver_ids: &[UserId], now: DateTime<Utc>) -> Vec<BetResolver> {
    if bet.resolution_method != ResolutionMethod::AssignedResolvers {
        return Vec::new();
    }
    let unique: BTreeSet<UserId> = resolver_ids.iter().copied().collect();
    unique
        .into_iter()
        .map(|user_id| BetResolver {
            bet_id: bet.id,
            user_id,
            active: true,
            created_at: now,
        })
        .collect()
}

/// Rows materialised when a PARTICIPANT_VOTE bet closes: every ACTIVE
/// participant, plus a non-participating creator when `allow_creator_vote`.
pub fn participant_resolvers(
    bet: &Bet,
    participations: &[BetParticipation],
    now: DateTime<Utc>,
) -> Vec<BetResolver> {
    if bet.resolution_method != ResolutionMethod::ParticipantVote {
        return Vec::new();
    }
    live_participant_voters(bet, participations)
        .into_iter()
        .map(|user_id| BetResolver {
            bet_id: bet.id,
            user_id,
            active: true,
            created_at: now,
        })
        .collect()
}

fn live_participant_voters(bet: &Bet, participations: &[BetParticipation]) -> BTreeSet<UserId> {
    let mut voters: BTreeSet<UserId> = participations
        .iter()
        .filter(|p| p.status == ParticipationStatus::Active)
        .map(|p| p.user_id)
        .collect();
    if bet.allow_creator_vote {
        voters.insert(bet.creator_id);
    }
    voters
}

/// The set of users whose votes count for this bet
pub fn eligible_voters(
    bet: &Bet,
    resolvers: &[BetResolver],
    participations: &[BetParticipation],
) -> BTreeSet<UserId> {
    match bet.resolution_method {
        ResolutionMethod::SelfResolved => [bet.creator_id].into_iter().collect(),
        ResolutionMethod::AssignedResolvers => {
            let mut voters: BTreeSet<UserId> = resolvers
                .iter()
                .filter(|r| r.active)
                .map(|r| r.user_id)
                .collect();
            if bet.allow_creator_vote {
                voters.insert(bet.creator_id);
            }
            voters
        }
        ResolutionMethod::ParticipantVote => {
            if bet.status == BetStatus::Open {
                // not materialised yet; preview against current participants
                live_participant_voters(bet, participations)
            } else {
                resolvers.iter().filter(|r| r.active).map(|r| r.user_id).collect()
            }
        }
    }
}

/// Caller must be an eligible voter
pub fn authorize_vote(bet: &Bet, eligible: &BTreeSet<UserId>, caller: UserId) -> EngineResult<()> {
    if eligible.contains(&caller) {
        return Ok(());
    }
    let reason = match bet.resolution_method {
        ResolutionMethod::SelfResolved => "only the creator resolves this bet",
        ResolutionMethod::AssignedResolvers => "caller is not an assigned resolver",
        ResolutionMethod::ParticipantVote => "caller did not participate in this bet",
    };
    Err(EngineError::unauthorized(
        reason,
        ErrorContext::new("resolvers", "authorize_vote")
            .with_bet(bet.id)
            .with_user(caller),
    ))
}

/// Creator, or anyone who may decide the outcome, may close early
pub fn authorize_close(bet: &Bet, eligible: &BTreeSet<UserId>, caller: UserId) -> EngineResult<()> {
    if caller == bet.creator_id || eligible.contains(&caller) {
        return Ok(());
    }
    Err(EngineError::unauthorized(
        "only the creator or a resolver may close this bet",
        ErrorContext::new("resolvers", "authorize_close")
            .with_bet(bet.id)
            .with_user(caller),
    ))
}

/// Only the creator may cancel
pub fn authorize_cancel(bet: &Bet, caller: UserId) -> EngineResult<()> {
    if caller == bet.creator_id {
        return Ok(());
    }
    Err(EngineError::unauthorized(
        "only the creator may cancel this bet",
        ErrorContext::new("resolvers", "authorize_cancel")
            .with_bet(bet.id)
            .with_user(caller),
    ))
}
