//! Social-stake fulfillment: losers claim they paid up, winners confirm.
//!
//! The status is derived, never stored, except for the one-time
//! `all_winners_confirmed_at` stamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult, ErrorContext};
use crate::store::StoreTransaction;
use crate::types::{
    Bet, BetId, BetParticipation, BetStatus, FulfillmentStatus, LoserFulfillmentClaim,
    ParticipationStatus, UserId,
};

/// Proof attached to a loser claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProofInput {
    /// Already hosted somewhere
    Url { url: String },
    /// Raw upload, stored through the blob collaborator
    Upload { bytes: Vec<u8>, content_type: String },
}

/// Derived fulfillment state of a resolved social bet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentReport {
    pub bet_id: BetId,
    pub status: FulfillmentStatus,
    pub winners: Vec<UserId>,
    pub confirmed_winners: Vec<UserId>,
    pub losers: Vec<UserId>,
    pub claims: Vec<LoserFulfillmentClaim>,
    pub loser_claimed_at: Option<DateTime<Utc>>,
    pub all_winners_confirmed_at: Option<DateTime<Utc>>,
}

fn with_status(participations: &[BetParticipation], status: ParticipationStatus) -> Vec<&BetParticipation> {
    participations.iter().filter(|p| p.status == status).collect()
}

/// PENDING until a loser claims or a winner confirms, FULFILLED once every
/// winner has confirmed. No winners at all is trivially FULFILLED.
pub fn derive_status(bet: &Bet, participations: &[BetParticipation]) -> FulfillmentStatus {
    if bet.all_winners_confirmed_at.is_some() {
        return FulfillmentStatus::Fulfilled;
    }
    let winners = with_status(participations, ParticipationStatus::Won);
    let confirmed = winners.iter().filter(|p| p.fulfillment_confirmed_at.is_some()).count();

    if confirmed == winners.len() {
        FulfillmentStatus::Fulfilled
    } else if confirmed > 0 || bet.loser_claimed_at.is_some() {
        FulfillmentStatus::PartiallyFulfilled
    } else {
        FulfillmentStatus::Pending
    }
}

pub fn report(
    bet: &Bet,
    participations: &[BetParticipation],
    claims: Vec<LoserFulfillmentClaim>,
) -> FulfillmentReport {
    let winners = with_status(participations, ParticipationStatus::Won);
    FulfillmentReport {
        bet_id: bet.id,
        status: derive_status(bet, participations),
        confirmed_winners: winners
            .iter()
            .filter(|p| p.fulfillment_confirmed_at.is_some())
            .map(|p| p.user_id)
            .collect(),
        winners: winners.iter().map(|p| p.user_id).collect(),
        losers: with_status(participations, ParticipationStatus::Lost)
            .iter()
            .map(|p| p.user_id)
            .collect(),
        claims,
        loser_claimed_at: bet.loser_claimed_at,
        all_winners_confirmed_at: bet.all_winners_confirmed_at,
    }
}

/// Fulfillment only exists for resolved SOCIAL bets
pub fn require_fulfillable(bet: &Bet, operation: &str) -> EngineResult<()> {
    let context = || ErrorContext::new("fulfillment", operation).with_bet(bet.id);
    if !bet.is_social() {
        return Err(EngineError::state_conflict(
            "fulfillment applies to SOCIAL bets only",
            context(),
        ));
    }
    if bet.status != BetStatus::Resolved {
        return Err(EngineError::state_conflict(
            format!("bet is {}, fulfillment starts once it is RESOLVED", bet.status),
            context(),
        ));
    }
    Ok(())
}

/// The caller's participation, which must have settled as `expected`
pub fn require_participant<'a>(
    bet: &Bet,
    participations: &'a [BetParticipation],
    user: UserId,
    expected: ParticipationStatus,
    operation: &str,
) -> EngineResult<&'a BetParticipation> {
    let context = || ErrorContext::new("fulfillment", operation).with_bet(bet.id).with_user(user);
    let participation = participations
        .iter()
        .find(|p| p.user_id == user)
        .ok_or_else(|| EngineError::unauthorized("caller did not participate in this bet", context()))?;
    if participation.status != expected {
        return Err(EngineError::unauthorized(
            format!("only {} participants may do this, caller is {}", expected, participation.status),
            context(),
        ));
    }
    Ok(participation)
}

/// Insert or update the loser's claim; true on the loser's first claim
pub async fn record_claim(
    tx: &mut dyn StoreTransaction,
    bet: &Bet,
    loser: UserId,
    proof_url: Option<String>,
    proof_description: Option<String>,
    now: DateTime<Utc>,
) -> EngineResult<bool> {
    let claim = LoserFulfillmentClaim {
        bet_id: bet.id,
        user_id: loser,
        proof_url,
        proof_description,
        claimed_at: now,
        updated_at: now,
    };
    let first = tx.upsert_claim(&claim).await?;
    tx.mark_loser_claimed(bet.id, now).await?;
    Ok(first)
}

/// Stamp `all_winners_confirmed_at` the first time the derived status is
/// FULFILLED. Returns the report and whether this call wrote the stamp.
pub async fn refresh(
    tx: &mut dyn StoreTransaction,
    bet: &Bet,
    now: DateTime<Utc>,
) -> EngineResult<(FulfillmentReport, bool)> {
    let participations = tx.participations(bet.id).await?;
    let mut stamped = false;

    if bet.all_winners_confirmed_at.is_none()
        && derive_status(bet, &participations) == FulfillmentStatus::Fulfilled
    {
        stamped = tx.mark_all_winners_confirmed(bet.id, now).await?;
        if stamped {
            info!(bet_id = %bet.id, "all winners confirmed fulfillment");
        }
    }

    let bet = match tx.load_bet(bet.id).await? {
        Some(reloaded) => reloaded,
        None => bet.clone(),
    };
    let claims = tx.claims(bet.id).await?;
    Ok((report(&bet, &participations, claims), stamped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{bet_fixture, participation_fixture};
    use crate::types::{BetType, ResolutionMethod, Selection, StakeType};

    fn social_bet() -> Bet {
        let mut bet = bet_fixture(BetType::Binary, ResolutionMethod::SelfResolved);
        bet.stake_type = StakeType::Social;
        bet.status = BetStatus::Resolved;
        bet
    }

    fn settled(bet: &Bet, status: ParticipationStatus) -> BetParticipation {
        let mut p = participation_fixture(bet, UserId::new(), Selection::Option { index: 1 }, 0);
        p.status = status;
        p
    }

    #[test]
    fn test_status_progression() {
        let mut bet = social_bet();
        let mut winner = settled(&bet, ParticipationStatus::Won);
        let parts = vec![winner.clone(), settled(&bet, ParticipationStatus::Lost)];
        assert_eq!(derive_status(&bet, &parts), FulfillmentStatus::Pending);

        bet.loser_claimed_at = Some(Utc::now());
        assert_eq!(derive_status(&bet, &parts), FulfillmentStatus::PartiallyFulfilled);

        winner.fulfillment_confirmed_at = Some(Utc::now());
        let parts = vec![winner, parts[1].clone()];
        assert_eq!(derive_status(&bet, &parts), FulfillmentStatus::Fulfilled);
    }

    #[test]
    fn test_no_winners_is_fulfilled() {
        let bet = social_bet();
        let parts = vec![settled(&bet, ParticipationStatus::Draw)];
        assert_eq!(derive_status(&bet, &parts), FulfillmentStatus::Fulfilled);
    }

    #[test]
    fn test_stamp_wins_over_participations() {
        let mut bet = social_bet();
        bet.all_winners_confirmed_at = Some(Utc::now());
        let parts = vec![settled(&bet, ParticipationStatus::Won)];
        assert_eq!(derive_status(&bet, &parts), FulfillmentStatus::Fulfilled);
    }

    #[test]
    fn test_credit_bets_have_no_fulfillment() {
        let mut bet = social_bet();
        bet.stake_type = StakeType::Credit;
        assert!(require_fulfillable(&bet, "loser_claim").is_err());
    }

    #[test]
    fn test_only_losers_claim() {
        let bet = social_bet();
        let winner = settled(&bet, ParticipationStatus::Won);
        let parts = vec![winner.clone()];
        let err = require_participant(&bet, &parts, winner.user_id, ParticipationStatus::Lost, "loser_claim")
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Authorization);
    }
}
