//! Fixtures shared by unit tests

use chrono::{Duration, Utc};

use crate::types::{
    Bet, BetId, BetOption, BetParticipation, BetStatus, BetType, GroupId, ParticipationId,
    ParticipationStatus, ResolutionMethod, Selection, StakeType, UserId,
};

/// An OPEN CREDIT bet with options matching `bet_type`
pub fn bet_fixture(bet_type: BetType, resolution_method: ResolutionMethod) -> Bet {
    let now = Utc::now();
    let labels: &[&str] = match bet_type {
        BetType::Binary => &["Yes", "No"],
        BetType::MultipleChoice => &["Red", "Green", "Blue"],
        BetType::Prediction => &[],
    };
    let options = labels
        .iter()
        .enumerate()
        .map(|(i, label)| BetOption {
            index: (i + 1) as u8,
            label: label.to_string(),
            pool: 0,
            participant_count: 0,
        })
        .collect();

    Bet {
        id: BetId::new(),
        group_id: GroupId::new(),
        creator_id: UserId::new(),
        title: "Will it rain on Saturday?".to_string(),
        description: None,
        bet_type,
        stake_type: StakeType::Credit,
        resolution_method,
        options,
        fixed_stake_amount: None,
        social_stake_description: None,
        minimum_bet: None,
        maximum_bet: None,
        betting_deadline: now + Duration::hours(1),
        resolve_date: now + Duration::hours(2),
        minimum_votes_required: None,
        allow_creator_vote: false,
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

pub fn participation_fixture(bet: &Bet, user: UserId, selection: Selection, amount: u64) -> BetParticipation {
    BetParticipation {
        id: ParticipationId::new(),
        bet_id: bet.id,
        user_id: user,
        selection,
        amount,
        insurance: None,
        status: ParticipationStatus::Active,
        payout: 0,
        fulfillment_confirmed_at: None,
        confirmation_notes: None,
        created_at: Utc::now(),
        settled_at: None,
    }
}
