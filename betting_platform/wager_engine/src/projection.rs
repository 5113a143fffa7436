//! Read models handed to the presentation layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    Bet, BetId, BetOutcome, BetParticipation, BetStatus, BetType, GroupId, ParticipationStatus,
    ResolutionMethod, Selection, StakeType, UserId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionView {
    pub index: u8,
    pub label: String,
    pub pool: u64,
    pub participant_count: u32,
    /// Share of the total pool, 0-100
    pub pool_share_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipationView {
    pub user_id: UserId,
    pub selection_label: String,
    pub amount: u64,
    pub status: ParticipationStatus,
    pub payout: u64,
    pub fulfillment_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetView {
    pub id: BetId,
    pub group_id: GroupId,
    pub creator_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub bet_type: BetType,
    pub stake_type: StakeType,
    pub resolution_method: ResolutionMethod,
    pub stake_summary: String,
    pub options: Vec<OptionView>,
    pub total_pool: u64,
    pub total_participants: u32,
    pub status: BetStatus,
    pub outcome_label: Option<String>,
    pub betting_deadline: DateTime<Utc>,
    pub resolve_date: DateTime<Utc>,
    pub is_creator: bool,
    pub my_participation: Option<ParticipationView>,
    pub participants: Vec<ParticipationView>,
}

fn selection_label(bet: &Bet, selection: &Selection) -> String {
    match selection {
        Selection::Option { index } => bet
            .option(*index)
            .map(|o| o.label.clone())
            .unwrap_or_else(|| format!("Option {}", index)),
        Selection::Prediction { value } => value.clone(),
    }
}

fn outcome_label(bet: &Bet) -> Option<String> {
    bet.outcome.as_ref().map(|outcome| match outcome {
        BetOutcome::Option { index } => selection_label(bet, &Selection::Option { index: *index }),
        BetOutcome::Predictions { winners, .. } => format!("{} correct prediction(s)", winners.len()),
        BetOutcome::Draw => "Draw".to_string(),
    })
}

fn stake_summary(bet: &Bet) -> String {
    match bet.stake_type {
        StakeType::Social => bet.social_stake_description.clone().unwrap_or_default(),
        StakeType::Credit => match (bet.fixed_stake_amount, bet.minimum_bet, bet.maximum_bet) {
            (Some(fixed), _, _) => format!("{} credits", fixed),
            (None, Some(min), Some(max)) => format!("{}-{} credits", min, max),
            (None, Some(min), None) => format!("at least {} credits", min),
            (None, None, Some(max)) => format!("up to {} credits", max),
            (None, None, None) => "any amount".to_string(),
        },
    }
}

pub fn participation_view(bet: &Bet, participation: &BetParticipation) -> ParticipationView {
    ParticipationView {
        user_id: participation.user_id,
        selection_label: selection_label(bet, &participation.selection),
        amount: participation.amount,
        status: participation.status,
        payout: participation.payout,
        fulfillment_confirmed: participation.fulfillment_confirmed_at.is_some(),
    }
}

/// Project a bet for `viewer`
pub fn bet_view(bet: &Bet, participations: &[BetParticipation], viewer: UserId) -> BetView {
    let options = bet
        .options
        .iter()
        .map(|o| OptionView {
            index: o.index,
            label: o.label.clone(),
            pool: o.pool,
            participant_count: o.participant_count,
            pool_share_pct: if bet.total_pool == 0 {
                0.0
            } else {
                o.pool as f64 * 100.0 / bet.total_pool as f64
            },
        })
        .collect();

    BetView {
        id: bet.id,
        group_id: bet.group_id,
        creator_id: bet.creator_id,
        title: bet.title.clone(),
        description: bet.description.clone(),
        bet_type: bet.bet_type,
        stake_type: bet.stake_type,
        resolution_method: bet.resolution_method,
        stake_summary: stake_summary(bet),
        options,
        total_pool: bet.total_pool,
        total_participants: bet.total_participants,
        status: bet.status,
        outcome_label: outcome_label(bet),
        betting_deadline: bet.betting_deadline,
        resolve_date: bet.resolve_date,
        is_creator: bet.creator_id == viewer,
        my_participation: participations
            .iter()
            .find(|p| p.user_id == viewer)
            .map(|p| participation_view(bet, p)),
        participants: participations.iter().map(|p| participation_view(bet, p)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{bet_fixture, participation_fixture};

    #[test]
    fn test_view_labels_selection_and_share() {
        let mut bet = bet_fixture(BetType::Binary, ResolutionMethod::SelfResolved);
        bet.options[0].pool = 30;
        bet.options[1].pool = 10;
        bet.total_pool = 40;
        bet.outcome = Some(BetOutcome::Option { index: 2 });
        let viewer = UserId::new();
        let parts = vec![participation_fixture(&bet, viewer, Selection::Option { index: 1 }, 30)];

        let view = bet_view(&bet, &parts, viewer);

        assert_eq!(view.options[0].pool_share_pct, 75.0);
        assert_eq!(view.outcome_label.as_deref(), Some("No"));
        assert_eq!(view.my_participation.unwrap().selection_label, "Yes");
        assert!(!view.is_creator);
        assert_eq!(view.stake_summary, "any amount");
    }
}
