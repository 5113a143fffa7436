//! Participation ledger: stakes in, settlement out
//!
//! CREDIT settlement is pari-mutuel across the whole pool:
//!
//! ```text
//! draw refund    = stake
//! loser refund   = stake × insurance_pct / 100
//! losing pool    = Σ (loser stake − loser refund)
//! house fee      = losing pool × house_fee_bps / 10000
//! winner payout  = stake + (losing pool − house fee) × stake / Σ winning stakes
//! ```
//!
//! Integer division dust goes to the largest winning stake (ties broken by the
//! lowest user id), so payouts, refunds and the fee always add up to the pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult, ErrorContext};
use crate::store::StoreTransaction;
use crate::types::{
    Bet, BetOutcome, BetParticipation, ParticipationId, ParticipationStatus, UserId,
};
use crate::validation::{validate_selection, JoinBetRequest};

/// One participation's settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLine {
    pub participation_id: ParticipationId,
    pub user_id: UserId,
    pub stake: u64,
    pub status: ParticipationStatus,
    pub payout: u64,
}

/// Every ACTIVE participation's settlement for one decision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPlan {
    pub lines: Vec<SettlementLine>,
    pub house_fee: u64,
}

impl SettlementPlan {
    pub fn total_stake(&self) -> u64 {
        self.lines.iter().map(|l| l.stake).sum()
    }

    pub fn total_payout(&self) -> u64 {
        self.lines.iter().map(|l| l.payout).sum()
    }

    pub fn count(&self, status: ParticipationStatus) -> usize {
        self.lines.iter().filter(|l| l.status == status).count()
    }
}

/// Validate and record a join inside the caller's transaction.
///
/// The bet must have been loaded in the same transaction. The aggregate
/// increment is conditional on the bet still being OPEN, so a join racing a
/// close either lands before it or fails with a state conflict.
pub async fn record_stake(
    tx: &mut dyn StoreTransaction,
    bet: &Bet,
    user: UserId,
    request: &JoinBetRequest,
    now: DateTime<Utc>,
) -> EngineResult<BetParticipation> {
    let context = || ErrorContext::new("participation", "record_stake").with_bet(bet.id).with_user(user);

    if bet.status != crate::types::BetStatus::Open {
        return Err(EngineError::state_conflict(
            format!("bet is {}, joining requires OPEN", bet.status),
            context(),
        ));
    }

    let amount = validate_selection(bet, request)?;

    let participation = BetParticipation {
        id: ParticipationId::new(),
        bet_id: bet.id,
        user_id: user,
        selection: request.selection.clone(),
        amount,
        insurance: request.insurance,
        status: ParticipationStatus::Active,
        payout: 0,
        fulfillment_confirmed_at: None,
        confirmation_notes: None,
        created_at: now,
        settled_at: None,
    };

    if !tx.insert_participation(&participation).await? {
        return Err(EngineError::duplicate("user already joined this bet", context()));
    }

    if bet.is_credit() {
        tx.debit(user, amount).await?;
    }

    if !tx.add_stake(bet.id, request.selection.option_index(), amount).await? {
        return Err(EngineError::state_conflict("bet closed while joining", context()));
    }

    debug!(bet_id = %bet.id, user_id = %user, amount, "stake recorded");
    Ok(participation)
}

/// WON/LOST/DRAW for one participation under a decided outcome
pub fn classify(outcome: &BetOutcome, participation: &BetParticipation) -> ParticipationStatus {
    match outcome {
        BetOutcome::Option { index } => {
            if participation.selection.option_index() == Some(*index) {
                ParticipationStatus::Won
            } else {
                ParticipationStatus::Lost
            }
        }
        BetOutcome::Predictions { winners, draws } => {
            if winners.contains(&participation.user_id) {
                ParticipationStatus::Won
            } else if draws.contains(&participation.user_id) {
                ParticipationStatus::Draw
            } else {
                ParticipationStatus::Lost
            }
        }
        BetOutcome::Draw => ParticipationStatus::Draw,
    }
}

/// Compute the settlement of every ACTIVE participation.
///
/// Without a single WON participation everybody settles as DRAW. SOCIAL bets
/// never carry payouts.
pub fn plan_settlement(
    bet: &Bet,
    outcome: &BetOutcome,
    participations: &[BetParticipation],
    house_fee_bps: u32,
) -> SettlementPlan {
    let active: Vec<&BetParticipation> = participations
        .iter()
        .filter(|p| p.status == ParticipationStatus::Active)
        .collect();

    let mut statuses: Vec<ParticipationStatus> = active.iter().map(|p| classify(outcome, p)).collect();
    if !statuses.contains(&ParticipationStatus::Won) {
        statuses.iter_mut().for_each(|s| *s = ParticipationStatus::Draw);
    }

    let mut lines: Vec<SettlementLine> = active
        .iter()
        .zip(&statuses)
        .map(|(p, status)| SettlementLine {
            participation_id: p.id,
            user_id: p.user_id,
            stake: p.amount,
            status: *status,
            payout: 0,
        })
        .collect();

    if bet.is_social() {
        return SettlementPlan { lines, house_fee: 0 };
    }

    let mut losing_pool: u128 = 0;
    let mut winning_stakes: u128 = 0;
    for (line, p) in lines.iter_mut().zip(&active) {
        match line.status {
            ParticipationStatus::Draw => line.payout = p.amount,
            ParticipationStatus::Lost => {
                let pct = p.insurance.map(|i| i.refund_percentage.min(100)).unwrap_or(0);
                let refund = (p.amount as u128 * pct as u128 / 100) as u64;
                line.payout = refund;
                losing_pool += (p.amount - refund) as u128;
            }
            ParticipationStatus::Won => winning_stakes += p.amount as u128,
            ParticipationStatus::Active | ParticipationStatus::Refunded => {}
        }
    }

    let house_fee = losing_pool * house_fee_bps.min(10_000) as u128 / 10_000;
    let distributable = losing_pool - house_fee;

    let mut distributed: u128 = 0;
    for line in lines.iter_mut().filter(|l| l.status == ParticipationStatus::Won) {
        let share = if winning_stakes == 0 {
            0
        } else {
            distributable * line.stake as u128 / winning_stakes
        };
        distributed += share;
        line.payout = line.stake + share as u64;
    }

    let dust = (distributable - distributed) as u64;
    if dust > 0 {
        let recipient = lines
            .iter_mut()
            .filter(|l| l.status == ParticipationStatus::Won)
            .max_by(|a, b| a.stake.cmp(&b.stake).then(b.user_id.cmp(&a.user_id)));
        if let Some(line) = recipient {
            line.payout += dust;
        }
    }

    SettlementPlan {
        lines,
        house_fee: house_fee as u64,
    }
}

/// Full refund of every ACTIVE participation, used by cancellation
pub fn plan_refund(bet: &Bet, participations: &[BetParticipation]) -> SettlementPlan {
    let lines = participations
        .iter()
        .filter(|p| p.status == ParticipationStatus::Active)
        .map(|p| SettlementLine {
            participation_id: p.id,
            user_id: p.user_id,
            stake: p.amount,
            status: ParticipationStatus::Refunded,
            payout: if bet.is_credit() { p.amount } else { 0 },
        })
        .collect();
    SettlementPlan { lines, house_fee: 0 }
}

/// Apply a plan: each participation leaves ACTIVE once, and its payout is
/// credited in the same transaction. Returns the number of lines applied.
pub async fn settle(
    tx: &mut dyn StoreTransaction,
    bet: &Bet,
    plan: &SettlementPlan,
    at: DateTime<Utc>,
) -> EngineResult<usize> {
    let mut applied = 0;
    for line in &plan.lines {
        if !tx
            .settle_participation(line.participation_id, line.status, line.payout, at)
            .await?
        {
            debug!(participation_id = %line.participation_id, "already settled, skipping");
            continue;
        }
        if bet.is_credit() && line.payout > 0 {
            tx.credit(line.user_id, line.payout).await?;
        }
        applied += 1;
    }

    info!(
        bet_id = %bet.id,
        settled = applied,
        paid_out = plan.total_payout(),
        house_fee = plan.house_fee,
        "participations settled"
    );
    Ok(applied)
}

/// Remove refunded stakes from the pool aggregates
pub async fn release_refunded(
    tx: &mut dyn StoreTransaction,
    bet: &Bet,
    plan: &SettlementPlan,
    participations: &[BetParticipation],
) -> EngineResult<()> {
    for line in plan.lines.iter().filter(|l| l.status == ParticipationStatus::Refunded) {
        let option = participations
            .iter()
            .find(|p| p.id == line.participation_id)
            .and_then(|p| p.selection.option_index());
        tx.release_stake(bet.id, option, line.stake).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{bet_fixture, participation_fixture};
    use crate::types::{BetType, InsuranceCoverage, ResolutionMethod, Selection, StakeType};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn pick(index: u8) -> Selection {
        Selection::Option { index }
    }

    fn line_for(plan: &SettlementPlan, user: UserId) -> &SettlementLine {
        plan.lines.iter().find(|l| l.user_id == user).unwrap()
    }

    #[test]
    fn test_winners_share_losing_pool_by_stake() {
        let bet = bet_fixture(BetType::Binary, ResolutionMethod::SelfResolved);
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        let parts = vec![
            participation_fixture(&bet, a, pick(1), 30),
            participation_fixture(&bet, b, pick(1), 10),
            participation_fixture(&bet, c, pick(2), 40),
        ];

        let plan = plan_settlement(&bet, &BetOutcome::Option { index: 1 }, &parts, 0);

        assert_eq!(line_for(&plan, a).payout, 60);
        assert_eq!(line_for(&plan, b).payout, 20);
        assert_eq!(line_for(&plan, c).status, ParticipationStatus::Lost);
        assert_eq!(line_for(&plan, c).payout, 0);
        assert_eq!(plan.total_payout(), 80);
    }

    #[test]
    fn test_fee_and_insurance_taken_from_losing_side() {
        let bet = bet_fixture(BetType::Binary, ResolutionMethod::SelfResolved);
        let (a, b) = (UserId::new(), UserId::new());
        let mut loser = participation_fixture(&bet, b, pick(2), 100);
        loser.insurance = Some(InsuranceCoverage {
            item_id: None,
            refund_percentage: 50,
        });
        let parts = vec![participation_fixture(&bet, a, pick(1), 100), loser];

        let plan = plan_settlement(&bet, &BetOutcome::Option { index: 1 }, &parts, 1_000);

        assert_eq!(line_for(&plan, b).payout, 50);
        assert_eq!(plan.house_fee, 5);
        assert_eq!(line_for(&plan, a).payout, 145);
        assert_eq!(plan.total_payout() + plan.house_fee, 200);
    }

    #[test]
    fn test_dust_goes_to_largest_stake() {
        let bet = bet_fixture(BetType::MultipleChoice, ResolutionMethod::SelfResolved);
        let (a, b, c, d) = (UserId::new(), UserId::new(), UserId::new(), UserId::new());
        let parts = vec![
            participation_fixture(&bet, a, pick(1), 10),
            participation_fixture(&bet, b, pick(1), 10),
            participation_fixture(&bet, c, pick(1), 20),
            participation_fixture(&bet, d, pick(3), 7),
        ];

        let plan = plan_settlement(&bet, &BetOutcome::Option { index: 1 }, &parts, 0);

        // 7 split 1:1:2 → 1, 1, 3 plus 2 dust to the 20 stake
        assert_eq!(line_for(&plan, a).payout, 11);
        assert_eq!(line_for(&plan, b).payout, 11);
        assert_eq!(line_for(&plan, c).payout, 25);
        assert_eq!(plan.total_payout(), 47);
    }

    #[test]
    fn test_no_winner_refunds_everyone_as_draw() {
        let bet = bet_fixture(BetType::MultipleChoice, ResolutionMethod::SelfResolved);
        let parts = vec![
            participation_fixture(&bet, UserId::new(), pick(1), 10),
            participation_fixture(&bet, UserId::new(), pick(2), 15),
        ];

        let plan = plan_settlement(&bet, &BetOutcome::Option { index: 3 }, &parts, 500);

        assert_eq!(plan.count(ParticipationStatus::Draw), 2);
        assert_eq!(plan.total_payout(), 25);
        assert_eq!(plan.house_fee, 0);
    }

    #[test]
    fn test_prediction_draws_are_refunded() {
        let bet = bet_fixture(BetType::Prediction, ResolutionMethod::AssignedResolvers);
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        let guess = |v: &str| Selection::Prediction { value: v.to_string() };
        let parts = vec![
            participation_fixture(&bet, a, guess("3-1"), 10),
            participation_fixture(&bet, b, guess("2-2"), 10),
            participation_fixture(&bet, c, guess("0-1"), 10),
        ];
        let outcome = BetOutcome::Predictions {
            winners: BTreeSet::from([a]),
            draws: BTreeSet::from([b]),
        };

        let plan = plan_settlement(&bet, &outcome, &parts, 0);

        assert_eq!(line_for(&plan, a).payout, 20);
        assert_eq!(line_for(&plan, b).status, ParticipationStatus::Draw);
        assert_eq!(line_for(&plan, b).payout, 10);
        assert_eq!(line_for(&plan, c).payout, 0);
    }

    #[test]
    fn test_social_settlement_has_no_payouts() {
        let mut bet = bet_fixture(BetType::Binary, ResolutionMethod::SelfResolved);
        bet.stake_type = StakeType::Social;
        let parts = vec![
            participation_fixture(&bet, UserId::new(), pick(1), 0),
            participation_fixture(&bet, UserId::new(), pick(2), 0),
        ];

        let plan = plan_settlement(&bet, &BetOutcome::Option { index: 1 }, &parts, 250);

        assert_eq!(plan.count(ParticipationStatus::Won), 1);
        assert_eq!(plan.count(ParticipationStatus::Lost), 1);
        assert_eq!(plan.total_payout(), 0);
    }

    #[test]
    fn test_refund_skips_settled_participations() {
        let bet = bet_fixture(BetType::Binary, ResolutionMethod::SelfResolved);
        let mut settled = participation_fixture(&bet, UserId::new(), pick(1), 10);
        settled.status = ParticipationStatus::Refunded;
        let parts = vec![participation_fixture(&bet, UserId::new(), pick(2), 10), settled];

        let plan = plan_refund(&bet, &parts);

        assert_eq!(plan.lines.len(), 1);
        assert_eq!(plan.total_payout(), 10);
    }

    proptest! {
        #[test]
        fn prop_settlement_conserves_pool(
            stakes in prop::collection::vec((1u64..1_000_000, 1u8..=3, 0u8..=100), 1..20),
            winning in 1u8..=3,
            fee_bps in 0u32..=2_000,
        ) {
            let bet = bet_fixture(BetType::MultipleChoice, ResolutionMethod::SelfResolved);
            let parts: Vec<BetParticipation> = stakes
                .iter()
                .map(|(amount, option, pct)| {
                    let mut p = participation_fixture(&bet, UserId::new(), pick(*option), *amount);
                    p.insurance = Some(InsuranceCoverage { item_id: None, refund_percentage: *pct });
                    p
                })
                .collect();
            let pool: u64 = stakes.iter().map(|(a, _, _)| *a).sum();

            let plan = plan_settlement(&bet, &BetOutcome::Option { index: winning }, &parts, fee_bps);

            prop_assert_eq!(plan.total_payout() + plan.house_fee, pool);
            for line in &plan.lines {
                match line.status {
                    ParticipationStatus::Won => prop_assert!(line.payout >= line.stake),
                    ParticipationStatus::Draw => prop_assert_eq!(line.payout, line.stake),
                    _ => prop_assert!(line.payout <= line.stake),
                }
            }
        }
    }
}
