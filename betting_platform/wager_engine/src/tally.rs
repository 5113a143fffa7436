//! Vote tally engine
//!
//! Pure functions of (eligible voters, active votes, quorum). Nothing here
//! touches storage, so the same code serves live progress previews and the
//! lifecycle controller's commit decision.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{Bet, BetId, BetOutcome, BetType, ResolutionMethod, ResolutionVote, UserId, VoteChoice};

/// Per-candidate verdict in a winner-set tally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateVerdict {
    Winner,
    Draw,
    Loser,
}

/// Votes naming one option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionCount {
    pub index: u8,
    pub votes: usize,
}

/// How often one predictor was named as a winner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTally {
    pub user_id: UserId,
    pub votes_for: usize,
    pub counted_votes: usize,
    pub verdict: CandidateVerdict,
}

impl CandidateTally {
    pub fn fraction(&self) -> f64 {
        if self.counted_votes == 0 {
            0.0
        } else {
            self.votes_for as f64 / self.counted_votes as f64
        }
    }
}

/// Live voting progress; `decision` is set once quorum is reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteProgress {
    pub bet_id: BetId,
    pub eligible_voters: usize,
    pub votes_cast: usize,
    pub quorum: usize,
    pub option_counts: Vec<OptionCount>,
    pub candidates: Vec<CandidateTally>,
    pub decision: Option<BetOutcome>,
}

impl VoteProgress {
    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    pub fn votes_remaining(&self) -> usize {
        self.quorum.saturating_sub(self.votes_cast)
    }
}

/// Votes needed before a decision can be committed.
///
/// SELF bets are decided by one vote. Otherwise `minimum_votes_required`
/// clamped to the eligible voter count, defaulting to every eligible voter.
pub fn quorum_for(bet: &Bet, eligible_voters: usize) -> usize {
    if bet.resolution_method == ResolutionMethod::SelfResolved {
        return 1;
    }
    let ceiling = eligible_voters.max(1);
    bet.minimum_votes_required
        .map(|n| n as usize)
        .unwrap_or(ceiling)
        .clamp(1, ceiling)
}

/// Latest active vote per eligible voter
fn counted_votes<'a>(eligible: &BTreeSet<UserId>, votes: &'a [ResolutionVote]) -> Vec<&'a ResolutionVote> {
    let mut latest: BTreeMap<UserId, &ResolutionVote> = BTreeMap::new();
    for vote in votes.iter().filter(|v| v.active && eligible.contains(&v.voter_id)) {
        match latest.get(&vote.voter_id) {
            Some(existing) if existing.created_at >= vote.created_at => {}
            _ => {
                latest.insert(vote.voter_id, vote);
            }
        }
    }
    latest.into_values().collect()
}

/// Option tally for BINARY/MULTIPLE_CHOICE bets.
///
/// A unique leader wins; two or more options tied for the lead is a DRAW.
pub fn tally_options(
    option_indexes: &[u8],
    eligible: &BTreeSet<UserId>,
    votes: &[ResolutionVote],
    quorum: usize,
) -> (Vec<OptionCount>, usize, Option<BetOutcome>) {
    let counted = counted_votes(eligible, votes);

    let mut counts: BTreeMap<u8, usize> = option_indexes.iter().map(|i| (*i, 0)).collect();
    let mut cast = 0;
    for vote in &counted {
        if let VoteChoice::Option { index } = vote.choice {
            if let Some(count) = counts.get_mut(&index) {
                *count += 1;
                cast += 1;
            }
        }
    }

    let option_counts: Vec<OptionCount> = counts
        .iter()
        .map(|(index, votes)| OptionCount { index: *index, votes: *votes })
        .collect();

    if cast == 0 || cast < quorum {
        return (option_counts, cast, None);
    }

    let top = counts.values().copied().max().unwrap_or(0);
    let leaders: Vec<u8> = counts
        .iter()
        .filter(|(_, votes)| **votes == top)
        .map(|(index, _)| *index)
        .collect();

    let decision = match leaders.as_slice() {
        [single] => BetOutcome::Option { index: *single },
        _ => BetOutcome::Draw,
    };

    (option_counts, cast, Some(decision))
}

/// Winner-set tally for PREDICTION bets, evaluated per candidate.
///
/// More than half of the counted votes naming a candidate makes them a
/// winner, exactly half a draw, less a loser.
pub fn tally_winner_sets(
    candidates: &BTreeSet<UserId>,
    eligible: &BTreeSet<UserId>,
    votes: &[ResolutionVote],
    quorum: usize,
) -> (Vec<CandidateTally>, usize, Option<BetOutcome>) {
    let counted: Vec<&BTreeSet<UserId>> = counted_votes(eligible, votes)
        .into_iter()
        .filter_map(|v| match &v.choice {
            VoteChoice::WinnerSet { winners } => Some(winners),
            VoteChoice::Option { .. } => None,
        })
        .collect();
    let total = counted.len();

    let tallies: Vec<CandidateTally> = candidates
        .iter()
        .map(|candidate| {
            let votes_for = counted.iter().filter(|set| set.contains(candidate)).count();
            let verdict = match (2 * votes_for).cmp(&total) {
                std::cmp::Ordering::Greater => CandidateVerdict::Winner,
                std::cmp::Ordering::Equal if total > 0 => CandidateVerdict::Draw,
                _ => CandidateVerdict::Loser,
            };
            CandidateTally {
                user_id: *candidate,
                votes_for,
                counted_votes: total,
                verdict,
            }
        })
        .collect();

    if total == 0 || total < quorum {
        return (tallies, total, None);
    }

    let winners = tallies
        .iter()
        .filter(|t| t.verdict == CandidateVerdict::Winner)
        .map(|t| t.user_id)
        .collect();
    let draws = tallies
        .iter()
        .filter(|t| t.verdict == CandidateVerdict::Draw)
        .map(|t| t.user_id)
        .collect();

    (tallies, total, Some(BetOutcome::Predictions { winners, draws }))
}

/// Tally a bet: picks the mode from the bet type
pub fn tally(
    bet: &Bet,
    eligible: &BTreeSet<UserId>,
    votes: &[ResolutionVote],
    candidates: &BTreeSet<UserId>,
) -> VoteProgress {
    let quorum = quorum_for(bet, eligible.len());

    let (option_counts, candidate_tallies, votes_cast, decision) = match bet.bet_type {
        BetType::Binary | BetType::MultipleChoice => {
            let indexes: Vec<u8> = bet.options.iter().map(|o| o.index).collect();
            let (counts, cast, decision) = tally_options(&indexes, eligible, votes, quorum);
            (counts, Vec::new(), cast, decision)
        }
        BetType::Prediction => {
            let (tallies, cast, decision) = tally_winner_sets(candidates, eligible, votes, quorum);
            (Vec::new(), tallies, cast, decision)
        }
    };

    VoteProgress {
        bet_id: bet.id,
        eligible_voters: eligible.len(),
        votes_cast,
        quorum,
        option_counts,
        candidates: candidate_tallies,
        decision,
    }
}
